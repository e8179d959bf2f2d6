//! Local filesystem helpers

pub mod staging;
