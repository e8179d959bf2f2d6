mod harness;
mod test_api;
mod test_command;
mod test_pipeline;
mod test_probe;
mod test_rollback;
mod test_vault;
