//! Orchestrator API models

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Generic error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    pub code: String,
}

/// Generic acknowledgement body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ================================ DEPLOYMENTS ==================================== //

/// `POST /deployments`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[serde(default)]
    pub system_id: Option<i64>,
    pub project_id: i64,
    pub package_id: i64,
    pub target_id: i64,
}

/// One entry of a deployment's step log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub key: String,
    pub label: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    pub created_at: i64,
}

/// Result of `POST /deployments`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub ok: bool,
    pub deployment_id: i64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepView>,
}

/// Result of `POST /deployments/{id}/rollback`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_deployment_id: Option<i64>,
    pub original_deployment_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_release_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub steps: Vec<StepView>,
}

/// A deployment with its step log, as returned by the history and detail routes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentView {
    pub id: i64,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<i64>,
    pub status: String,
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub release_path: Option<String>,
    #[serde(default)]
    pub current_link: Option<String>,
    #[serde(default)]
    pub system_id: Option<i64>,
    pub project_id: i64,
    pub project_name: String,
    pub package_id: i64,
    pub package_name: String,
    pub target_id: i64,
    pub target_name: String,
    pub steps: Vec<StepView>,
}

// ================================== CONTROL ====================================== //

/// `POST /control/start`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlStartRequest {
    pub target_id: i64,
    pub workdir: String,
    #[serde(default)]
    pub jar_path: Option<String>,
    #[serde(default)]
    pub start_script: Option<String>,
    #[serde(default)]
    pub java_opts: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub log_file: Option<String>,
}

/// Result of `POST /control/start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlStartResponse {
    pub pid: Option<u32>,
    pub status: String,
    pub log_file: Option<String>,
}

/// `POST /control/stop`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlStopRequest {
    pub target_id: i64,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub stop_script: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Result of `POST /control/stop`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlStopResponse {
    pub ok: bool,
    /// `stopped` or `not_running`
    pub outcome: String,
}

/// Query for `GET /control/logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsQuery {
    pub target_id: i64,
    pub path: String,
    #[serde(default = "default_log_lines")]
    pub lines: u32,
    #[serde(default)]
    pub follow: bool,
}

fn default_log_lines() -> u32 {
    200
}

// ================================== TARGETS ====================================== //

/// A process on a target, from `GET /targets/{id}/processes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Query for `GET /targets/{id}/processes`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessQuery {
    #[serde(default)]
    pub filter: Option<String>,
}

/// `PUT /targets/{id}/credentials`
#[derive(Debug, Clone, Deserialize)]
pub struct TargetCredentialsRequest {
    pub auth_type: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Target as exposed over HTTP; credential material is never included
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub root_path: String,
    pub env: String,
    pub auth_type: String,
    pub has_password: bool,
    pub has_private_key: bool,
}

/// One host to probe with `POST /targets/test-ssh`
#[derive(Debug, Clone, Deserialize)]
pub struct SshTestTarget {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port", deserialize_with = "deserialize_port")]
    pub ssh_port: u32,
    #[serde(default)]
    pub auth_type: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Single-probe timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u32 {
    22
}

/// Accepts the port as an integer or a numeric string; range is checked by the handler
fn deserialize_port<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct PortVisitor;

    impl<'de> Visitor<'de> for PortVisitor {
        type Value = u32;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a port number as integer or string")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u32::try_from(v).map_err(|_| E::custom(format!("port {} out of range", v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u32::try_from(v).map_err(|_| E::custom(format!("port {} out of range", v)))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            v.trim()
                .parse::<u32>()
                .map_err(|_| E::custom(format!("invalid port string: {}", v)))
        }
    }

    deserializer.deserialize_any(PortVisitor)
}

/// Batched probe request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshBatchRequest {
    pub targets: Vec<SshTestTarget>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,
}

fn default_probe_timeout_ms() -> u64 {
    6000
}

fn default_probe_concurrency() -> usize {
    5
}

/// Body of `POST /targets/test-ssh`: a batch when `targets` is present, a single host otherwise
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SshTestRequest {
    Batch(SshBatchRequest),
    Single(SshTestTarget),
}

/// Per-host probe result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshTestResult {
    pub host: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `auth`, `timeout`, `unreachable` or `invalid`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTestSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshBatchResponse {
    pub results: Vec<SshTestResult>,
    pub summary: SshTestSummary,
}
