//! Data model shared across the core (spec §3). Host/credential/grant
//! records are owned by an external persistence collaborator; the core only
//! reads them through [`crate::repository::HostRepository`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub type HostId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionKind {
  UnixSocket,
  TcpPlain,
  TcpTls,
  Ssh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SwarmRole {
  #[default]
  Standalone,
  Manager,
  Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthStatus {
  #[default]
  Unknown,
  Healthy,
  Unhealthy,
}

#[derive(Debug, Clone, Default)]
pub struct SwarmMembership {
  pub cluster_id: Option<String>,
  pub role: SwarmRole,
  pub is_leader: bool,
}

/// Host record, owned externally, read by the core (§3 "Host record").
#[derive(Debug, Clone)]
pub struct Host {
  pub id: HostId,
  pub name: String,
  pub kind: ConnectionKind,
  /// unix path, `host:port`, or `user@host:port` depending on `kind`.
  pub endpoint: String,
  pub active: bool,
  pub default: bool,
  pub health: HealthStatus,
  pub last_seen_engine_version: Option<String>,
  pub swarm: SwarmMembership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CredentialKind {
  TlsCa,
  TlsCert,
  TlsKey,
  SshPrivateKey,
  SshPassphrase,
  SshPassword,
  SshUser,
  SshKnownHosts,
}

/// Opaque ciphertext as read from the persistence collaborator. Decrypted
/// only inside the Credential Store / Transport Dialer, never retained past
/// handle creation (§4.1 invariant).
#[derive(Clone)]
pub struct EncryptedCredential {
  pub host_id: HostId,
  pub kind: CredentialKind,
  pub ciphertext: Vec<u8>,
}

impl fmt::Debug for EncryptedCredential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EncryptedCredential")
      .field("host_id", &self.host_id)
      .field("kind", &self.kind)
      .field("ciphertext", &"<redacted>")
      .finish()
  }
}

/// Decrypted secret bytes. Callers must not log, persist, or echo these.
/// `Drop` does not zeroize deliberately — the credential byte content here
/// is short-lived plaintext (TLS PEM / SSH key material) passed straight
/// into the Transport Dialer's connection setup and then dropped; adding
/// zeroize would be cosmetic without a broader no-swap guarantee, so we
/// keep this crate's crypto surface to what spec §4.1 actually requires.
pub struct SecretBytes(pub Vec<u8>);

impl fmt::Debug for SecretBytes {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("SecretBytes(<redacted>)")
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
  Viewer,
  Operator,
  Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionLevel {
  Viewer,
  Operator,
  Admin,
}

/// (user id, host id, level) grant (§3 "Permission grant").
#[derive(Debug, Clone)]
pub struct Grant {
  pub user_id: UserId,
  pub host_id: HostId,
  pub level: PermissionLevel,
}

#[derive(Debug, Clone)]
pub struct User {
  pub id: UserId,
  pub global_role: Option<Role>,
}

impl User {
  pub fn is_global_admin(&self) -> bool {
    matches!(self.global_role, Some(Role::Admin))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
  Debug,
  Info,
  Warning,
  Error,
  Critical,
  Unknown,
}

impl LogLevel {
  /// Case-insensitive keyword detection (§4.6).
  pub fn detect(line: &str) -> LogLevel {
    let lower = line.to_ascii_lowercase();
    let has = |needle: &str| lower.contains(needle);
    if has("critical") || has("fatal") || has("panic") {
      LogLevel::Critical
    } else if has("error") || has("err") || has("fail") {
      LogLevel::Error
    } else if has("warn") {
      LogLevel::Warning
    } else if has("debug") || has("trace") {
      LogLevel::Debug
    } else if has("info") || has("notice") {
      LogLevel::Info
    } else {
      LogLevel::Info
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceType {
  Container,
  SwarmService,
  HostSyslog,
}

/// Normalized log entry (§3 "Log entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
  pub timestamp: chrono::DateTime<chrono::Utc>,
  pub source_type: SourceType,
  pub source_id: String,
  pub host_id: HostId,
  pub level: LogLevel,
  pub message: String,
  pub metadata: serde_json::Value,
  pub raw: String,
}

/// Normalized stats sample, the stats-side analog of `LogEntry` (SPEC_FULL
/// §2 container stats normalization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsEntry {
  pub timestamp: chrono::DateTime<chrono::Utc>,
  pub source_id: String,
  pub host_id: HostId,
  pub cpu_percent: f64,
  pub memory_used_bytes: u64,
  pub memory_limit_bytes: u64,
  pub network_rx_bytes: u64,
  pub network_tx_bytes: u64,
  pub block_read_bytes: u64,
  pub block_write_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContainerState {
  Created,
  Running,
  Paused,
  Exited,
  Removed,
}

/// Swarm host role transition, observed not effected (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwarmRoleTransition {
  pub from: SwarmRole,
  pub to: SwarmRole,
}

/// Normalized container record, the Operation Executor's container-domain
/// return shape (§4.11 "a small normalized record... plus the resolved
/// host id").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
  pub host_id: HostId,
  pub id: String,
  pub name: String,
  pub image: String,
  pub state: ContainerState,
  pub status: String,
  pub labels: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
  pub host_id: HostId,
  pub id: String,
  pub tags: Vec<String>,
  pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSummary {
  pub host_id: HostId,
  pub name: String,
  pub driver: String,
  pub mountpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSummary {
  pub host_id: HostId,
  pub id: String,
  pub name: String,
  pub driver: String,
  pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSummary {
  pub host_id: HostId,
  pub id: String,
  pub name: String,
  pub image: String,
  pub replicas_desired: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
  pub host_id: HostId,
  pub id: String,
  pub hostname: String,
  pub role: SwarmRole,
  pub availability: String,
  pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSummary {
  pub host_id: HostId,
  pub id: String,
  pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
  pub host_id: HostId,
  pub id: String,
  pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSummary {
  pub host_id: HostId,
  pub containers: u64,
  pub containers_running: u64,
  pub images: u64,
  pub server_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskUsage {
  pub host_id: HostId,
  pub images_bytes: u64,
  pub containers_bytes: u64,
  pub volumes_bytes: u64,
}

/// A disposed resource count from a `prune` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneResult {
  pub host_id: HostId,
  pub deleted_ids: Vec<String>,
  pub space_reclaimed_bytes: u64,
}
