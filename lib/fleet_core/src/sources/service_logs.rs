//! Swarm service logs (spec §4.6), and the host-syslog source (SPEC_FULL §2
//! HostSyslog open question): the Docker Engine API has no native "host
//! syslog" endpoint, so host-level log sources are modeled as a container
//! log stream from whatever log-shipping sidecar is bind-mounting the
//! host's log files - same underlying mechanism, different `SourceType` tag.

use async_trait::async_trait;
use bollard::Docker;
use tokio_stream::StreamExt as _;

use super::{LogEntryStream, LogSourceProvider, SourceOptions, split_timestamp};
use crate::{
  error::{CoreError, CoreResult},
  model::{HostId, LogEntry, LogLevel, SourceType},
};

pub struct ServiceLogsProvider;

#[async_trait]
impl LogSourceProvider for ServiceLogsProvider {
  fn source_type(&self) -> SourceType {
    SourceType::SwarmService
  }

  #[tracing::instrument("ServiceLogsStream", skip(self, docker), fields(host_id = %host_id, service_id = %source_id))]
  async fn stream(
    &self,
    docker: &Docker,
    host_id: &HostId,
    source_id: &str,
    opts: SourceOptions,
  ) -> CoreResult<LogEntryStream> {
    let options = bollard::query_parameters::LogsOptions {
      follow: opts.follow,
      stdout: true,
      stderr: true,
      since: opts.since.unwrap_or(0) as i32,
      until: opts.until.unwrap_or(0) as i32,
      timestamps: true,
      tail: opts.tail.unwrap_or_else(|| "all".to_string()),
    };

    let host_id = host_id.clone();
    let service_id = source_id.to_string();
    let raw = docker.service_logs(source_id, Some(options));
    let mapped = raw.map(move |item| match item {
      Ok(output) => Ok(normalize(&host_id, &service_id, output)),
      Err(e) => Err(CoreError::engine(e)),
    });
    Ok(Box::pin(mapped))
  }
}

/// Wraps [`super::container_logs::ContainerLogsProvider`], tagging entries
/// as [`SourceType::HostSyslog`] instead of `SourceType::Container`: the
/// transport is identical, only the classification differs.
pub struct HostSyslogProvider {
  inner: super::container_logs::ContainerLogsProvider,
}

impl HostSyslogProvider {
  pub fn new() -> Self {
    HostSyslogProvider {
      inner: super::container_logs::ContainerLogsProvider,
    }
  }
}

impl Default for HostSyslogProvider {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl LogSourceProvider for HostSyslogProvider {
  fn source_type(&self) -> SourceType {
    SourceType::HostSyslog
  }

  async fn stream(
    &self,
    docker: &Docker,
    host_id: &HostId,
    source_id: &str,
    opts: SourceOptions,
  ) -> CoreResult<LogEntryStream> {
    let inner = self.inner.stream(docker, host_id, source_id, opts).await?;
    Ok(Box::pin(tokio_stream::StreamExt::map(inner, |item| {
      item.map(|mut entry| {
        entry.source_type = SourceType::HostSyslog;
        entry
      })
    })))
  }
}

/// Docker service logs prefix every line with `<service>.<slot>.<task-id>@
/// <node>    | <message>` when multiple tasks are running; splits that
/// prefix into a `task` metadata field, leaving `message` as just the
/// application's own line (spec §4.6 "optional task tag parsed from a
/// `task | message` prefix").
fn normalize(
  host_id: &HostId,
  service_id: &str,
  output: bollard::container::LogOutput,
) -> LogEntry {
  let raw_bytes = output.into_bytes();
  let raw = String::from_utf8_lossy(&raw_bytes).trim_end().to_string();
  let (timestamp, rest) = split_timestamp(&raw);

  let (task, message) = match rest.split_once('|') {
    Some((task, message)) => (Some(task.trim().to_string()), message.trim()),
    None => (None, rest.trim()),
  };

  let mut metadata = serde_json::json!({
    "service_id": service_id,
  });
  if let Some(task) = &task {
    metadata["task"] = serde_json::Value::String(task.clone());
  }

  LogEntry {
    timestamp,
    source_type: SourceType::SwarmService,
    source_id: service_id.to_string(),
    host_id: host_id.clone(),
    level: LogLevel::detect(message),
    message: message.to_string(),
    metadata,
    raw,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_task_tag_prefix_from_message() {
    let output = bollard::container::LogOutput::StdOut {
      message: bytes::Bytes::from_static(
        b"2024-01-01T00:00:00.000000000Z web.1.abcdef@node-1    | request failed\n",
      ),
    };
    let entry = normalize(&"h1".to_string(), "svc1", output);
    assert_eq!(entry.message, "request failed");
    assert_eq!(entry.metadata["task"], "web.1.abcdef@node-1");
    assert_eq!(entry.level, LogLevel::Error);
  }

  #[test]
  fn tolerates_missing_task_tag() {
    let output = bollard::container::LogOutput::StdOut {
      message: bytes::Bytes::from_static(b"no task prefix here\n"),
    };
    let entry = normalize(&"h1".to_string(), "svc1", output);
    assert_eq!(entry.message, "no task prefix here");
    assert!(entry.metadata.get("task").is_none());
  }
}
