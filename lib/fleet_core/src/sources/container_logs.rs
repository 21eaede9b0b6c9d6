//! Container logs (spec §4.6). Normalizes `docker logs --follow` output
//! into [`LogEntry`] records, tagging each with a short container-id prefix.

use async_trait::async_trait;
use bollard::Docker;
use tokio_stream::StreamExt as _;

use super::{LogEntryStream, LogSourceProvider, SourceOptions, split_timestamp};
use crate::{
  error::{CoreError, CoreResult},
  model::{HostId, LogEntry, LogLevel, SourceType},
};

const SHORT_ID_LEN: usize = 12;

pub struct ContainerLogsProvider;

#[async_trait]
impl LogSourceProvider for ContainerLogsProvider {
  fn source_type(&self) -> SourceType {
    SourceType::Container
  }

  #[tracing::instrument("ContainerLogsStream", skip(self, docker), fields(host_id = %host_id, container_id = %source_id))]
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
    let short_id: String = source_id.chars().take(SHORT_ID_LEN).collect();
    let raw = docker.logs(source_id, Some(options));
    let mapped = raw.map(move |item| match item {
      Ok(output) => Ok(normalize(&host_id, &short_id, output)),
      Err(e) => Err(CoreError::engine(e)),
    });
    Ok(Box::pin(mapped))
  }
}

fn normalize(
  host_id: &HostId,
  short_id: &str,
  output: bollard::container::LogOutput,
) -> LogEntry {
  let raw_bytes = output.into_bytes();
  let raw = String::from_utf8_lossy(&raw_bytes).trim_end().to_string();
  let (timestamp, message) = split_timestamp(&raw);

  LogEntry {
    timestamp,
    source_type: SourceType::Container,
    source_id: short_id.to_string(),
    host_id: host_id.clone(),
    level: LogLevel::detect(message),
    message: message.to_string(),
    metadata: serde_json::json!({ "container_id_prefix": short_id }),
    raw,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalizes_timestamped_line_into_entry() {
    let output = bollard::container::LogOutput::StdOut {
      message: bytes::Bytes::from_static(
        b"2024-01-01T00:00:00.000000000Z container failed to start\n",
      ),
    };
    let entry = normalize(&"h1".to_string(), "abc123def456", output);
    assert_eq!(entry.message, "container failed to start");
    assert_eq!(entry.level, LogLevel::Error);
    assert_eq!(entry.source_id, "abc123def456");
  }

  #[test]
  fn stamps_now_when_no_leading_timestamp() {
    let output = bollard::container::LogOutput::StdErr {
      message: bytes::Bytes::from_static(b"plain line with no timestamp\n"),
    };
    let entry = normalize(&"h1".to_string(), "abc123def456", output);
    assert_eq!(entry.message, "plain line with no timestamp");
  }
}
