//! Log/Stats Source Providers (spec §4.6). Each concrete provider opens the
//! engine's native stream for one resource kind and normalizes every raw
//! item into this crate's own entry shape before handing it to the Stream
//! Multiplexer - callers never see a raw `bollard::container::LogOutput` or
//! `ContainerStatsResponse`.

pub mod container_logs;
pub mod container_stats;
pub mod service_logs;

use std::pin::Pin;

use async_trait::async_trait;
use bollard::Docker;
use tokio_stream::Stream;

use crate::{
  error::CoreResult,
  model::{HostId, LogEntry, SourceType, StatsEntry},
};

/// Options shared by every log source (spec §4.6 "Options include follow,
/// tail, since, until, timestamps").
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
  pub follow: bool,
  pub tail: Option<String>,
  pub since: Option<i64>,
  pub until: Option<i64>,
  pub timestamps: bool,
}

pub type LogEntryStream = Pin<Box<dyn Stream<Item = CoreResult<LogEntry>> + Send>>;
pub type StatsEntryStream = Pin<Box<dyn Stream<Item = CoreResult<StatsEntry>> + Send>>;

/// A source of normalized log lines for one resource kind. The iterator
/// returned by `stream` is finite when `opts.follow` is false, infinite
/// when true, not restartable, and cancellable by dropping it (spec §4.6).
#[async_trait]
pub trait LogSourceProvider: Send + Sync {
  fn source_type(&self) -> SourceType;

  async fn stream(
    &self,
    docker: &Docker,
    host_id: &HostId,
    source_id: &str,
    opts: SourceOptions,
  ) -> CoreResult<LogEntryStream>;
}

/// A source of normalized stats samples (SPEC_FULL §2 container stats
/// normalization), same shape as `LogSourceProvider` but over `StatsEntry`.
#[async_trait]
pub trait StatsSourceProvider: Send + Sync {
  async fn stream(
    &self,
    docker: &Docker,
    host_id: &HostId,
    source_id: &str,
  ) -> CoreResult<StatsEntryStream>;
}

/// Parses a line docker prefixed with an RFC3339Nano timestamp (the
/// `timestamps: true` log option format: `<ts> <rest>`). Falls back to the
/// whole line with `now` when no leading timestamp parses, matching the
/// "parse leading RFC3339 timestamp if present else stamp with now" rule.
pub(crate) fn split_timestamp(
  raw: &str,
) -> (chrono::DateTime<chrono::Utc>, &str) {
  if let Some((ts, rest)) = raw.split_once(' ') {
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(ts) {
      return (parsed.with_timezone(&chrono::Utc), rest);
    }
  }
  (chrono::Utc::now(), raw)
}
