//! Container stats normalization (SPEC_FULL §2, grounded in
//! `container_stats_calculator.py` from the original source). The engine's
//! raw JSON sample already carries both the current and previous CPU
//! reading (`cpu_stats` / `precpu_stats`), so the percentage is computed
//! per-sample rather than by this provider tracking history itself.

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::ContainerStatsResponse;
use tokio_stream::StreamExt as _;

use super::{StatsEntryStream, StatsSourceProvider};
use crate::{
  error::{CoreError, CoreResult},
  model::{HostId, StatsEntry},
};

pub struct ContainerStatsProvider;

#[async_trait]
impl StatsSourceProvider for ContainerStatsProvider {
  #[tracing::instrument("ContainerStatsStream", skip(self, docker), fields(host_id = %host_id, container_id = %source_id))]
  async fn stream(
    &self,
    docker: &Docker,
    host_id: &HostId,
    source_id: &str,
  ) -> CoreResult<StatsEntryStream> {
    let options = bollard::query_parameters::StatsOptions {
      stream: true,
      one_shot: false,
    };
    let host_id = host_id.clone();
    let short_id: String = source_id.chars().take(12).collect();
    let raw = docker.stats(source_id, Some(options));
    let mapped = raw.map(move |item| match item {
      Ok(sample) => Ok(normalize(&host_id, &short_id, &sample)),
      Err(e) => Err(CoreError::engine(e)),
    });
    Ok(Box::pin(mapped))
  }
}

fn normalize(
  host_id: &HostId,
  source_id: &str,
  sample: &ContainerStatsResponse,
) -> StatsEntry {
  StatsEntry {
    timestamp: sample
      .read
      .as_deref()
      .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
      .map(|dt| dt.with_timezone(&chrono::Utc))
      .unwrap_or_else(chrono::Utc::now),
    source_id: source_id.to_string(),
    host_id: host_id.clone(),
    cpu_percent: cpu_percent(sample),
    memory_used_bytes: memory_used(sample),
    memory_limit_bytes: sample
      .memory_stats
      .as_ref()
      .and_then(|m| m.limit)
      .unwrap_or(0),
    network_rx_bytes: network_total(sample, |n| n.rx_bytes),
    network_tx_bytes: network_total(sample, |n| n.tx_bytes),
    block_read_bytes: blkio_total(sample, "read"),
    block_write_bytes: blkio_total(sample, "write"),
  }
}

/// `(cpu_delta / system_delta) * online_cpus * 100`, the same formula the
/// `docker stats` CLI uses. Returns 0 rather than dividing by zero on the
/// very first sample, where `precpu_stats` is still empty.
fn cpu_percent(sample: &ContainerStatsResponse) -> f64 {
  let (Some(cpu), Some(precpu)) = (&sample.cpu_stats, &sample.precpu_stats)
  else {
    return 0.0;
  };
  let total_usage = cpu
    .cpu_usage
    .as_ref()
    .and_then(|u| u.total_usage)
    .unwrap_or(0) as f64;
  let pretotal_usage = precpu
    .cpu_usage
    .as_ref()
    .and_then(|u| u.total_usage)
    .unwrap_or(0) as f64;
  let system_usage = cpu.system_cpu_usage.unwrap_or(0) as f64;
  let presystem_usage = precpu.system_cpu_usage.unwrap_or(0) as f64;

  let cpu_delta = total_usage - pretotal_usage;
  let system_delta = system_usage - presystem_usage;
  if system_delta <= 0.0 || cpu_delta < 0.0 {
    return 0.0;
  }

  let online_cpus = cpu
    .online_cpus
    .filter(|n| *n > 0)
    .or_else(|| {
      cpu
        .cpu_usage
        .as_ref()
        .and_then(|u| u.percpu_usage.as_ref())
        .map(|v| v.len() as u64)
    })
    .unwrap_or(1) as f64;

  (cpu_delta / system_delta) * online_cpus * 100.0
}

/// Usage minus page cache, matching the CLI's "don't count reclaimable
/// cache as working memory" adjustment.
fn memory_used(sample: &ContainerStatsResponse) -> u64 {
  let Some(mem) = &sample.memory_stats else {
    return 0;
  };
  let usage = mem.usage.unwrap_or(0);
  let cache = mem
    .stats
    .as_ref()
    .and_then(|s| s.cache)
    .unwrap_or(0);
  usage.saturating_sub(cache)
}

fn network_total(
  sample: &ContainerStatsResponse,
  field: impl Fn(&bollard::models::ContainerNetworkStats) -> Option<u64>,
) -> u64 {
  sample
    .networks
    .as_ref()
    .map(|networks| networks.values().filter_map(&field).sum())
    .unwrap_or(0)
}

fn blkio_total(sample: &ContainerStatsResponse, op: &str) -> u64 {
  sample
    .blkio_stats
    .as_ref()
    .and_then(|b| b.io_service_bytes_recursive.as_ref())
    .map(|entries| {
      entries
        .iter()
        .filter(|e| {
          e.op
            .as_deref()
            .map(|o| o.eq_ignore_ascii_case(op))
            .unwrap_or(false)
        })
        .filter_map(|e| e.value)
        .sum()
    })
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use bollard::models::{
    ContainerCpuStats, ContainerCpuUsage, ContainerMemoryStats,
  };

  fn sample_with_cpu(total: i64, pretotal: i64, system: i64, presystem: i64) -> ContainerStatsResponse {
    ContainerStatsResponse {
      cpu_stats: Some(ContainerCpuStats {
        cpu_usage: Some(ContainerCpuUsage {
          total_usage: Some(total),
          percpu_usage: None,
          usage_in_kernelmode: None,
          usage_in_usermode: None,
        }),
        system_cpu_usage: Some(system),
        online_cpus: Some(2),
        throttling_data: None,
      }),
      precpu_stats: Some(ContainerCpuStats {
        cpu_usage: Some(ContainerCpuUsage {
          total_usage: Some(pretotal),
          percpu_usage: None,
          usage_in_kernelmode: None,
          usage_in_usermode: None,
        }),
        system_cpu_usage: Some(presystem),
        online_cpus: Some(2),
        throttling_data: None,
      }),
      memory_stats: Some(ContainerMemoryStats {
        usage: Some(1024),
        limit: Some(4096),
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  #[test]
  fn computes_cpu_percent_from_deltas() {
    let sample = sample_with_cpu(2_200, 2_000, 20_000, 10_000);
    let percent = cpu_percent(&sample);
    assert!((percent - 4.0).abs() < 0.001);
  }

  #[test]
  fn zero_system_delta_yields_zero_percent() {
    let sample = sample_with_cpu(2_200, 2_000, 10_000, 10_000);
    assert_eq!(cpu_percent(&sample), 0.0);
  }

  #[test]
  fn memory_used_subtracts_cache() {
    let mut sample = sample_with_cpu(0, 0, 0, 0);
    sample.memory_stats = Some(ContainerMemoryStats {
      usage: Some(1000),
      limit: Some(4096),
      stats: None,
      ..Default::default()
    });
    assert_eq!(memory_used(&sample), 1000);
  }
}
