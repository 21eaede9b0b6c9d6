use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

mod otel;

/// stdout/stderr format.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Pretty,
  Json,
  None,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: LogLevel,
  pub stdio: StdioLogMode,
  pub location: bool,
  pub ansi: bool,
  /// Empty disables OTLP export.
  pub otlp_endpoint: String,
  pub otel_service_name: String,
  pub otel_scope_name: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    LogConfig {
      level: LogLevel::Info,
      stdio: StdioLogMode::default(),
      location: false,
      ansi: true,
      otlp_endpoint: String::new(),
      otel_service_name: "fleet-core".to_string(),
      otel_scope_name: "fleet-core".to_string(),
    }
  }
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
  Trace,
  Debug,
  #[default]
  Info,
  Warn,
  Error,
}

impl From<LogLevel> for tracing::Level {
  fn from(value: LogLevel) -> Self {
    match value {
      LogLevel::Trace => tracing::Level::TRACE,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Error => tracing::Level::ERROR,
    }
  }
}

/// Initialize the global tracing subscriber. Must be called once, at
/// process startup, before any `#[instrument]`ed call runs.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let registry =
    Registry::default().with(LevelFilter::from(log_level));

  let use_otel = !config.otlp_endpoint.is_empty();

  match (config.stdio, use_otel) {
    (StdioLogMode::Pretty, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(config.location)
          .with_line_number(config.location)
          .with_ansi(config.ansi),
      )
      .with(otel::layer(config))
      .try_init(),
    (StdioLogMode::Pretty, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(config.location)
          .with_line_number(config.location)
          .with_ansi(config.ansi),
      )
      .try_init(),
    (StdioLogMode::Standard, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(config.location)
          .with_line_number(config.location)
          .with_ansi(config.ansi),
      )
      .with(otel::layer(config))
      .try_init(),
    (StdioLogMode::Standard, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(config.location)
          .with_line_number(config.location)
          .with_ansi(config.ansi),
      )
      .try_init(),
    (StdioLogMode::Json, true) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .with(otel::layer(config))
      .try_init(),
    (StdioLogMode::Json, false) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    (StdioLogMode::None, true) => {
      registry.with(otel::layer(config)).try_init()
    }
    (StdioLogMode::None, false) => Ok(()),
  }
  .context("failed to init logger")
}
