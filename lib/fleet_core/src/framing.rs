//! Streaming frame envelope (spec §6 "Streaming framing"): the
//! language-agnostic wire shape an external HTTP/WS collaborator
//! serializes to callers. Internal plumbing ([`crate::multiplexer::Frame`],
//! [`crate::events::EnrichedEvent`]) converts into this at the boundary.

use serde::Serialize;

use crate::{events::EnrichedEvent, model::LogEntry, model::StatsEntry, multiplexer::Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FrameType {
  Connected,
  Log,
  Stats,
  Event,
  StreamEnd,
  Error,
  Heartbeat,
  Ping,
  Pong,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireFrame<P: Serialize> {
  #[serde(rename = "type")]
  pub frame_type: FrameType,
  pub timestamp: chrono::DateTime<chrono::Utc>,
  pub payload: Option<P>,
}

impl<P: Serialize> WireFrame<P> {
  pub fn connected() -> Self {
    WireFrame {
      frame_type: FrameType::Connected,
      timestamp: chrono::Utc::now(),
      payload: None,
    }
  }

  pub fn heartbeat() -> Self {
    WireFrame {
      frame_type: FrameType::Heartbeat,
      timestamp: chrono::Utc::now(),
      payload: None,
    }
  }

  pub fn stream_end() -> Self {
    WireFrame {
      frame_type: FrameType::StreamEnd,
      timestamp: chrono::Utc::now(),
      payload: None,
    }
  }

  pub fn error(message: impl Into<String>) -> WireFrame<ErrorPayload> {
    WireFrame {
      frame_type: FrameType::Error,
      timestamp: chrono::Utc::now(),
      payload: Some(ErrorPayload { message: message.into() }),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
  pub message: String,
}

/// Converts a data entry to JSON and carries it as the frame payload; lets
/// `log_frame`/`stats_frame` return one concrete `WireFrame` type across
/// the `Data`/`Heartbeat`/`Error`/`End` cases instead of fixing `P` to the
/// entry type and losing the ability to carry an `ErrorPayload` instead.
fn data_frame<T: Serialize>(frame_type: FrameType, timestamp: chrono::DateTime<chrono::Utc>, entry: T) -> WireFrame<serde_json::Value> {
  WireFrame {
    frame_type,
    timestamp,
    payload: Some(serde_json::to_value(entry).unwrap_or(serde_json::Value::Null)),
  }
}

/// Mid-flight upstream failures surface as a terminal `error` frame, not a
/// clean `stream_end` (spec §7 "the Multiplexer converts upstream
/// exceptions into a terminal `stream_error` frame"; §4.7 "cancelling the
/// upstream ... terminates all subscribers with a terminal error frame").
pub fn log_frame(frame: Frame<LogEntry>) -> WireFrame<serde_json::Value> {
  match frame {
    Frame::Data(entry) => data_frame(FrameType::Log, entry.timestamp, entry),
    Frame::Heartbeat => WireFrame::heartbeat(),
    Frame::Error(message) => data_frame(FrameType::Error, chrono::Utc::now(), ErrorPayload { message }),
    Frame::End => WireFrame::stream_end(),
  }
}

pub fn stats_frame(frame: Frame<StatsEntry>) -> WireFrame<serde_json::Value> {
  match frame {
    Frame::Data(entry) => data_frame(FrameType::Stats, entry.timestamp, entry),
    Frame::Heartbeat => WireFrame::heartbeat(),
    Frame::Error(message) => data_frame(FrameType::Error, chrono::Utc::now(), ErrorPayload { message }),
    Frame::End => WireFrame::stream_end(),
  }
}

pub fn event_frame(event: EnrichedEvent) -> WireFrame<EnrichedEventPayload> {
  WireFrame {
    frame_type: FrameType::Event,
    timestamp: event.timestamp,
    payload: Some(EnrichedEventPayload {
      host_id: event.host_id,
      event_type: event.event_type,
      action: event.action,
      actor_id: event.actor_id,
      name: event.name,
      labels: event.labels,
    }),
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichedEventPayload {
  pub host_id: String,
  pub event_type: String,
  pub action: String,
  pub actor_id: Option<String>,
  pub name: Option<String>,
  pub labels: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn error_frame_carries_message() {
    let frame = WireFrame::<()>::error("boom");
    assert_eq!(frame.payload.unwrap().message, "boom");
    assert_eq!(frame.frame_type, FrameType::Error);
  }

  #[test]
  fn data_frame_maps_to_log_type() {
    let entry = LogEntry {
      timestamp: chrono::Utc::now(),
      source_type: crate::model::SourceType::Container,
      source_id: "abc".to_string(),
      host_id: "h1".to_string(),
      level: crate::model::LogLevel::Info,
      message: "hello".to_string(),
      metadata: serde_json::Value::Null,
      raw: "hello".to_string(),
    };
    let wire = log_frame(Frame::Data(entry));
    assert_eq!(wire.frame_type, FrameType::Log);
  }

  #[test]
  fn upstream_failure_maps_to_error_frame_not_stream_end() {
    let wire = log_frame(Frame::Error("upstream exploded".to_string()));
    assert_eq!(wire.frame_type, FrameType::Error);
    assert_eq!(wire.payload.unwrap()["message"], "upstream exploded");

    let wire = stats_frame(Frame::Error("upstream exploded".to_string()));
    assert_eq!(wire.frame_type, FrameType::Error);
    assert_eq!(wire.payload.unwrap()["message"], "upstream exploded");
  }

  #[test]
  fn clean_end_still_maps_to_stream_end() {
    let wire = log_frame(Frame::End);
    assert_eq!(wire.frame_type, FrameType::StreamEnd);
  }
}
