//! Crate-level Exec Session scenario (spec §8 S5), scoped to what
//! `ExecSessionMediator`'s public surface allows without a live engine:
//! `run()` takes `&bollard::Docker` directly with no fakeable transport
//! seam, so the byte-ordering property itself is exercised by `exec.rs`'s
//! own unit tests (`resize_control_message_parses` et al., against the
//! crate-private `ControlMessage` type). This test confirms the public
//! request/frame shapes S5 depends on - `TtySize`, `CallerFrame`,
//! `ExecRequest` - preserve caller-supplied bytes and ordering intent.

use bytes::Bytes;
use fleet_core::exec::{CallerFrame, ExecRequest, ExecSessionMediator, TtySize};

#[test]
fn caller_frames_preserve_their_payload() {
  let binary = CallerFrame::Binary(Bytes::from_static(b"ls\n"));
  match binary {
    CallerFrame::Binary(bytes) => assert_eq!(&bytes[..], b"ls\n"),
    CallerFrame::Text(_) => panic!("expected a binary frame"),
  }

  let text = CallerFrame::Text(r#"{"type":"resize","rows":40,"cols":132}"#.to_string());
  match text {
    CallerFrame::Text(s) => assert!(s.contains("\"rows\":40") && s.contains("\"cols\":132")),
    CallerFrame::Binary(_) => panic!("expected a text frame"),
  }
}

#[test]
fn exec_request_carries_the_caller_requested_initial_size() {
  let request = ExecRequest {
    container_id: "c1".to_string(),
    command: None,
    working_dir: None,
    initial_size: TtySize { rows: 40, cols: 132 },
  };
  assert_eq!(request.initial_size.rows, 40);
  assert_eq!(request.initial_size.cols, 132);
}

#[test]
fn mediator_is_constructible_without_a_running_session() {
  let _mediator = ExecSessionMediator::new();
  let _default = ExecSessionMediator::default();
}
