//! Exec Session Mediator (spec §4.8). Proxies one interactive shell session
//! between a caller-supplied bidirectional byte channel and a Docker exec
//! instance: binary frames are forwarded as raw terminal bytes, textual
//! frames are parsed as JSON control messages (currently just `resize`),
//! anything else textual is forwarded as if it were binary. Mirrors the
//! teacher's PTY-forwarding shape in `bin/periphery/src/terminal.rs` /
//! `bin/core/src/ws/terminal.rs` (cancellation-token-gated select loop
//! ferrying bytes both ways) with the PTY replaced by a Docker exec
//! instance.

use bollard::Docker;
use bollard::exec::{
  CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};

/// Fixed probe order for auto-detecting a usable shell when the caller
/// doesn't specify one (spec §4.8).
const SHELL_PROBES: [&str; 4] = ["/bin/bash", "/bin/sh", "bash", "sh"];

#[derive(Debug, Clone)]
pub enum CallerFrame {
  Binary(Bytes),
  Text(String),
}

#[derive(Debug, Clone, Copy)]
pub struct TtySize {
  pub rows: u16,
  pub cols: u16,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
  Resize { rows: u16, cols: u16 },
}

pub struct ExecRequest {
  pub container_id: String,
  pub command: Option<String>,
  pub working_dir: Option<String>,
  pub initial_size: TtySize,
}

pub struct ExecSessionMediator;

impl ExecSessionMediator {
  pub fn new() -> Self {
    ExecSessionMediator
  }

  /// Runs one exec session to completion. Returns once either side closes;
  /// both directions are cancelled together and the exec handle is
  /// dropped (spec §4.8 "Termination"). Callers are responsible for
  /// checking operator-level permission before calling this (spec §4.8
  /// "Operator-level permission is required").
  #[tracing::instrument("ExecSessionRun", skip(self, docker, from_caller, to_caller), fields(container_id = %request.container_id))]
  pub async fn run(
    &self,
    docker: &Docker,
    request: ExecRequest,
    mut from_caller: mpsc::Receiver<CallerFrame>,
    to_caller: mpsc::Sender<CallerFrame>,
    cancel: CancellationToken,
  ) -> CoreResult<()> {
    let shell = match request.command {
      Some(command) => command,
      None => detect_shell(docker, &request.container_id).await?,
    };

    let exec = docker
      .create_exec(
        &request.container_id,
        CreateExecOptions {
          cmd: Some(vec![shell]),
          attach_stdin: Some(true),
          attach_stdout: Some(true),
          attach_stderr: Some(true),
          tty: Some(true),
          working_dir: request.working_dir,
          ..Default::default()
        },
      )
      .await
      .map_err(CoreError::engine)?;

    let attached = docker
      .start_exec(
        &exec.id,
        Some(StartExecOptions {
          detach: false,
          tty: true,
          ..Default::default()
        }),
      )
      .await
      .map_err(CoreError::engine)?;

    let StartExecResults::Attached {
      mut output,
      mut input,
    } = attached
    else {
      return Err(CoreError::engine(anyhow::anyhow!(
        "exec start returned a detached result for an attached request"
      )));
    };

    let _ = docker
      .resize_exec(
        &exec.id,
        ResizeExecOptions {
          height: request.initial_size.rows,
          width: request.initial_size.cols,
        },
      )
      .await;

    // Nudges the shell into printing its prompt immediately rather than
    // waiting for the caller's first keystroke (spec §4.8).
    input.write_all(b"\n").await.map_err(CoreError::transport)?;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        item = output.next() => {
          match item {
            Some(Ok(chunk)) => {
              if to_caller.send(CallerFrame::Binary(chunk.into_bytes())).await.is_err() {
                cancel.cancel();
                break;
              }
            }
            Some(Err(e)) => {
              let _ = to_caller.send(CallerFrame::Text(format!("exec stream error: {e:#}"))).await;
              cancel.cancel();
              break;
            }
            None => {
              cancel.cancel();
              break;
            }
          }
        }
        frame = from_caller.recv() => {
          match frame {
            Some(CallerFrame::Binary(bytes)) => {
              if input.write_all(&bytes).await.is_err() {
                cancel.cancel();
                break;
              }
            }
            Some(CallerFrame::Text(text)) => {
              match serde_json::from_str::<ControlMessage>(&text) {
                Ok(ControlMessage::Resize { rows, cols }) => {
                  let _ = docker
                    .resize_exec(&exec.id, ResizeExecOptions { height: rows, width: cols })
                    .await;
                }
                Err(_) => {
                  // Unrecognized text is forwarded as if binary (spec
                  // §4.8).
                  if input.write_all(text.as_bytes()).await.is_err() {
                    cancel.cancel();
                    break;
                  }
                }
              }
            }
            None => {
              cancel.cancel();
              break;
            }
          }
        }
      }
    }

    Ok(())
  }
}

impl Default for ExecSessionMediator {
  fn default() -> Self {
    Self::new()
  }
}

async fn detect_shell(docker: &Docker, container_id: &str) -> CoreResult<String> {
  for candidate in SHELL_PROBES {
    if probe_executable(docker, container_id, candidate).await {
      return Ok(candidate.to_string());
    }
  }
  Err(CoreError::engine(anyhow::anyhow!(
    "no usable shell found in container (tried {SHELL_PROBES:?})"
  )))
}

async fn probe_executable(docker: &Docker, container_id: &str, candidate: &str) -> bool {
  let exec = match docker
    .create_exec(
      container_id,
      CreateExecOptions {
        cmd: Some(vec![
          "test".to_string(),
          "-x".to_string(),
          candidate.to_string(),
        ]),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
      },
    )
    .await
  {
    Ok(exec) => exec,
    Err(_) => return false,
  };

  if docker.start_exec(&exec.id, None).await.is_err() {
    return false;
  }

  matches!(
    docker.inspect_exec(&exec.id).await,
    Ok(inspect) if inspect.exit_code == Some(0)
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resize_control_message_parses() {
    let parsed: ControlMessage =
      serde_json::from_str(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
    assert!(matches!(parsed, ControlMessage::Resize { rows: 40, cols: 120 }));
  }

  #[test]
  fn unrecognized_control_type_fails_to_parse_and_is_forwarded() {
    let result: Result<ControlMessage, _> =
      serde_json::from_str(r#"{"type":"not_a_real_type"}"#);
    assert!(result.is_err());
  }
}
