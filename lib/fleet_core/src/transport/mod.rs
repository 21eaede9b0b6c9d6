//! Transport Dialer (spec §4.2). Turns a `Host` record plus its decrypted
//! credentials into a live `bollard::Docker` client, picking the connect
//! path by `ConnectionKind` and proving the daemon actually answers before
//! handing back a handle.

pub mod ssh;

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use bollard::{API_DEFAULT_VERSION, Docker};

use crate::{
  error::{CoreError, CoreResult},
  model::{ConnectionKind, CredentialKind, Host, SecretBytes},
};

const CONNECT_TIMEOUT_SECS: u64 = 15;

/// A dialed connection to one host's Docker engine. Holds whatever
/// transport-specific resource (e.g. an SSH tunnel) must stay alive for the
/// `Docker` client to keep working.
pub struct ConnectionHandle {
  pub host_id: String,
  pub docker: Docker,
  _ssh_tunnel: Option<ssh::SshTunnel>,
}

pub struct TransportDialer;

impl TransportDialer {
  pub fn new() -> Self {
    TransportDialer
  }

  /// Dials `host` using the given decrypted credential map, then probes the
  /// engine with a ping before returning. The ping is the one probe every
  /// transport kind shares; SSH additionally proves channel-open during its
  /// own handshake (see [`ssh::establish`]).
  #[tracing::instrument("TransportDial", skip(self, creds), fields(host_id = %host.id, kind = %host.kind))]
  pub async fn dial(
    &self,
    host: &Host,
    creds: &HashMap<CredentialKind, SecretBytes>,
  ) -> CoreResult<ConnectionHandle> {
    let (docker, ssh_tunnel) = match host.kind {
      ConnectionKind::UnixSocket => {
        let docker = Docker::connect_with_socket(
          &host.endpoint,
          CONNECT_TIMEOUT_SECS,
          API_DEFAULT_VERSION,
        )
        .map_err(CoreError::transport)?;
        (docker, None)
      }
      ConnectionKind::TcpPlain => {
        let docker = Docker::connect_with_http(
          &host.endpoint,
          CONNECT_TIMEOUT_SECS,
          API_DEFAULT_VERSION,
        )
        .map_err(CoreError::transport)?;
        (docker, None)
      }
      ConnectionKind::TcpTls => {
        let docker = dial_tls(&host.endpoint, creds)?;
        (docker, None)
      }
      ConnectionKind::Ssh => {
        let (user, ssh_host, ssh_port, remote_socket_path) =
          parse_ssh_endpoint(&host.endpoint)?;
        let ssh_creds = ssh::SshCredentials::from_map(&user, creds);
        let tunnel = ssh::establish(
          &host.id,
          &ssh_host,
          ssh_port,
          &remote_socket_path,
          &ssh_creds,
        )
        .await
        .map_err(CoreError::transport)?;
        let docker = Docker::connect_with_socket(
          tunnel.local_socket_path.to_string_lossy().as_ref(),
          CONNECT_TIMEOUT_SECS,
          API_DEFAULT_VERSION,
        )
        .map_err(CoreError::transport)?;
        (docker, Some(tunnel))
      }
    };

    docker.ping().await.map_err(CoreError::transport)?;

    Ok(ConnectionHandle {
      host_id: host.id.clone(),
      docker,
      _ssh_tunnel: ssh_tunnel,
    })
  }
}

impl Default for TransportDialer {
  fn default() -> Self {
    Self::new()
  }
}

/// Writes the decrypted TLS material to a private (0600) temp directory,
/// builds the SSL-backed `Docker` client from the paths bollard's API
/// requires, then removes the files immediately - `connect_with_ssl`
/// consumes them synchronously while building its TLS connector and does
/// not need them again afterward.
fn dial_tls(
  endpoint: &str,
  creds: &HashMap<CredentialKind, SecretBytes>,
) -> CoreResult<Docker> {
  let ca = creds.get(&CredentialKind::TlsCa).ok_or_else(|| {
    CoreError::validation("host uses tcp_tls but has no tls_ca credential")
  })?;
  let cert = creds.get(&CredentialKind::TlsCert).ok_or_else(|| {
    CoreError::validation("host uses tcp_tls but has no tls_cert credential")
  })?;
  let key = creds.get(&CredentialKind::TlsKey).ok_or_else(|| {
    CoreError::validation("host uses tcp_tls but has no tls_key credential")
  })?;

  let dir = tempdir_for_tls()?;
  let ca_path = write_private_file(&dir, "ca.pem", &ca.0)?;
  let cert_path = write_private_file(&dir, "cert.pem", &cert.0)?;
  let key_path = write_private_file(&dir, "key.pem", &key.0)?;

  let result = Docker::connect_with_ssl(
    endpoint,
    &key_path,
    &cert_path,
    &ca_path,
    CONNECT_TIMEOUT_SECS,
    API_DEFAULT_VERSION,
  );

  let _ = std::fs::remove_dir_all(&dir);
  result.map_err(CoreError::transport)
}

fn tempdir_for_tls() -> CoreResult<std::path::PathBuf> {
  let dir = std::env::temp_dir()
    .join(format!("fleet-core-tls-{}", uuid::Uuid::new_v4()));
  std::fs::create_dir(&dir).map_err(CoreError::internal)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(
      &dir,
      std::fs::Permissions::from_mode(0o700),
    );
  }
  Ok(dir)
}

fn write_private_file(
  dir: &std::path::Path,
  name: &str,
  bytes: &[u8],
) -> CoreResult<std::path::PathBuf> {
  let path = dir.join(name);
  let mut file = std::fs::OpenOptions::new()
    .write(true)
    .create_new(true)
    .open(&path)
    .map_err(CoreError::internal)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let _ = file
      .set_permissions(std::fs::Permissions::from_mode(0o600));
  }
  file.write_all(bytes).map_err(CoreError::internal)?;
  Ok(path)
}

/// Parses a `user@host:port/path/to/docker.sock` endpoint for SSH hosts.
/// Port and socket path both fall back to Docker's own defaults.
fn parse_ssh_endpoint(
  endpoint: &str,
) -> CoreResult<(String, String, u16, String)> {
  let (user, rest) = endpoint.split_once('@').ok_or_else(|| {
    CoreError::validation(format!(
      "ssh endpoint '{endpoint}' must be of the form user@host[:port][/socket/path]"
    ))
  })?;
  let (host_port, socket_path) = match rest.split_once('/') {
    Some((hp, path)) => (hp, format!("/{path}")),
    None => (rest, "/var/run/docker.sock".to_string()),
  };
  let (host, port) = match host_port.split_once(':') {
    Some((h, p)) => (
      h.to_string(),
      p.parse::<u16>().map_err(|_| {
        CoreError::validation(format!(
          "invalid SSH port in endpoint '{endpoint}'"
        ))
      })?,
    ),
    None => (host_port.to_string(), 22),
  };
  Ok((user.to_string(), host, port, socket_path))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_ssh_endpoint_with_explicit_port_and_socket() {
    let (user, host, port, path) =
      parse_ssh_endpoint("deploy@10.0.0.5:2222/custom/docker.sock").unwrap();
    assert_eq!(user, "deploy");
    assert_eq!(host, "10.0.0.5");
    assert_eq!(port, 2222);
    assert_eq!(path, "/custom/docker.sock");
  }

  #[test]
  fn parses_ssh_endpoint_with_defaults() {
    let (user, host, port, path) =
      parse_ssh_endpoint("deploy@fleet-host-1").unwrap();
    assert_eq!(user, "deploy");
    assert_eq!(host, "fleet-host-1");
    assert_eq!(port, 22);
    assert_eq!(path, "/var/run/docker.sock");
  }

  #[test]
  fn rejects_endpoint_without_user() {
    assert!(parse_ssh_endpoint("fleet-host-1:22").is_err());
  }
}
