//! SSH transport: tunnels the remote Docker socket over a `direct-streamlocal`
//! channel and exposes it to `bollard` as an ordinary local unix socket.
//!
//! Grounded in the teacher's periphery-over-SSH-like proxying shape; the
//! actual channel handshake follows the pattern other transport-tunneling
//! crates in this codebase's reference pool use for russh (connect, verify
//! host key, authenticate, open channel, copy bytes both ways).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{HashAlg, PublicKey};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixListener};

use crate::model::{CredentialKind, SecretBytes};

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const SSH_AUTH_TIMEOUT: Duration = Duration::from_secs(15);
const SSH_CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

struct HostKeyCheck {
  /// Lowercase hex SHA-256 fingerprints from the `ssh_known_hosts`
  /// credential, if one was provided for this host. Empty means "accept
  /// and log" - there is no local `~/.ssh/known_hosts` to consult since
  /// the core runs as a headless multi-tenant process.
  accepted_fingerprints: Vec<String>,
  host_label: String,
}

impl russh::client::Handler for HostKeyCheck {
  type Error = anyhow::Error;

  async fn check_server_key(
    &mut self,
    server_public_key: &PublicKey,
  ) -> Result<bool, Self::Error> {
    let fp = server_public_key.fingerprint(HashAlg::Sha256);
    let actual = fp.to_string();
    if self.accepted_fingerprints.is_empty() {
      tracing::warn!(
        host = %self.host_label,
        fingerprint = %actual,
        "no known_hosts credential configured for this host, trusting on first use"
      );
      return Ok(true);
    }
    let ok = self
      .accepted_fingerprints
      .iter()
      .any(|f| f.eq_ignore_ascii_case(&actual));
    if !ok {
      tracing::warn!(
        host = %self.host_label,
        fingerprint = %actual,
        "SSH host key fingerprint not in known_hosts credential"
      );
    }
    Ok(ok)
  }
}

/// A live tunnel from a local unix socket to a remote socket path, reached
/// over SSH. Dropping it tears down the listener task and removes the local
/// socket file; the underlying SSH session is closed with it.
pub struct SshTunnel {
  pub local_socket_path: PathBuf,
  handle: Arc<russh::client::Handle<HostKeyCheck>>,
  listener_task: tokio::task::JoinHandle<()>,
}

impl Drop for SshTunnel {
  fn drop(&mut self) {
    self.listener_task.abort();
    let _ = std::fs::remove_file(&self.local_socket_path);
  }
}

/// Credential bundle pulled out of the decrypted map for the SSH case.
pub struct SshCredentials<'a> {
  pub user: &'a str,
  pub private_key_pem: Option<&'a SecretBytes>,
  pub passphrase: Option<&'a SecretBytes>,
  pub password: Option<&'a SecretBytes>,
  pub known_hosts_fingerprints: Option<&'a SecretBytes>,
}

impl<'a> SshCredentials<'a> {
  pub fn from_map(
    user: &'a str,
    creds: &'a std::collections::HashMap<CredentialKind, SecretBytes>,
  ) -> Self {
    SshCredentials {
      user,
      private_key_pem: creds.get(&CredentialKind::SshPrivateKey),
      passphrase: creds.get(&CredentialKind::SshPassphrase),
      password: creds.get(&CredentialKind::SshPassword),
      known_hosts_fingerprints: creds.get(&CredentialKind::SshKnownHosts),
    }
  }
}

/// Establishes the SSH session, authenticates, and starts proxying a fresh
/// local unix socket to `remote_socket_path` on the far side. Returns once
/// the SSH layer is verified reachable; does not itself probe the Docker
/// daemon - the caller does that uniformly for every transport kind after
/// building the `bollard::Docker` client on top of the returned socket.
pub async fn establish(
  host_label: &str,
  ssh_host: &str,
  ssh_port: u16,
  remote_socket_path: &str,
  creds: &SshCredentials<'_>,
) -> anyhow::Result<SshTunnel> {
  let config = Arc::new(russh::client::Config::default());
  let fingerprints = creds
    .known_hosts_fingerprints
    .map(|s| {
      String::from_utf8_lossy(&s.0)
        .split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
    })
    .unwrap_or_default();
  let handler = HostKeyCheck {
    accepted_fingerprints: fingerprints,
    host_label: host_label.to_string(),
  };

  let tcp = tokio::time::timeout(
    SSH_CONNECT_TIMEOUT,
    TcpStream::connect((ssh_host, ssh_port)),
  )
  .await
  .map_err(|_| {
    anyhow::anyhow!("SSH connect timeout to {ssh_host}:{ssh_port}")
  })??;

  let mut session = tokio::time::timeout(
    SSH_CONNECT_TIMEOUT,
    russh::client::connect_stream(config, tcp, handler),
  )
  .await
  .map_err(|_| {
    anyhow::anyhow!("SSH handshake timeout to {ssh_host}:{ssh_port}")
  })??;

  authenticate(&mut session, creds).await?;

  let handle = Arc::new(session);

  // Verify at least one channel opens before declaring the tunnel ready.
  let probe = tokio::time::timeout(
    SSH_CHANNEL_TIMEOUT,
    handle.channel_open_direct_streamlocal(remote_socket_path),
  )
  .await
  .map_err(|_| anyhow::anyhow!("SSH channel open timeout"))??;
  probe.close().await.ok();

  let local_socket_path = std::env::temp_dir().join(format!(
    "fleet-core-{}-{}.sock",
    host_label,
    uuid::Uuid::new_v4()
  ));
  let _ = std::fs::remove_file(&local_socket_path);
  let listener = UnixListener::bind(&local_socket_path)?;

  let remote_path = remote_socket_path.to_string();
  let handle_for_task = handle.clone();
  let listener_task = tokio::spawn(async move {
    loop {
      let (mut local_conn, _addr) = match listener.accept().await {
        Ok(pair) => pair,
        Err(_) => break,
      };
      let handle = handle_for_task.clone();
      let remote_path = remote_path.clone();
      tokio::spawn(async move {
        let channel = match handle
          .channel_open_direct_streamlocal(&remote_path)
          .await
        {
          Ok(c) => c,
          Err(e) => {
            tracing::warn!(error = %e, "failed to open SSH channel for proxied connection");
            let _ = local_conn.shutdown().await;
            return;
          }
        };
        let mut remote_stream = channel.into_stream();
        if let Err(e) = tokio::io::copy_bidirectional(
          &mut local_conn,
          &mut remote_stream,
        )
        .await
        {
          tracing::debug!(error = %e, "SSH-proxied connection closed");
        }
      });
    }
  });

  Ok(SshTunnel {
    local_socket_path,
    handle,
    listener_task,
  })
}

async fn authenticate(
  session: &mut russh::client::Handle<HostKeyCheck>,
  creds: &SshCredentials<'_>,
) -> anyhow::Result<()> {
  tokio::time::timeout(SSH_AUTH_TIMEOUT, async {
    if let Some(key_pem) = creds.private_key_pem {
      let passphrase = creds
        .passphrase
        .map(|p| String::from_utf8_lossy(&p.0).into_owned());
      let key_str = String::from_utf8_lossy(&key_pem.0);
      let key_pair = russh::keys::decode_secret_key(
        &key_str,
        passphrase.as_deref(),
      )
      .map_err(|e| anyhow::anyhow!("failed to decode SSH private key: {e}"))?;
      let ok = session
        .authenticate_publickey(
          creds.user,
          Arc::new(russh::keys::PrivateKeyWithHashAlg::new(
            Arc::new(key_pair),
            None,
          )),
        )
        .await?
        .success();
      anyhow::ensure!(ok, "SSH public key authentication rejected");
    } else if let Some(password) = creds.password {
      let pass = String::from_utf8_lossy(&password.0);
      let ok = session
        .authenticate_password(creds.user, pass.as_ref())
        .await?
        .success();
      anyhow::ensure!(ok, "SSH password authentication rejected");
    } else {
      anyhow::bail!(
        "host requires SSH transport but no private key or password credential was found"
      );
    }
    Ok::<_, anyhow::Error>(())
  })
  .await
  .map_err(|_| anyhow::anyhow!("SSH authentication timed out"))?
}
