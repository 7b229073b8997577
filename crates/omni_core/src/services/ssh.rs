//! SSH port-forwarding over russh.

use crate::error::{OmniError, OmniResult};
use crate::models::{HostKeyPolicy, SshAuth, TunnelKey, TunnelSpec};
use crate::services::tunnel::{ActiveTunnel, TunnelOpener};

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use russh_keys::key::KeyPair;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Default bound on SSH connect plus authentication.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between SSH keepalive messages.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// SSH client handler for russh.
struct SshClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let known_hosts = match &self.policy {
            HostKeyPolicy::AcceptAny => return Ok(true),
            HostKeyPolicy::Strict { known_hosts } => known_hosts,
        };

        let checked = match known_hosts {
            Some(path) => russh_keys::check_known_hosts_path(
                &self.host,
                self.port,
                server_public_key,
                path,
            ),
            None => russh_keys::check_known_hosts(&self.host, self.port, server_public_key),
        };

        match checked {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(ssh_host = %self.host, "Host key not found in known_hosts");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(ssh_host = %self.host, error = %e, "Host key verification failed");
                Ok(false)
            }
        }
    }
}

type SshHandle = client::Handle<SshClientHandler>;

/// Opens tunnels with a real SSH client.
pub struct SshTunnelOpener {
    connect_timeout: Duration,
}

impl SshTunnelOpener {
    /// Create an opener with the default connect timeout.
    pub fn new() -> Self {
        Self { connect_timeout: DEFAULT_CONNECT_TIMEOUT }
    }

    /// Set the bound on connect plus authentication.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect and authenticate to the SSH server.
    async fn connect_ssh(&self, spec: &TunnelSpec) -> OmniResult<SshHandle> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        });
        let handler = SshClientHandler {
            host: spec.ssh_host.clone(),
            port: spec.ssh_port,
            policy: spec.host_key_policy.clone(),
        };

        let connect = async {
            let mut handle =
                client::connect(config, (spec.ssh_host.as_str(), spec.ssh_port), handler)
                    .await
                    .map_err(|e| match e {
                        russh::Error::UnknownKey => OmniError::Connect {
                            message: format!("Host key for {} was rejected", spec.ssh_host),
                            source: None,
                        },
                        other => OmniError::connect_with_source(
                            format!(
                                "Failed to connect to SSH server {}:{}",
                                spec.ssh_host, spec.ssh_port
                            ),
                            other,
                        ),
                    })?;

            let authenticated = match &spec.auth {
                SshAuth::Password { password } => {
                    handle.authenticate_password(&spec.ssh_user, password).await
                }
                SshAuth::Key { path, passphrase } => {
                    let key = load_private_key(path, passphrase.as_deref()).await?;
                    handle.authenticate_publickey(&spec.ssh_user, key).await
                }
            }
            .map_err(|e| {
                OmniError::authentication_with_hint(
                    format!("SSH authentication error: {e}"),
                    "Verify the SSH username and credentials",
                )
            })?;

            if !authenticated {
                return Err(OmniError::authentication_with_hint(
                    format!("SSH authentication failed for {}@{}", spec.ssh_user, spec.ssh_host),
                    "Verify the SSH username and credentials",
                ));
            }

            Ok(handle)
        };

        let handle = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                OmniError::connect(format!(
                    "Timed out after {:?} connecting to SSH server {}:{}",
                    self.connect_timeout, spec.ssh_host, spec.ssh_port
                ))
            })??;

        tracing::info!(
            ssh_user = %spec.ssh_user,
            ssh_host = %spec.ssh_host,
            "SSH authentication successful"
        );
        Ok(handle)
    }

    /// Check that the server will forward to the remote endpoint at all.
    async fn check_forwarding(&self, handle: &SshHandle, spec: &TunnelSpec) -> OmniResult<()> {
        let channel = handle.channel_open_direct_tcpip(
            spec.remote_host.as_str(),
            u32::from(spec.remote_port),
            "127.0.0.1",
            0,
        );
        match tokio::time::timeout(self.connect_timeout, channel).await {
            Ok(Ok(channel)) => {
                drop(channel);
                Ok(())
            }
            Ok(Err(e)) => Err(OmniError::port_forward(format!(
                "SSH server refused forwarding to {}:{}: {e}",
                spec.remote_host, spec.remote_port
            ))),
            Err(_) => Err(OmniError::port_forward(format!(
                "Timed out opening a forward to {}:{}",
                spec.remote_host, spec.remote_port
            ))),
        }
    }
}

impl Default for SshTunnelOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelOpener for SshTunnelOpener {
    async fn open(&self, spec: &TunnelSpec, listener: TcpListener) -> OmniResult<ActiveTunnel> {
        let handle = self.connect_ssh(spec).await?;

        if let Err(e) = self.check_forwarding(&handle, spec).await {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
            return Err(e);
        }

        let local_port = listener.local_addr()?.port();
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(run_tunnel(
            listener,
            Arc::new(handle),
            spec.key(),
            cancel_token.clone(),
        ));

        Ok(ActiveTunnel::new(spec.key(), local_port, cancel_token, task))
    }
}

/// Load a private key from a file.
async fn load_private_key(path: &Path, passphrase: Option<&str>) -> OmniResult<Arc<KeyPair>> {
    let key_data = tokio::fs::read_to_string(path).await.map_err(|e| {
        OmniError::authentication_with_hint(
            format!("Failed to read SSH key file {}: {e}", path.display()),
            "Check that the key file exists and is readable",
        )
    })?;

    let key = russh_keys::decode_secret_key(&key_data, passphrase).map_err(|e| {
        OmniError::authentication_with_hint(
            format!("Failed to decode SSH key {}: {e}", path.display()),
            "The key may be encrypted - provide the passphrase",
        )
    })?;

    Ok(Arc::new(key))
}

/// Accept loop: forward every local connection until cancelled.
async fn run_tunnel(
    listener: TcpListener,
    ssh: Arc<SshHandle>,
    key: TunnelKey,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((local_stream, peer_addr)) => {
                        tracing::trace!(tunnel = %key, %peer_addr, "New tunnel connection");
                        let ssh = ssh.clone();
                        let key = key.clone();
                        let cancel = cancel_token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward_connection(local_stream, ssh, &key, cancel).await {
                                tracing::warn!(tunnel = %key, error = %e, "Tunnel forwarding error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(tunnel = %key, error = %e, "Failed to accept tunnel connection");
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                break;
            }
        }
    }

    if let Err(e) = ssh.disconnect(Disconnect::ByApplication, "", "en").await {
        tracing::warn!(tunnel = %key, error = %e, "Error disconnecting SSH session");
    }
    tracing::debug!(tunnel = %key, "Tunnel accept loop stopped");
}

/// Forward a single connection through a fresh direct-tcpip channel.
async fn forward_connection(
    mut local_stream: TcpStream,
    ssh: Arc<SshHandle>,
    key: &TunnelKey,
    cancel_token: CancellationToken,
) -> OmniResult<()> {
    let channel = ssh
        .channel_open_direct_tcpip(key.remote_host.as_str(), u32::from(key.remote_port), "127.0.0.1", 0)
        .await
        .map_err(|e| {
            // A dead session cannot carry further traffic.
            if matches!(e, russh::Error::Disconnect | russh::Error::SendError) {
                cancel_token.cancel();
            }
            OmniError::port_forward(format!("Failed to open SSH channel: {e}"))
        })?;

    let mut remote_stream = channel.into_stream();
    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local_stream, &mut remote_stream) => {
            copied?;
        }
        _ = cancel_token.cancelled() => {}
    }
    Ok(())
}

/// Resolve the default known_hosts location.
pub fn default_known_hosts() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}
