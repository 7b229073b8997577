//! Tunnel session ownership.
//!
//! [`TunnelManager`] keeps at most one live forwarded session per
//! [`TunnelKey`]. The SSH work itself happens behind [`TunnelOpener`], so the
//! bookkeeping here can be exercised without a bastion.

use crate::error::{OmniError, OmniResult};
use crate::models::{TunnelKey, TunnelSpec};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// First port tried when the preferred local port is taken.
pub const DEFAULT_BASE_PORT: u16 = 3307;

/// Number of ports scanned upward from the base port.
pub const DEFAULT_PORT_ATTEMPTS: u16 = 100;

/// How long `close` waits for a forwarding task to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Establishes the secure session for a tunnel and starts forwarding.
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    /// Authenticate against the spec's SSH server and forward every
    /// connection accepted on `listener` to the spec's remote endpoint.
    ///
    /// Must fail with `Authentication`, `Connect` or `PortForward` rather
    /// than returning a tunnel that cannot carry traffic.
    async fn open(&self, spec: &TunnelSpec, listener: TcpListener) -> OmniResult<ActiveTunnel>;
}

/// Handle to a live forwarded port.
///
/// Dropping the handle cancels the forwarding task.
pub struct ActiveTunnel {
    key: TunnelKey,
    local_port: u16,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveTunnel {
    /// Wrap a running forwarding task.
    pub fn new(
        key: TunnelKey,
        local_port: u16,
        cancel_token: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self { key, local_port, cancel_token, task: Mutex::new(Some(task)) }
    }

    /// Identity of this tunnel.
    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    /// Loopback port the tunnel listens on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the tunnel has been stopped (by close or by session loss).
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Stop forwarding and wait for the task to exit.
    pub async fn shutdown(&self) -> OmniResult<()> {
        self.cancel_token.cancel();
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(OmniError::internal(format!("Tunnel task failed: {e}"))),
            Err(_) => Err(OmniError::internal(format!(
                "Tunnel {} did not stop within {:?}",
                self.key, SHUTDOWN_GRACE
            ))),
        }
    }
}

impl Drop for ActiveTunnel {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

type TunnelSlot = Arc<OnceCell<Arc<ActiveTunnel>>>;

/// Owns every forwarded session in the process.
pub struct TunnelManager {
    opener: Arc<dyn TunnelOpener>,
    sessions: RwLock<HashMap<TunnelKey, TunnelSlot>>,
    base_port: u16,
    port_attempts: u16,
}

impl TunnelManager {
    /// Create a manager using `opener` for new sessions.
    pub fn new(opener: Arc<dyn TunnelOpener>) -> Self {
        Self {
            opener,
            sessions: RwLock::new(HashMap::new()),
            base_port: DEFAULT_BASE_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
        }
    }

    /// Override the local port search range.
    pub fn with_port_range(mut self, base_port: u16, attempts: u16) -> Self {
        self.base_port = base_port;
        self.port_attempts = attempts.max(1);
        self
    }

    /// Make sure a tunnel for `spec` is up and return its local port.
    ///
    /// Concurrent callers with the same identity share one initialization:
    /// exactly one session is opened and everyone sees the same port. A
    /// failed attempt leaves nothing behind, so the next call retries.
    pub async fn ensure_tunnel(&self, spec: &TunnelSpec) -> OmniResult<u16> {
        let key = spec.key();

        // One retry covers a session that died since it was cached.
        for _ in 0..2 {
            let slot = self.slot(&key);
            let tunnel = slot
                .get_or_try_init(|| async {
                    let listener = self.bind_local(spec.preferred_local_port).await?;
                    tracing::info!(
                        tunnel = %key,
                        ssh_user = %spec.ssh_user,
                        auth = spec.auth.as_str(),
                        "Opening SSH tunnel"
                    );
                    let tunnel = self.opener.open(spec, listener).await.map_err(|e| {
                        tracing::warn!(tunnel = %key, error = %e, "SSH tunnel failed");
                        e
                    })?;
                    tracing::info!(
                        tunnel = %key,
                        local_port = tunnel.local_port(),
                        "SSH tunnel established"
                    );
                    Ok::<_, OmniError>(Arc::new(tunnel))
                })
                .await?;

            // A close that ran while the session was opening dropped our slot.
            if !self.is_tracked(&key, &slot) {
                tracing::debug!(tunnel = %key, "SSH tunnel closed while it was opening");
                Self::shutdown_logged(tunnel).await;
                return Err(OmniError::connect(format!("SSH tunnel {key} was closed while opening")));
            }

            if !tunnel.is_closed() {
                return Ok(tunnel.local_port());
            }

            tracing::warn!(tunnel = %key, "Cached SSH tunnel is closed, reopening");
            {
                let mut sessions = self.sessions.write();
                if sessions.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    sessions.remove(&key);
                }
            }
        }

        Err(OmniError::connect(format!("SSH tunnel {key} closed while opening")))
    }

    /// Close the session for `key`. Closing an unknown key is a no-op.
    pub async fn close(&self, key: &TunnelKey) {
        let slot = self.sessions.write().remove(key);
        if let Some(tunnel) = slot.and_then(|s| s.get().cloned()) {
            Self::shutdown_logged(&tunnel).await;
        }
    }

    /// Close every session concurrently. Individual failures are logged and skipped.
    pub async fn close_all(&self) {
        let tunnels: Vec<Arc<ActiveTunnel>> = self
            .sessions
            .write()
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        let count = tunnels.len();
        join_all(tunnels.iter().map(|tunnel| Self::shutdown_logged(tunnel))).await;
        tracing::info!(count, "All SSH tunnels closed");
    }

    /// Local port of a live session, if any.
    pub fn local_port(&self, key: &TunnelKey) -> Option<u16> {
        self.sessions
            .read()
            .get(key)
            .and_then(|slot| slot.get())
            .filter(|t| !t.is_closed())
            .map(|t| t.local_port())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|slot| slot.get().is_some_and(|t| !t.is_closed()))
            .count()
    }

    /// Identities of live sessions.
    pub fn keys(&self) -> Vec<TunnelKey> {
        let mut keys: Vec<TunnelKey> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, slot)| slot.get().is_some_and(|t| !t.is_closed()))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Whether `slot` is still the one registered for `key`.
    fn is_tracked(&self, key: &TunnelKey, slot: &TunnelSlot) -> bool {
        self.sessions.read().get(key).is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Atomic get-or-insert of the slot for `key`.
    fn slot(&self, key: &TunnelKey) -> TunnelSlot {
        if let Some(slot) = self.sessions.read().get(key) {
            return slot.clone();
        }
        self.sessions.write().entry(key.clone()).or_default().clone()
    }

    /// Bind the preferred port, or the first free port in the search range.
    async fn bind_local(&self, preferred: Option<u16>) -> OmniResult<TcpListener> {
        if let Some(port) = preferred {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    tracing::debug!(port, error = %e, "Preferred local port unavailable, probing")
                }
            }
        }

        let last = self.base_port.saturating_add(self.port_attempts - 1);
        for port in self.base_port..=last {
            if let Ok(listener) = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                tracing::debug!(port, "Found available local port");
                return Ok(listener);
            }
        }

        Err(OmniError::no_port_available(self.base_port, last))
    }

    async fn shutdown_logged(tunnel: &ActiveTunnel) {
        match tunnel.shutdown().await {
            Ok(()) => tracing::info!(
                tunnel = %tunnel.key(),
                local_port = tunnel.local_port(),
                "SSH tunnel closed"
            ),
            Err(e) => tracing::warn!(
                tunnel = %tunnel.key(),
                error = %e,
                "Error while closing SSH tunnel"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeOpener;

    fn spec(remote_port: u16) -> TunnelSpec {
        TunnelSpec::new("bastion", "ubuntu", "pw", "10.0.0.5", remote_port).with_local_port(0)
    }

    #[tokio::test]
    async fn test_ensure_tunnel_is_idempotent() {
        let opener = Arc::new(FakeOpener::new());
        let manager = TunnelManager::new(opener.clone());

        let first = manager.ensure_tunnel(&spec(3306)).await.unwrap();
        let second = manager.ensure_tunnel(&spec(3306)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(opener.opened(), 1);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_identities_get_distinct_sessions() {
        let opener = Arc::new(FakeOpener::new());
        let manager = TunnelManager::new(opener.clone());

        let a = manager.ensure_tunnel(&spec(3306)).await.unwrap();
        let b = manager.ensure_tunnel(&spec(3307)).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(opener.opened(), 2);
        assert_eq!(manager.keys().len(), 2);
    }

    #[tokio::test]
    async fn test_preferred_port_taken_scans_upward() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let free = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let free_port = free.local_addr().unwrap().port();
        drop(free);

        let manager = TunnelManager::new(Arc::new(FakeOpener::new())).with_port_range(free_port, 1);
        let spec = TunnelSpec::new("bastion", "u", "pw", "db", 3306).with_local_port(taken_port);

        let port = manager.ensure_tunnel(&spec).await.unwrap();
        assert_eq!(port, free_port);
    }

    #[tokio::test]
    async fn test_no_port_available_when_range_exhausted() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let opener = Arc::new(FakeOpener::new());
        let manager = TunnelManager::new(opener.clone()).with_port_range(taken_port, 1);
        let spec = TunnelSpec::new("bastion", "u", "pw", "db", 3306);

        let err = manager.ensure_tunnel(&spec).await.unwrap_err();
        assert!(matches!(err, OmniError::NoPortAvailable { first, last } if first == taken_port && last == taken_port));
        assert_eq!(opener.opened(), 0);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_is_retried_on_next_call() {
        let opener = Arc::new(FakeOpener::new());
        opener.fail_next(OmniError::authentication("Auth fail"));
        let manager = TunnelManager::new(opener.clone());

        let err = manager.ensure_tunnel(&spec(3306)).await.unwrap_err();
        assert!(matches!(err, OmniError::Authentication { .. }));
        assert_eq!(manager.session_count(), 0);

        manager.ensure_tunnel(&spec(3306)).await.unwrap();
        assert_eq!(opener.opened(), 1);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = TunnelManager::new(Arc::new(FakeOpener::new()));
        let spec = spec(3306);
        manager.ensure_tunnel(&spec).await.unwrap();

        manager.close(&spec.key()).await;
        manager.close(&spec.key()).await;
        manager.close(&TunnelSpec::new("other", "u", "p", "h", 1).key()).await;

        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.local_port(&spec.key()), None);
    }

    #[tokio::test]
    async fn test_closed_session_is_reopened() {
        let opener = Arc::new(FakeOpener::new());
        let manager = TunnelManager::new(opener.clone());
        let spec = spec(3306);
        manager.ensure_tunnel(&spec).await.unwrap();

        opener.kill_all();
        assert_eq!(manager.session_count(), 0);

        manager.ensure_tunnel(&spec).await.unwrap();
        assert_eq!(opener.opened(), 2);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close_all_during_open_leaves_no_session() {
        let opener = Arc::new(FakeOpener::new().with_delay(Duration::from_millis(200)));
        let manager = Arc::new(TunnelManager::new(opener.clone()));

        let opening = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_tunnel(&spec(3306)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.close_all().await;

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(OmniError::Connect { .. })), "got {result:?}");
        assert_eq!(manager.session_count(), 0);

        manager.ensure_tunnel(&spec(3306)).await.unwrap();
        assert_eq!(opener.opened(), 2);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_opens_one_session() {
        let opener = Arc::new(FakeOpener::new().with_delay(Duration::from_millis(50)));
        let manager = Arc::new(TunnelManager::new(opener.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_tunnel(&spec(3306)).await })
            })
            .collect();

        let mut ports = Vec::new();
        for task in tasks {
            ports.push(task.await.unwrap().unwrap());
        }

        assert_eq!(opener.opened(), 1);
        assert!(ports.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_close_all_leaves_no_sessions() {
        let manager = TunnelManager::new(Arc::new(FakeOpener::new()));
        manager.ensure_tunnel(&spec(3306)).await.unwrap();
        manager.ensure_tunnel(&spec(3308)).await.unwrap();

        manager.close_all().await;
        assert_eq!(manager.session_count(), 0);
        assert!(manager.keys().is_empty());
    }
}
