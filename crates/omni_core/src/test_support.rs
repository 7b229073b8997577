//! In-process fakes for the driver and tunnel seams.

use crate::error::{OmniError, OmniResult};
use crate::models::{ConnectionTarget, DriverKind, Row, SqlValue, TunnelSpec};
use crate::services::driver::{Driver, DriverConnection};
use crate::services::tunnel::{ActiveTunnel, TunnelOpener};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeDb {
    connects: usize,
    targets: Vec<ConnectionTarget>,
    queries: Vec<(String, Vec<SqlValue>)>,
    fail_connect: Option<OmniError>,
    fail_statement: Option<OmniError>,
    rows: Vec<Row>,
    affected: u64,
    query_delay: Duration,
}

/// Driver that never touches the network.
///
/// `SELECT 1` answers one row `{"1": 1}`; any other query answers the rows
/// set with [`FakeDriver::set_rows`].
pub struct FakeDriver {
    kind: DriverKind,
    connect_delay: Duration,
    db: Arc<Mutex<FakeDb>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self { kind: DriverKind::MySql, connect_delay: Duration::ZERO, db: Arc::default() }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn fail_next(&self, err: OmniError) {
        self.db.lock().fail_connect = Some(err);
    }

    pub fn fail_next_statement(&self, err: OmniError) {
        self.db.lock().fail_statement = Some(err);
    }

    pub fn set_rows(&self, rows: Vec<Row>) {
        self.db.lock().rows = rows;
    }

    pub fn set_affected(&self, affected: u64) {
        self.db.lock().affected = affected;
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.db.lock().query_delay = delay;
    }

    pub fn connects(&self) -> usize {
        self.db.lock().connects
    }

    pub fn last_target(&self) -> Option<ConnectionTarget> {
        self.db.lock().targets.last().cloned()
    }

    pub fn queries(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.db.lock().queries.clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    async fn connect(
        &self,
        target: &ConnectionTarget,
        _timeout: Duration,
    ) -> OmniResult<Box<dyn DriverConnection>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let mut db = self.db.lock();
        if let Some(err) = db.fail_connect.take() {
            return Err(err);
        }
        db.connects += 1;
        db.targets.push(target.clone());
        Ok(Box::new(FakeConnection { db: self.db.clone() }))
    }
}

struct FakeConnection {
    db: Arc<Mutex<FakeDb>>,
}

impl FakeConnection {
    async fn run(&self, sql: &str, params: &[SqlValue]) -> OmniResult<(Vec<Row>, u64)> {
        let (delay, outcome) = {
            let mut db = self.db.lock();
            db.queries.push((sql.to_string(), params.to_vec()));
            let outcome = match db.fail_statement.take() {
                Some(err) => Err(err),
                None if sql == "SELECT 1" => {
                    Ok((vec![[("1", SqlValue::Int(1))].into_iter().collect()], 0))
                }
                None => Ok((db.rows.clone(), db.affected)),
            };
            (db.query_delay, outcome)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

#[async_trait]
impl DriverConnection for FakeConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<Vec<Row>> {
        self.run(sql, params).await.map(|(rows, _)| rows)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<u64> {
        self.run(sql, params).await.map(|(_, affected)| affected)
    }

    async fn ping(&mut self) -> OmniResult<()> {
        Ok(())
    }
}

/// Tunnel opener that binds the real local listener but forwards nothing.
///
/// Listeners stay bound until the opener is dropped, so a reopened tunnel
/// always lands on a different port.
pub struct FakeOpener {
    opened: AtomicUsize,
    delay: Duration,
    fail_next: Mutex<Option<OmniError>>,
    tokens: Mutex<Vec<CancellationToken>>,
    listeners: Arc<Mutex<Vec<TcpListener>>>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self {
            opened: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_next: Mutex::new(None),
            tokens: Mutex::new(Vec::new()),
            listeners: Arc::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_next(&self, err: OmniError) {
        *self.fail_next.lock() = Some(err);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Simulate every SSH session dropping.
    pub fn kill_all(&self) {
        for token in self.tokens.lock().iter() {
            token.cancel();
        }
    }
}

#[async_trait]
impl TunnelOpener for FakeOpener {
    async fn open(&self, spec: &TunnelSpec, listener: TcpListener) -> OmniResult<ActiveTunnel> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.fail_next.lock().take() {
            return Err(err);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let local_port = listener.local_addr()?.port();
        let cancel_token = CancellationToken::new();
        self.tokens.lock().push(cancel_token.clone());

        let listeners = self.listeners.clone();
        let token = cancel_token.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            listeners.lock().push(listener);
        });

        Ok(ActiveTunnel::new(spec.key(), local_port, cancel_token, task))
    }
}
