//! Registry of live client connections.
//!
//! The registry owns every [`Connection`] from admission until teardown and
//! is the only place the connection map is mutated. Invariants:
//! - every entry in the map is `Handshaking` or `Active`; an entry is removed
//!   in the same critical section that moves it to `Closing`
//! - an admission is either fully visible to a shutdown sweep (in the map and
//!   published to the simulation) or not at all; shutdown takes the admission
//!   gate exclusively and waits for in-flight admissions to finish

use crate::auth::TokenVerifier;
use crate::config::NetworkConfig;
use crate::connection::{lock, Connection, SessionId};
use crate::error::NetworkError;
use crate::simulation::{ClientJoined, JoinPublisher};
use crate::transport::Transport;
use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The connection map. Only ever touched with its mutex held, and never
/// across an `.await`.
#[derive(Default)]
pub(crate) struct Roster {
    connections: HashMap<SessionId, Arc<Connection>>,
}

impl Roster {
    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id)
    }
}

/// Result of waiting for connection tasks to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// The grace period ran out with this many tasks still running. They
    /// are left detached.
    TimedOut { remaining_tasks: usize },
}

pub struct ConnectionRegistry {
    roster: Arc<Mutex<Roster>>,
    /// `true` while admissions are allowed. Admissions hold it shared for
    /// their whole insert-then-publish sequence.
    gate: RwLock<bool>,
    /// Lock-free mirror of `gate` for the pre-upgrade check.
    accepting: AtomicBool,
    verifier: Arc<dyn TokenVerifier>,
    joins: JoinPublisher,
    config: NetworkConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ConnectionRegistry {
    pub fn new(
        config: NetworkConfig,
        verifier: Arc<dyn TokenVerifier>,
        joins: JoinPublisher,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            roster: Arc::new(Mutex::new(Roster::default())),
            gate: RwLock::new(true),
            accepting: AtomicBool::new(true),
            verifier,
            joins,
            config,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Cheap admission check for the handshake boundary, run before the
    /// upgrade completes so rejections can still be answered over HTTP.
    /// [`ConnectionRegistry::admit`] repeats it authoritatively.
    pub fn check_admission(&self, token: &str) -> Result<(), NetworkError> {
        if !self.verifier.verify(token) {
            return Err(NetworkError::Unauthorized);
        }
        if !self.accepting.load(Ordering::Acquire) {
            return Err(NetworkError::ServerShuttingDown);
        }
        Ok(())
    }

    /// Verifies `token`, registers a connection over `transport`, starts its
    /// tasks, and announces it to the simulation.
    ///
    /// On `Unauthorized` or `ServerShuttingDown` the transport is dropped
    /// without ever being wrapped. On `SimulationUnavailable` the connection
    /// was registered but is closed and removed again before returning.
    pub async fn admit<T: Transport>(
        &self,
        transport: T,
        remote_addr: SocketAddr,
        token: &str,
    ) -> Result<Arc<Connection>, NetworkError> {
        if !self.verifier.verify(token) {
            warn!("Rejected client from {}: invalid token", remote_addr);
            return Err(NetworkError::Unauthorized);
        }

        let gate = self.gate.read().await;
        if !*gate {
            return Err(NetworkError::ServerShuttingDown);
        }

        let connection = Connection::new(
            remote_addr,
            &self.config,
            Arc::downgrade(&self.roster),
            &self.shutdown,
        );
        {
            let mut roster = lock(&self.roster);
            roster
                .connections
                .insert(connection.id(), Arc::clone(&connection));
            connection.activate();
        }
        connection.start(transport, &self.tracker);
        info!("Client {} connected from {}", connection.id(), remote_addr);

        let joined = ClientJoined {
            handle: connection.handle(),
        };
        if let Err(e) = self.joins.publish(joined, self.config.publish_timeout).await {
            warn!(
                "Client {} could not be handed to the simulation: {}",
                connection.id(),
                e
            );
            connection.close().await;
            return Err(e);
        }

        drop(gate);
        Ok(connection)
    }

    /// Closes and deregisters a connection. No-op for unknown ids.
    pub async fn remove(&self, id: SessionId) {
        let connection = lock(&self.roster).connections.get(&id).cloned();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Connection>> {
        lock(&self.roster).connections.get(&id).cloned()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        lock(&self.roster).connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.roster).connections.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.roster).connections.is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuses all further admissions. Waits for admissions already past
    /// the gate to finish (each is bounded by the publish timeout).
    pub async fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
        let mut gate = self.gate.write().await;
        *gate = false;
    }

    /// Moves every registered connection to `Closing`, clears the map, and
    /// starts all teardowns concurrently. Returns how many connections were
    /// closed; use [`ConnectionRegistry::drain`] to wait for them.
    pub fn broadcast_close(&self) -> usize {
        let closing: Vec<Arc<Connection>> = {
            let mut roster = lock(&self.roster);
            roster
                .connections
                .drain()
                .map(|(_, connection)| connection)
                .filter(|connection| connection.begin_close())
                .collect()
        };

        let count = closing.len();
        for connection in closing {
            self.tracker.spawn(async move { connection.teardown().await });
        }
        info!("Closing {} clients", count);
        count
    }

    /// Waits up to `grace` for every connection task to finish. Tasks still
    /// running afterwards are abandoned.
    pub async fn drain(&self, grace: Duration) -> DrainOutcome {
        self.tracker.close();
        match timeout(grace, self.tracker.wait()).await {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => DrainOutcome::TimedOut {
                remaining_tasks: self.tracker.len(),
            },
        }
    }

    /// Tells the simulation that no more join events will arrive.
    pub fn close_simulation_channel(&self) {
        self.joins.close();
    }
}
