//! Ordered, bounded shutdown of the network front end.
//!
//! Once the shutdown signal fires the coordinator:
//! 1. stops admissions (in-flight admissions finish first)
//! 2. closes every registered connection concurrently
//! 3. waits up to the grace period for their tasks to finish
//! 4. closes the simulation channel so the game loop sees end-of-stream

use crate::registry::{ConnectionRegistry, DrainOutcome};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What happened during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that were still registered when shutdown began.
    pub closed: usize,
    /// Connection tasks still running when the grace period expired.
    pub abandoned: usize,
}

pub struct ShutdownCoordinator {
    registry: Arc<ConnectionRegistry>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, grace: Duration) -> Self {
        Self { registry, grace }
    }

    /// Waits for `signal`, then shuts the front end down. Completes within
    /// the grace period plus the admission publish timeout.
    pub async fn run(self, signal: CancellationToken) -> ShutdownReport {
        signal.cancelled().await;
        self.shutdown().await
    }

    /// Runs the shutdown sequence immediately.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down network front end");

        self.registry.stop_accepting().await;
        let closed = self.registry.broadcast_close();

        let abandoned = match self.registry.drain(self.grace).await {
            DrainOutcome::Drained => 0,
            DrainOutcome::TimedOut { remaining_tasks } => {
                warn!(
                    "Shutdown grace period of {:?} expired with {} tasks still running",
                    self.grace, remaining_tasks
                );
                remaining_tasks
            }
        };

        self.registry.close_simulation_channel();
        info!("Network front end stopped ({} connections closed)", closed);

        ShutdownReport { closed, abandoned }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAnyToken;
    use crate::config::NetworkConfig;
    use crate::connection::ConnectionState;
    use crate::error::NetworkError;
    use crate::simulation::{self, JoinReceiver};
    use crate::transport::memory;
    use std::net::SocketAddr;
    use tokio::time::{timeout, Instant};

    fn setup(config: NetworkConfig) -> (Arc<ConnectionRegistry>, JoinReceiver) {
        let (publisher, joins) = simulation::channel(config.join_capacity);
        let registry = Arc::new(ConnectionRegistry::new(
            config,
            Arc::new(AllowAnyToken),
            publisher,
            CancellationToken::new(),
        ));
        (registry, joins)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (registry, mut joins) = setup(NetworkConfig::default());
        let mut connections = Vec::new();
        let mut peers = Vec::new();
        for port in 0..3 {
            let (transport, peer) = memory::pair();
            connections.push(registry.admit(transport, addr(3000 + port), "t").await.unwrap());
            peers.push(peer);
        }

        let coordinator = ShutdownCoordinator::new(Arc::clone(&registry), Duration::from_secs(2));
        let report = coordinator.shutdown().await;

        assert_eq!(report, ShutdownReport { closed: 3, abandoned: 0 });
        assert!(registry.is_empty());
        for connection in &connections {
            assert_eq!(connection.state(), ConnectionState::Closed);
        }
        for peer in &peers {
            assert_eq!(peer.close_count(), 1);
        }

        // Three joins were queued before the channel closed, then end-of-stream.
        for _ in 0..3 {
            assert!(joins.recv().await.is_some());
        }
        assert!(joins.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_no_admission_after_shutdown() {
        let (registry, _joins) = setup(NetworkConfig::default());
        ShutdownCoordinator::new(Arc::clone(&registry), Duration::from_millis(100))
            .shutdown()
            .await;

        let (transport, _peer) = memory::pair();
        let err = registry.admit(transport, addr(3100), "t").await.unwrap_err();
        assert!(matches!(err, NetworkError::ServerShuttingDown));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_run_waits_for_signal() {
        let (registry, _joins) = setup(NetworkConfig::default());
        let (transport, _peer) = memory::pair();
        registry.admit(transport, addr(3200), "t").await.unwrap();

        let signal = CancellationToken::new();
        let coordinator = ShutdownCoordinator::new(Arc::clone(&registry), Duration::from_secs(1));
        let running = tokio::spawn(coordinator.run(signal.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!running.is_finished());
        assert!(registry.is_accepting());

        signal.cancel();
        let report = timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
        assert_eq!(report.closed, 1);
        assert!(!registry.is_accepting());
    }

    #[tokio::test]
    async fn test_shutdown_bounded_with_full_outbound_queues() {
        let config = NetworkConfig {
            outbound_capacity: 4,
            teardown_timeout: Duration::from_millis(100),
            ..NetworkConfig::default()
        };
        let (registry, _joins) = setup(config);
        let (transport, _peer) = memory::pair_with_failing_writes();
        let connection = registry.admit(transport, addr(3300), "t").await.unwrap();
        while connection.send(protocol::Envelope::empty(protocol::MessageKind::WorldUpdate)).is_ok() {}

        let grace = Duration::from_millis(500);
        let started = Instant::now();
        let report = ShutdownCoordinator::new(Arc::clone(&registry), grace)
            .shutdown()
            .await;

        assert!(started.elapsed() < grace + Duration::from_millis(500));
        assert_eq!(report.abandoned, 0);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
