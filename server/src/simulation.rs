//! The hand-off between the network front end and the game simulation.
//!
//! The registry publishes one [`ClientJoined`] per admitted connection on a
//! single bounded channel. The simulation never owns a connection: it gets a
//! [`ConnectionHandle`], a weak reference that stops working as soon as the
//! registry has torn the connection down.

use crate::connection::{lock, Connection, ConnectionState, SessionId};
use crate::error::NetworkError;
use protocol::Envelope;
use std::net::SocketAddr;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Non-owning reference to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: SessionId,
    remote_addr: SocketAddr,
    connection: Weak<Connection>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: SessionId, remote_addr: SocketAddr, connection: Weak<Connection>) -> Self {
        Self {
            id,
            remote_addr,
            connection,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// `Closed` once the registry has released the connection.
    pub fn state(&self) -> ConnectionState {
        self.connection
            .upgrade()
            .map(|connection| connection.state())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Handshaking | ConnectionState::Active
        )
    }

    /// See [`Connection::send`].
    pub fn send(&self, envelope: Envelope) -> Result<(), NetworkError> {
        match self.connection.upgrade() {
            Some(connection) => connection.send(envelope),
            None => Err(NetworkError::ConnectionClosed),
        }
    }

    /// See [`Connection::receive`].
    pub fn receive(&self) -> Option<Envelope> {
        self.connection.upgrade()?.receive()
    }

    /// Asks for the connection to be closed. The connection leaves the
    /// registry as part of closing.
    pub async fn close(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.close().await;
        }
    }
}

/// A newly admitted client, announced to the simulation.
#[derive(Debug)]
pub struct ClientJoined {
    pub handle: ConnectionHandle,
}

/// Producer side of the boundary channel. Owned by the registry.
pub struct JoinPublisher {
    sender: Mutex<Option<mpsc::Sender<ClientJoined>>>,
}

/// Consumer side of the boundary channel. Owned by the simulation.
pub struct JoinReceiver {
    receiver: mpsc::Receiver<ClientJoined>,
}

pub fn channel(capacity: usize) -> (JoinPublisher, JoinReceiver) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        JoinPublisher {
            sender: Mutex::new(Some(sender)),
        },
        JoinReceiver { receiver },
    )
}

impl JoinPublisher {
    /// Publishes a join event, waiting at most `bound` for queue space.
    pub async fn publish(&self, event: ClientJoined, bound: Duration) -> Result<(), NetworkError> {
        let sender = lock(&self.sender)
            .clone()
            .ok_or(NetworkError::SimulationUnavailable)?;
        sender
            .send_timeout(event, bound)
            .await
            .map_err(|_| NetworkError::SimulationUnavailable)
    }

    /// Closes the channel. The simulation sees end-of-stream once every
    /// queued event has been received.
    pub fn close(&self) {
        lock(&self.sender).take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }
}

impl JoinReceiver {
    /// Waits for the next join event; `None` after the channel is closed.
    pub async fn recv(&mut self) -> Option<ClientJoined> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientJoined> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use protocol::MessageKind;
    use std::sync::Arc;
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;

    fn detached_connection() -> Arc<Connection> {
        Connection::new(
            "127.0.0.1:7000".parse().unwrap(),
            &NetworkConfig::default(),
            Weak::new(),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let (publisher, mut receiver) = channel(2);
        let connection = detached_connection();

        assert_ok!(
            publisher
                .publish(
                    ClientJoined {
                        handle: connection.handle()
                    },
                    Duration::from_millis(10)
                )
                .await
        );

        let joined = receiver.recv().await.unwrap();
        assert_eq!(joined.handle.id(), connection.id());
    }

    #[tokio::test]
    async fn test_publish_times_out_when_full() {
        let (publisher, _receiver) = channel(1);
        let connection = detached_connection();

        let first = ClientJoined {
            handle: connection.handle(),
        };
        assert_ok!(publisher.publish(first, Duration::from_millis(10)).await);

        let second = ClientJoined {
            handle: connection.handle(),
        };
        let started = tokio::time::Instant::now();
        let err = publisher
            .publish(second, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::SimulationUnavailable));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (publisher, mut receiver) = channel(1);
        publisher.close();
        assert!(publisher.is_closed());
        assert!(receiver.recv().await.is_none());

        let connection = detached_connection();
        let err = publisher
            .publish(
                ClientJoined {
                    handle: connection.handle(),
                },
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::SimulationUnavailable));
    }

    #[tokio::test]
    async fn test_handle_does_not_keep_connection_alive() {
        let connection = detached_connection();
        let handle = connection.handle();
        assert!(handle.is_alive());
        assert_ok!(handle.send(Envelope::empty(MessageKind::Pong)));

        drop(connection);

        assert!(!handle.is_alive());
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(handle.receive().is_none());
        assert!(matches!(
            handle.send(Envelope::empty(MessageKind::Pong)),
            Err(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_handle_close_closes_connection() {
        let connection = detached_connection();
        let handle = connection.handle();

        handle.close().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!handle.is_alive());
    }
}
