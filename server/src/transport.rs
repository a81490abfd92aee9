//! Duplex byte-frame transports the connection core runs on top of.
//!
//! A [`Transport`] is split once into an independent read half and write
//! half so the inbound and outbound tasks of a connection never contend for
//! the same lock. Both halves must be cancel-safe: the connection races every
//! read and write against its cancellation token.

use async_trait::async_trait;
use std::io;

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next physical frame. `Ok(None)` means the peer closed
    /// the stream cleanly.
    async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Vec<u8>) -> io::Result<()>;

    /// Closes the underlying transport. Called at most once per connection.
    async fn close(&mut self) -> io::Result<()>;
}

pub trait Transport: Send + 'static {
    fn split(self) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);
}

/// In-memory transport backed by tokio channels.
///
/// Only built for tests and with the `test-util` feature. The
/// [`memory::Peer`] side plays the remote client.
#[cfg(any(test, feature = "test-util"))]
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// What the remote side pushes towards the server.
    #[derive(Debug)]
    pub enum Incoming {
        Frame(Vec<u8>),
        Error(io::ErrorKind),
    }

    pub struct MemoryTransport {
        incoming: mpsc::UnboundedReceiver<Incoming>,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        closes: Arc<AtomicUsize>,
        fail_writes: bool,
    }

    /// Remote end of a [`MemoryTransport`].
    pub struct Peer {
        pub incoming: mpsc::UnboundedSender<Incoming>,
        pub outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
        closes: Arc<AtomicUsize>,
    }

    impl Peer {
        pub fn push_frame(&self, frame: Vec<u8>) {
            let _ = self.incoming.send(Incoming::Frame(frame));
        }

        pub fn fail_read(&self, kind: io::ErrorKind) {
            let _ = self.incoming.send(Incoming::Error(kind));
        }

        /// Number of times the server side closed the transport.
        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    pub fn pair() -> (MemoryTransport, Peer) {
        build(false)
    }

    /// Like [`pair`], but every write fails with `BrokenPipe`.
    pub fn pair_with_failing_writes() -> (MemoryTransport, Peer) {
        build(true)
    }

    fn build(fail_writes: bool) -> (MemoryTransport, Peer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = MemoryTransport {
            incoming: in_rx,
            outgoing: out_tx,
            closes: Arc::clone(&closes),
            fail_writes,
        };
        let peer = Peer {
            incoming: in_tx,
            outgoing: out_rx,
            closes,
        };
        (transport, peer)
    }

    struct MemorySource {
        incoming: mpsc::UnboundedReceiver<Incoming>,
    }

    struct MemorySink {
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        closes: Arc<AtomicUsize>,
        fail_writes: bool,
    }

    impl Transport for MemoryTransport {
        fn split(self) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
            (
                Box::new(MemorySource {
                    incoming: self.incoming,
                }),
                Box::new(MemorySink {
                    outgoing: self.outgoing,
                    closes: self.closes,
                    fail_writes: self.fail_writes,
                }),
            )
        }
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
            match self.incoming.recv().await {
                Some(Incoming::Frame(frame)) => Ok(Some(frame)),
                Some(Incoming::Error(kind)) => Err(io::Error::new(kind, "injected read failure")),
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_frame(&mut self, frame: Vec<u8>) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "injected write failure",
                ));
            }
            self.outgoing
                .send(frame)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
        }

        async fn close(&mut self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory;
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_delivers_frames() {
        let (transport, mut peer) = memory::pair();
        let (mut source, mut sink) = transport.split();

        peer.push_frame(vec![1, 2, 3]);
        assert_eq!(source.next_frame().await.unwrap(), Some(vec![1, 2, 3]));

        sink.send_frame(vec![4, 5]).await.unwrap();
        assert_eq!(peer.outgoing.recv().await, Some(vec![4, 5]));

        sink.close().await.unwrap();
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_transport_injected_errors() {
        let (transport, peer) = memory::pair_with_failing_writes();
        let (mut source, mut sink) = transport.split();

        peer.fail_read(io::ErrorKind::ConnectionReset);
        let err = source.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        let err = sink.send_frame(vec![0]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_memory_transport_end_of_stream() {
        let (transport, peer) = memory::pair();
        let (mut source, _sink) = transport.split();
        drop(peer);
        assert_eq!(source.next_frame().await.unwrap(), None);
    }
}
