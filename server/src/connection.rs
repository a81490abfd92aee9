//! A single live client connection and its two I/O tasks.
//!
//! Each connection owns one duplex transport, split into a read half driven
//! by the inbound task and a write half driven by the outbound task. The
//! simulation talks to a connection only through its two bounded queues:
//! - `inbound`: decoded envelopes waiting for the simulation. When full the
//!   newest envelope is dropped so the read loop never stalls.
//! - `outbound`: envelopes waiting to be written. When full, [`Connection::send`]
//!   fails fast with [`NetworkError::Congested`] so a slow client can never
//!   block the simulation loop.
//!
//! Lifecycle: `Handshaking → Active → Closing → Closed`. Only the first
//! [`Connection::close`] performs teardown; every later call is a no-op.

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::registry::Roster;
use crate::simulation::ConnectionHandle;
use crate::transport::{FrameSink, FrameSource, Transport};
use log::{debug, info, warn};
use protocol::Envelope;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// Locks a std mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel ends created with the connection and handed to its tasks on start.
struct Pending {
    inbound_tx: mpsc::Sender<Envelope>,
    outbound_rx: mpsc::Receiver<Envelope>,
}

/// What the outbound task hands back so teardown can close the transport
/// and discard unsent envelopes.
type OutboundExit = (Box<dyn FrameSink>, mpsc::Receiver<Envelope>);

struct Tasks {
    inbound: JoinHandle<()>,
    outbound: JoinHandle<OutboundExit>,
}

pub struct Connection {
    id: SessionId,
    remote_addr: SocketAddr,
    state: watch::Sender<ConnectionState>,
    closing: AtomicBool,
    cancel: CancellationToken,
    outbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: Mutex<mpsc::Receiver<Envelope>>,
    pending: Mutex<Option<Pending>>,
    tasks: Mutex<Option<Tasks>>,
    roster: Weak<Mutex<Roster>>,
    teardown_timeout: Duration,
    max_consecutive_malformed: usize,
}

impl Connection {
    /// Creates a connection in the `Handshaking` state.
    ///
    /// `roster` is the registry map the connection removes itself from when
    /// it starts closing; `shutdown` is the process-wide cancellation signal.
    pub(crate) fn new(
        remote_addr: SocketAddr,
        config: &NetworkConfig,
        roster: Weak<Mutex<Roster>>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (state, _) = watch::channel(ConnectionState::Handshaking);

        Arc::new(Self {
            id: SessionId::next(),
            remote_addr,
            state,
            closing: AtomicBool::new(false),
            cancel: shutdown.child_token(),
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            pending: Mutex::new(Some(Pending {
                inbound_tx,
                outbound_rx,
            })),
            tasks: Mutex::new(None),
            roster,
            teardown_timeout: config.teardown_timeout,
            max_consecutive_malformed: config.max_consecutive_malformed,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Non-owning handle for the simulation side.
    pub fn handle(self: &Arc<Self>) -> ConnectionHandle {
        ConnectionHandle::new(self.id, self.remote_addr, Arc::downgrade(self))
    }

    /// Moves a freshly registered connection from `Handshaking` to `Active`.
    pub(crate) fn activate(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Active;
                true
            } else {
                false
            }
        });
    }

    /// Spawns the inbound, outbound and watcher tasks on `tracker`.
    pub(crate) fn start<T: Transport>(self: &Arc<Self>, transport: T, tracker: &TaskTracker) {
        let Some(Pending {
            inbound_tx,
            outbound_rx,
        }) = lock(&self.pending).take()
        else {
            warn!("Session {} started twice, ignoring", self.id);
            return;
        };

        let (source, sink) = transport.split();

        let inbound = tracker.spawn(run_inbound(
            self.id,
            source,
            inbound_tx,
            self.cancel.clone(),
            self.max_consecutive_malformed,
        ));
        let outbound = tracker.spawn(run_outbound(
            self.id,
            sink,
            outbound_rx,
            self.cancel.clone(),
        ));
        *lock(&self.tasks) = Some(Tasks { inbound, outbound });

        // I/O tasks only cancel the token on failure; the watcher turns that
        // into a full close so the connection also leaves the registry.
        let connection = Arc::clone(self);
        tracker.spawn(async move {
            connection.cancel.cancelled().await;
            connection.close().await;
        });
    }

    /// Queues an envelope for transmission without waiting.
    pub fn send(&self, envelope: Envelope) -> Result<(), NetworkError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(NetworkError::ConnectionClosed);
        }
        self.outbound_tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => NetworkError::Congested,
            TrySendError::Closed(_) => NetworkError::ConnectionClosed,
        })
    }

    /// Takes the oldest decoded envelope, if any is pending.
    pub fn receive(&self) -> Option<Envelope> {
        lock(&self.inbound_rx).try_recv().ok()
    }

    /// Closes the connection.
    ///
    /// Safe to call any number of times from any task; only the first call
    /// tears down, the rest return immediately. Use [`Connection::closed`]
    /// to wait for teardown to finish.
    pub async fn close(&self) {
        if self.deregister_and_begin_close() {
            self.teardown().await;
        }
    }

    /// Waits until the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    fn deregister_and_begin_close(&self) -> bool {
        match self.roster.upgrade() {
            Some(roster) => {
                let mut roster = lock(&roster);
                roster.remove(self.id);
                self.begin_close()
            }
            None => self.begin_close(),
        }
    }

    /// Marks the connection `Closing` and cancels its tasks. Returns true
    /// only for the caller that won the transition.
    ///
    /// Callers holding the registry lock must remove the entry in the same
    /// critical section.
    pub(crate) fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.send_replace(ConnectionState::Closing);
        self.cancel.cancel();
        true
    }

    /// Second half of closing: wait for both tasks, close the transport,
    /// discard unsent envelopes, then publish `Closed`.
    pub(crate) async fn teardown(&self) {
        let tasks = lock(&self.tasks).take();
        let mut discarded = 0;

        match tasks {
            Some(Tasks {
                mut inbound,
                mut outbound,
            }) => {
                if timeout(self.teardown_timeout, &mut inbound).await.is_err() {
                    warn!("Session {}: inbound task did not stop, aborting", self.id);
                    inbound.abort();
                }

                match timeout(self.teardown_timeout, &mut outbound).await {
                    Ok(Ok((mut sink, outbound_rx))) => {
                        match timeout(self.teardown_timeout, sink.close()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!("Session {}: error closing transport: {}", self.id, e),
                            Err(_) => warn!("Session {}: transport close timed out", self.id),
                        }
                        discarded = discard(outbound_rx);
                    }
                    Ok(Err(e)) => warn!("Session {}: outbound task failed: {}", self.id, e),
                    Err(_) => {
                        warn!("Session {}: outbound task did not stop, aborting", self.id);
                        outbound.abort();
                    }
                }
            }
            None => {
                if let Some(pending) = lock(&self.pending).take() {
                    discarded = discard(pending.outbound_rx);
                }
            }
        }

        if discarded > 0 {
            debug!(
                "Session {}: discarded {} unsent envelopes",
                self.id, discarded
            );
        }

        self.state.send_replace(ConnectionState::Closed);
        info!("Client {} disconnected", self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

fn discard(mut outbound_rx: mpsc::Receiver<Envelope>) -> usize {
    outbound_rx.close();
    let mut count = 0;
    while outbound_rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

/// Reads frames until cancellation, peer close, a transport error, or too
/// many consecutive malformed frames.
async fn run_inbound(
    id: SessionId,
    mut source: Box<dyn FrameSource>,
    inbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    max_consecutive_malformed: usize,
) {
    let mut consecutive_malformed = 0;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => frame,
        };

        match frame {
            Ok(Some(bytes)) => match protocol::decode(&bytes) {
                Ok(envelope) => {
                    consecutive_malformed = 0;
                    match inbound.try_send(envelope) {
                        Ok(()) => {}
                        Err(TrySendError::Full(dropped)) => {
                            warn!(
                                "Session {}: inbound queue full, dropping {:?}",
                                id, dropped.kind
                            );
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Err(e) => {
                    consecutive_malformed += 1;
                    let err = NetworkError::from(e);
                    warn!("Session {}: {} ({} bytes)", id, err, bytes.len());
                    if max_consecutive_malformed > 0
                        && consecutive_malformed >= max_consecutive_malformed
                    {
                        warn!(
                            "Session {}: {} consecutive malformed frames, closing",
                            id, consecutive_malformed
                        );
                        break;
                    }
                }
            },
            Ok(None) => {
                debug!("Session {}: peer closed the stream", id);
                break;
            }
            Err(e) => {
                warn!("Session {}: {}", id, NetworkError::TransportFailure(e));
                break;
            }
        }
    }

    cancel.cancel();
}

/// Writes queued envelopes in order until cancellation or a write error.
/// Unsent envelopes are left in the queue for teardown to discard.
async fn run_outbound(
    id: SessionId,
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) -> OutboundExit {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let frame = protocol::encode(&envelope);
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            written = sink.send_frame(frame) => written,
        };

        if let Err(e) = written {
            warn!("Session {}: {}", id, NetworkError::TransportFailure(e));
            break;
        }
    }

    cancel.cancel();
    (sink, outbound)
}
