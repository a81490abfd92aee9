//! Minimal fixed-tick simulation.
//!
//! The game consumes join events from the network front end and, once per
//! tick, takes up to a fixed budget of messages from every client's inbound
//! queue. It only understands the
//! control messages: `Ping` is answered with a `Pong` carrying the same
//! payload and `Disconnect` closes the client. Everything else is logged.

use crate::config::NetworkConfig;
use crate::connection::SessionId;
use crate::simulation::{ClientJoined, ConnectionHandle, JoinReceiver};
use log::{debug, info, warn};
use protocol::{Envelope, MessageKind};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct Game {
    joins: JoinReceiver,
    clients: HashMap<SessionId, ConnectionHandle>,
    tick_duration: Duration,
    /// Messages taken from one client per tick.
    message_budget: usize,
    shutdown: CancellationToken,
}

impl Game {
    /// `tick_rate` is in updates per second and must be non-zero.
    pub fn new(joins: JoinReceiver, tick_rate: u32, shutdown: CancellationToken) -> Self {
        Self {
            joins,
            clients: HashMap::new(),
            tick_duration: Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1))),
            message_budget: NetworkConfig::default().inbound_capacity,
            shutdown,
        }
    }

    /// Caps how many messages one client can have processed per tick, so a
    /// flooding client cannot stretch a tick while its queue refills.
    pub fn with_message_budget(mut self, budget: usize) -> Self {
        self.message_budget = budget.max(1);
        self
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Runs until the join channel is closed or shutdown is signalled.
    pub async fn run(mut self) {
        let mut interval_timer = interval(self.tick_duration);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                joined = self.joins.recv() => match joined {
                    Some(joined) => self.add_client(joined),
                    None => break,
                },
                _ = interval_timer.tick() => self.tick(),
            }
        }

        info!("Simulation stopped with {} clients", self.clients.len());
    }

    fn add_client(&mut self, joined: ClientJoined) {
        let handle = joined.handle;
        info!("Client {} joined the simulation", handle.id());
        self.clients.insert(handle.id(), handle);
    }

    /// Processes queued messages within the budget, then forgets clients
    /// that are gone.
    pub fn tick(&mut self) {
        for handle in self.clients.values() {
            for _ in 0..self.message_budget {
                let Some(envelope) = handle.receive() else {
                    break;
                };
                handle_message(handle, envelope);
            }
        }

        self.clients.retain(|id, handle| {
            let alive = handle.is_alive();
            if !alive {
                info!("Client {} left the simulation", id);
            }
            alive
        });
    }
}

fn handle_message(handle: &ConnectionHandle, envelope: Envelope) {
    match envelope.kind {
        MessageKind::Ping => {
            let pong = Envelope::new(MessageKind::Pong, envelope.payload);
            if let Err(e) = handle.send(pong) {
                debug!("Dropped pong for client {}: {}", handle.id(), e);
            }
        }
        MessageKind::Disconnect => {
            info!("Client {} requested disconnect", handle.id());
            let handle = handle.clone();
            tokio::spawn(async move { handle.close().await });
        }
        MessageKind::Input | MessageKind::Chat | MessageKind::Action => {
            debug!(
                "Client {} sent {:?} ({} bytes)",
                handle.id(),
                envelope.kind,
                envelope.payload.len()
            );
        }
        MessageKind::Pong | MessageKind::WorldUpdate => {
            warn!(
                "Client {} sent unexpected {:?}",
                handle.id(),
                envelope.kind
            );
        }
    }
}
