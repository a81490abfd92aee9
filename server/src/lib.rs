//! # Game Server Network Front End
//!
//! This library accepts game clients over WebSocket, keeps track of every
//! live connection, and hands newly admitted clients to the game simulation.
//! The simulation never touches sockets: it talks to each client through a
//! pair of bounded message queues.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Clients authenticate with an `Authorization: Bearer <token>` header on the
//! WebSocket upgrade request. Requests without a valid token are refused with
//! an HTTP status before the upgrade completes, and never become connections.
//!
//! ### Connection Lifecycle
//! Every connection moves through `Handshaking → Active → Closing → Closed`.
//! Each one runs two tasks:
//! - **Inbound**: reads frames, decodes them, and queues envelopes for the
//!   simulation. Malformed frames are skipped; a full queue drops the newest
//!   envelope instead of stalling the read loop.
//! - **Outbound**: drains the outbound queue into the transport in order.
//!
//! A failure in one connection's transport closes that connection only.
//!
//! ### Shutdown
//! Shutdown stops admissions, closes every connection concurrently, waits a
//! bounded grace period for their tasks, and finally closes the simulation
//! channel so the game loop ends.
//!
//! ## Module Organization
//!
//! ### Connection (`connection`) and Registry (`registry`)
//! The per-client state machine and the map that owns it:
//! - Session ids and connection state
//! - Bounded inbound and outbound queues
//! - Exactly-once teardown
//!
//! ### Simulation Boundary (`simulation`) and Game (`game`)
//! The join channel towards the simulation, the non-owning
//! `ConnectionHandle`, and a minimal fixed-tick loop answering pings.
//!
//! ### Handshake (`handshake`), Network (`network`) and Auth (`auth`)
//! The TCP listener, the WebSocket upgrade, and token verification.
//! Requests that are not WebSocket upgrades get an HTTP 400.
//!
//! ### Meta (`meta`)
//! A separate plain HTTP listener answering `GET /health`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::auth::AllowAnyToken;
//! use server::config::NetworkConfig;
//! use server::game::Game;
//! use server::network::NetworkServer;
//! use server::registry::ConnectionRegistry;
//! use server::shutdown::ShutdownCoordinator;
//! use server::simulation;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NetworkConfig::default();
//!     let shutdown = CancellationToken::new();
//!     let (joins, join_receiver) = simulation::channel(config.join_capacity);
//!
//!     let registry = Arc::new(ConnectionRegistry::new(
//!         config.clone(),
//!         Arc::new(AllowAnyToken),
//!         joins,
//!         shutdown.clone(),
//!     ));
//!     let server = NetworkServer::bind("127.0.0.1:8080", Arc::clone(&registry), shutdown.clone()).await?;
//!
//!     tokio::spawn(Game::new(join_receiver, 30, shutdown.clone()).run());
//!     tokio::spawn(ShutdownCoordinator::new(registry, config.shutdown_grace).run(shutdown.clone()));
//!
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod game;
pub mod handshake;
mod http_io;
pub mod meta;
pub mod network;
pub mod registry;
pub mod shutdown;
pub mod simulation;
pub mod transport;

pub use connection::{Connection, ConnectionState, SessionId};
pub use error::NetworkError;
pub use registry::ConnectionRegistry;
pub use simulation::{ClientJoined, ConnectionHandle};
