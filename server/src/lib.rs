//! # Area Server Library
//!
//! One server of the sharded world. Each server owns a region of the grid
//! where players meet, stores the records of the players whose names hash
//! into its part of the ring, and keeps a backup copy of its predecessor's
//! records.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! All state is owned by [`network::Server`] and mutated from one loop that
//! selects over the TCP listener, the UDP socket, connection events and a
//! short tick. Socket reader tasks only forward owned byte chunks.
//!
//! ### Two Transports
//! Players and ring neighbours talk over framed TCP streams. Clients look up
//! and save player state over UDP datagrams answered by
//! [`storage::StorageService`].
//!
//! ## Module Organization
//!
//! - `session`: connection ids, reader/writer tasks, per-connection buffers
//! - `game`: the authoritative world of logged-in players
//! - `storage`: player state lookups and saves over UDP
//! - `peer`: ring membership, record hand-over on join, backup replication
//! - `network`: the event loop tying the above together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//! use std::net::Ipv4Addr;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::bind(ServerConfig {
//!         ip: Ipv4Addr::LOCALHOST,
//!         tcp_port: 1026,
//!         udp_port: 1027,
//!         roster: "peers.lst".into(),
//!         users_dir: "users".into(),
//!     })
//!     .await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod network;
pub mod peer;
pub mod session;
pub mod storage;
