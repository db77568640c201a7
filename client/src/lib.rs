//! # Game Client Library
//!
//! Terminal client for the sharded world. The player types commands at a
//! prompt; the client finds where the player's record is stored and which
//! area server to play on, then plays over TCP until a move crosses into
//! another area or the player logs out.
//!
//! ## Module Organization
//!
//! ### Input Module (`input`)
//! Parses prompt lines into commands and reports why a line was rejected.
//!
//! ### Console Module (`console`)
//! Every user-visible message, behind a [`console::Console`] trait so tests
//! can record what the player would have seen.
//!
//! ### Session Module (`session`)
//! The client state machine. It answers datagrams as a
//! [`shared::udp_engine::DatagramHandler`] and stream messages from the area
//! server, and queues the messages commands produce.
//!
//! ### Network Module (`network`)
//! Owns the sockets. UDP lookups run through the reliable engine; the TCP
//! phase selects over input lines, server bytes and the autosave timer.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::console::StdoutConsole;
//! use client::network::{Client, ClientConfig, DEFAULT_AUTOSAVE};
//! use tokio::io::BufReader;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig {
//!         tracker: "127.0.0.1:1026".parse()?,
//!         autosave: DEFAULT_AUTOSAVE,
//!     };
//!     let mut client = Client::bind(config, StdoutConsole).await?;
//!     client.run(BufReader::new(tokio::io::stdin())).await?;
//!     Ok(())
//! }
//! ```

pub mod console;
pub mod input;
pub mod network;
pub mod session;
