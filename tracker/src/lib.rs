//! # Tracker Library
//!
//! Directory service for the sharded world. It reads the list of game
//! servers once at startup and answers two datagram lookups:
//!
//! - which server stores a player's record (the ring owner of the name)
//! - which server hosts a map location (vertical strips in listing order)
//!
//! The tracker never retransmits; clients own the retry budget.

pub mod directory;
pub mod network;
