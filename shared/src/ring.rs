//! Consistent-hash ring of area servers.
//!
//! Servers and user names hash onto a circular keyspace of [`RING_SIZE`]
//! ids. A server stores the canonical copy of every user whose id falls in
//! its primary range and a shadow copy of its predecessor's range.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const RING_SIZE: u32 = 1024;

/// `h = b + 31 * h` over the key bytes, reduced onto the ring.
pub fn ring_id(key: &[u8]) -> u32 {
    key.iter()
        .fold(0u32, |hash, &b| (b as u32).wrapping_add(hash.wrapping_mul(31)))
        % RING_SIZE
}

pub fn user_ring_id(name: &str) -> u32 {
    ring_id(name.as_bytes())
}

/// A server hashes its IPv4 octets followed by its TCP port in network
/// order.
pub fn server_ring_id(ip: Ipv4Addr, tcp_port: u16) -> u32 {
    let mut key = [0u8; 6];
    key[..4].copy_from_slice(&ip.octets());
    key[4..].copy_from_slice(&tcp_port.to_be_bytes());
    ring_id(&key)
}

/// Inclusive interval of ring ids. When `low > high` it wraps past zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub low: u32,
    pub high: u32,
}

impl KeyRange {
    pub fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    /// The range a server with id `id` owns when `previous` precedes it.
    pub fn after(previous: u32, id: u32) -> Self {
        Self::new((previous + 1) % RING_SIZE, id)
    }

    pub fn contains(&self, key: u32) -> bool {
        if self.low <= self.high {
            self.low <= key && key <= self.high
        } else {
            key >= self.low || key <= self.high
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {})", self.low, self.high)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub ring_id: u32,
    pub ip: Ipv4Addr,
    pub tcp_port: u16,
    /// Only known for servers listed with the tracker.
    pub udp_port: Option<u16>,
    pub primary_range: KeyRange,
    pub backup_range: KeyRange,
}

impl ServerEntry {
    pub fn new(ring_id: u32, ip: Ipv4Addr, tcp_port: u16, udp_port: Option<u16>) -> Self {
        let everything = KeyRange::after(ring_id, ring_id);
        Self {
            ring_id,
            ip,
            tcp_port,
            udp_port,
            primary_range: everything,
            backup_range: everything,
        }
    }

    pub fn for_address(ip: Ipv4Addr, tcp_port: u16, udp_port: Option<u16>) -> Self {
        Self::new(server_ring_id(ip, tcp_port), ip, tcp_port, udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.tcp_port))
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_port
            .map(|port| SocketAddr::V4(SocketAddrV4::new(self.ip, port)))
    }

    pub fn same_address(&self, other: &ServerEntry) -> bool {
        self.ip == other.ip && self.tcp_port == other.tcp_port
    }
}

/// How a peer sits relative to this server on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRelation {
    Predecessor,
    Successor,
    Both,
    Unrelated,
}

/// Servers sorted by ring id with ranges computed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ring {
    entries: Vec<ServerEntry>,
}

impl Ring {
    pub fn new(mut entries: Vec<ServerEntry>) -> Self {
        entries.sort_by_key(|entry| entry.ring_id);
        let mut ring = Self { entries };
        ring.calculate_ranges();
        ring
    }

    /// `primary(i) = (id(i-1), id(i)]` and `backup(i) = primary(i-1)`,
    /// indices taken modulo the ring length.
    fn calculate_ranges(&mut self) {
        let len = self.entries.len();
        if len == 0 {
            return;
        }
        for i in 0..len {
            let previous = self.entries[(i + len - 1) % len].ring_id;
            let entry = &mut self.entries[i];
            entry.primary_range = KeyRange::after(previous, entry.ring_id);
        }
        for i in 0..len {
            self.entries[i].backup_range = self.entries[(i + len - 1) % len].primary_range;
        }
    }

    pub fn entries(&self) -> &[ServerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ring_id: u32) -> Option<&ServerEntry> {
        self.entries.iter().find(|entry| entry.ring_id == ring_id)
    }

    pub fn position(&self, ring_id: u32) -> Option<usize> {
        self.entries.iter().position(|entry| entry.ring_id == ring_id)
    }

    fn neighbour(&self, ring_id: u32, offset: usize) -> Option<&ServerEntry> {
        if self.entries.len() <= 1 {
            return None;
        }
        let index = self.position(ring_id)?;
        self.entries.get((index + offset) % self.entries.len())
    }

    /// `None` for an unknown id or a ring of one.
    pub fn successor(&self, ring_id: u32) -> Option<&ServerEntry> {
        self.neighbour(ring_id, 1)
    }

    pub fn predecessor(&self, ring_id: u32) -> Option<&ServerEntry> {
        let len = self.entries.len();
        self.neighbour(ring_id, len.saturating_sub(1))
    }

    pub fn classify(&self, me: u32, peer: u32) -> PeerRelation {
        if me == peer || self.position(peer).is_none() {
            return PeerRelation::Unrelated;
        }
        let precedes = self.successor(peer).map(|s| s.ring_id) == Some(me);
        let follows = self.predecessor(peer).map(|p| p.ring_id) == Some(me);
        match (precedes, follows) {
            (true, true) => PeerRelation::Both,
            (true, false) => PeerRelation::Predecessor,
            (false, true) => PeerRelation::Successor,
            (false, false) => PeerRelation::Unrelated,
        }
    }

    /// The server whose primary range holds `key`.
    pub fn owner_of(&self, key: u32) -> Option<&ServerEntry> {
        self.entries
            .iter()
            .find(|entry| entry.primary_range.contains(key))
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p2p_head")?;
        for entry in &self.entries {
            write!(f, "->{}", entry.primary_range)?;
        }
        Ok(())
    }
}
