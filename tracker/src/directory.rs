//! Server directory: who stores a player's record and who serves an area.

use log::{debug, info, warn};
use shared::datagram::{Datagram, UdpMessage};
use shared::ring::{user_ring_id, Ring, ServerEntry};
use shared::udp_engine::{DatagramHandler, Flow, Outbox};
use shared::world::{Area, Location};
use shared::{Error, Result, DUNGEON_SIZE_X, DUNGEON_SIZE_Y};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// One listed server and the strip of the map it hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaServer {
    pub entry: ServerEntry,
    pub area: Area,
}

#[derive(Debug, Clone, Default)]
pub struct Directory {
    ring: Ring,
    areas: Vec<AreaServer>,
}

impl Directory {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::resource(format!("cannot read server list {}: {}", path.display(), e))
        })?;
        let directory = Self::parse(&text)?;
        info!(
            "Loaded {} servers from {}: {}",
            directory.areas.len(),
            path.display(),
            directory.ring
        );
        Ok(directory)
    }

    /// Parses `ip tcp_port udp_port` lines. Blank lines and `#` comments are
    /// skipped; a repeated address keeps its first listing.
    pub fn parse(text: &str) -> Result<Self> {
        let mut servers: Vec<ServerEntry> = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = parse_server(line)
                .map_err(|e| Error::malformed(format!("server list line {}: {}", number + 1, e)))?;
            if servers.iter().any(|known| known.same_address(&entry)) {
                warn!("server {} listed twice, keeping the first", entry.tcp_addr());
                continue;
            }
            servers.push(entry);
        }
        // Each server needs at least one column of its own
        if servers.len() > usize::from(DUNGEON_SIZE_X) {
            return Err(Error::resource(format!(
                "{} servers listed, the dungeon only splits into {}",
                servers.len(),
                DUNGEON_SIZE_X
            )));
        }
        Ok(Self::from_servers(servers))
    }

    /// Servers keep their listing order for the area split; the ring sorts
    /// its own copy.
    pub fn from_servers(servers: Vec<ServerEntry>) -> Self {
        let count = servers.len();
        let ring = Ring::new(servers.clone());
        let areas = servers
            .into_iter()
            .enumerate()
            .map(|(index, entry)| AreaServer {
                area: strip(index, count),
                entry: ring.get(entry.ring_id).cloned().unwrap_or(entry),
            })
            .collect();
        Self { ring, areas }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn areas(&self) -> &[AreaServer] {
        &self.areas
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Storage server for `name`: ip and udp port.
    pub fn storage_for(&self, name: &str) -> Option<(Ipv4Addr, u16)> {
        let owner = self.ring.owner_of(user_ring_id(name))?;
        Some((owner.ip, owner.udp_port?))
    }

    pub fn area_for(&self, x: u8, y: u8) -> Option<&AreaServer> {
        let location = Location::new(x, y);
        self.areas
            .iter()
            .find(|server| server.area.contains(location))
    }

    fn answer(&self, message: UdpMessage) -> Option<UdpMessage> {
        match message {
            UdpMessage::StorageLocationRequest { name } => {
                let Some((ip, udp_port)) = self.storage_for(&name) else {
                    warn!("no storage server for {}", name);
                    return None;
                };
                debug!("{} is stored at {}:{}", name, ip, udp_port);
                Some(UdpMessage::StorageLocationResponse { ip, udp_port })
            }
            UdpMessage::ServerAreaRequest { x, y } => {
                let Some(server) = self.area_for(x, y) else {
                    warn!("no server hosts ({},{})", x, y);
                    return None;
                };
                debug!("({},{}) is hosted by {} in {}", x, y, server.entry.tcp_addr(), server.area);
                Some(UdpMessage::ServerAreaResponse {
                    ip: server.entry.ip,
                    tcp_port: server.entry.tcp_port,
                    area: server.area,
                })
            }
            other => {
                warn!("tracker does not answer {:?}", other.kind());
                None
            }
        }
    }
}

impl DatagramHandler for Directory {
    fn handle(&mut self, datagram: &Datagram, outbox: &mut Outbox) -> Result<Flow> {
        match datagram.message() {
            Ok(message) => {
                if let Some(reply) = self.answer(message) {
                    outbox.send(datagram.source, datagram.sequence_id, reply);
                }
            }
            Err(e) => warn!("Received malformed UDP packet from {}: {}", datagram.source, e),
        }
        Ok(Flow::Continue)
    }
}

fn parse_server(line: &str) -> Result<ServerEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [ip, tcp_port, udp_port] = fields.as_slice() else {
        return Err(Error::malformed(format!("expected `ip tcp_port udp_port`, got `{}`", line)));
    };
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| Error::malformed(format!("bad ip `{}`", ip)))?;
    let port = |text: &str| -> Result<u16> {
        match text.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(Error::malformed(format!("bad port `{}`", text))),
        }
    };
    Ok(ServerEntry::for_address(ip, port(*tcp_port)?, Some(port(*udp_port)?)))
}

/// Vertical strip `index` of `count` across the full map height.
fn strip(index: usize, count: usize) -> Area {
    let width = usize::from(DUNGEON_SIZE_X);
    let edge = |i: usize| (i * width / count) as u8;
    Area {
        min_x: edge(index),
        max_x: edge(index + 1).saturating_sub(1),
        min_y: 0,
        max_y: DUNGEON_SIZE_Y - 1,
    }
}
