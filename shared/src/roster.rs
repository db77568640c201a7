//! Persisted peer roster: one `ring_id ip tcp_port` line per server.

use crate::ring::{Ring, ServerEntry};
use crate::{Error, Result};
use log::{debug, info};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Roster {
    path: PathBuf,
    me: ServerEntry,
    first_read: bool,
}

impl Roster {
    pub fn new(path: impl Into<PathBuf>, me: ServerEntry) -> Self {
        Self {
            path: path.into(),
            me,
            first_read: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn me(&self) -> &ServerEntry {
        &self.me
    }

    /// Reads every peer and builds the ring.
    ///
    /// The file is created when missing. On the first read this server is
    /// appended if absent; afterwards its absence is an error, as is another
    /// address claiming our ring id.
    pub fn load(&mut self) -> Result<Ring> {
        if !self.path.exists() {
            debug!("creating roster {}", self.path.display());
            fs::File::create(&self.path).map_err(|err| {
                Error::resource(format!("cannot create {}: {}", self.path.display(), err))
            })?;
        }
        let contents = fs::read_to_string(&self.path).map_err(|err| {
            Error::resource(format!("cannot read {}: {}", self.path.display(), err))
        })?;

        let mut entries = Vec::new();
        let mut found_me = false;
        for line in contents.lines().map(str::trim).take_while(|line| !line.is_empty()) {
            let entry = parse_line(line)?;
            if entry.ring_id == self.me.ring_id {
                if !entry.same_address(&self.me) {
                    return Err(Error::resource(format!(
                        "ring id {} of {}:{} is already taken by {}:{}",
                        self.me.ring_id, self.me.ip, self.me.tcp_port, entry.ip, entry.tcp_port
                    )));
                }
                if !found_me {
                    entries.push(self.me.clone());
                    found_me = true;
                }
            } else {
                entries.push(entry);
            }
        }

        if !found_me {
            if !self.first_read {
                return Err(Error::resource(format!(
                    "server {} vanished from {}",
                    self.me.ring_id,
                    self.path.display()
                )));
            }
            self.append_me()?;
            entries.push(self.me.clone());
        }
        self.first_read = false;

        let ring = Ring::new(entries);
        info!("P2P: {}: {}", self.path.display(), ring);
        Ok(ring)
    }

    fn append_me(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| {
                Error::resource(format!("cannot open {}: {}", self.path.display(), err))
            })?;
        writeln!(file, "{}", format_line(&self.me))
            .map_err(|err| Error::resource(format!("cannot append to {}: {}", self.path.display(), err)))?;
        info!("P2P: registered {} in {}", self.me.ring_id, self.path.display());
        Ok(())
    }
}

pub fn format_line(entry: &ServerEntry) -> String {
    format!("{} {} {}", entry.ring_id, entry.ip, entry.tcp_port)
}

pub fn parse_line(line: &str) -> Result<ServerEntry> {
    let invalid = || Error::resource(format!("invalid roster line {:?}", line));
    let mut fields = line.split_whitespace();
    let ring_id: u32 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
    let ip: Ipv4Addr = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
    let tcp_port: u16 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
    if fields.next().is_some() || ring_id >= crate::ring::RING_SIZE {
        return Err(invalid());
    }
    Ok(ServerEntry::new(ring_id, ip, tcp_port, None))
}
