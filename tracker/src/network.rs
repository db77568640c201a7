//! Tracker event loop

use crate::directory::Directory;
use log::info;
use shared::reliable::Mode;
use shared::udp_engine::UdpEngine;
use shared::Result;
use std::net::SocketAddr;

pub struct Tracker {
    engine: UdpEngine,
    directory: Directory,
}

impl Tracker {
    pub async fn bind(addr: SocketAddr, directory: Directory) -> Result<Self> {
        let engine = UdpEngine::bind(addr, Mode::NoResend).await?;
        info!(
            "Tracker listening on {} with {} servers",
            engine.local_addr()?,
            directory.len()
        );
        Ok(Self { engine, directory })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.engine.local_addr()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Answers lookups until the socket fails.
    pub async fn run(&mut self) -> Result<()> {
        self.engine.run(&mut self.directory).await
    }
}
