//! Retransmission and duplicate-suppression state for one UDP endpoint.
//!
//! This module does no I/O. [`ReliabilityState`] is told what was sent and
//! what arrived, and answers which packet is due again and whether an
//! arrival is new. The socket driver lives in `udp_engine`.

use crate::{Error, Result, MAX_NUM_SENT_HISTORY};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

pub const MAX_SEND_ATTEMPTS: u32 = 4;
pub const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Whether this endpoint initiates requests and retries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Resend,
    NoResend,
}

/// The single request awaiting a response.
#[derive(Debug, Clone)]
pub struct Outstanding {
    pub destination: SocketAddr,
    pub sequence_id: u32,
    pub packet: Vec<u8>,
    pub attempts: u32,
    pub sent_at: Instant,
}

impl Outstanding {
    /// 100ms, 200ms, 400ms, 800ms after the 1st..4th attempt.
    pub fn backoff(&self) -> Duration {
        BASE_BACKOFF * 2u32.pow(self.attempts.saturating_sub(1))
    }

    pub fn deadline(&self) -> Instant {
        self.sent_at + self.backoff()
    }
}

/// Bounded FIFO of recently seen `(source ip, sequence id)` pairs.
#[derive(Debug)]
pub struct ReceiveHistory {
    seen: VecDeque<(IpAddr, u32)>,
    capacity: usize,
}

impl Default for ReceiveHistory {
    fn default() -> Self {
        Self::with_capacity(MAX_NUM_SENT_HISTORY)
    }
}

impl ReceiveHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records the pair and reports whether it was already present.
    ///
    /// The oldest entry is evicted before the lookup, so a pair is only
    /// remembered for the last `capacity - 1` other arrivals.
    pub fn register(&mut self, ip: IpAddr, sequence_id: u32) -> bool {
        if self.seen.len() == self.capacity {
            self.seen.pop_front();
        }
        let duplicate = self.seen.contains(&(ip, sequence_id));
        self.seen.push_back((ip, sequence_id));
        duplicate
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Correlation problems noticed on a response. They are reported but the
/// packet is still handed to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    SequenceMismatch { expected: u32, received: u32 },
    UnexpectedSource { expected: SocketAddr, received: SocketAddr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Duplicate,
    Fresh { anomalies: Vec<Anomaly> },
}

#[derive(Debug)]
pub struct ReliabilityState {
    mode: Mode,
    outstanding: Option<Outstanding>,
    history: ReceiveHistory,
}

impl ReliabilityState {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            outstanding: None,
            history: ReceiveHistory::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_awaiting(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn outstanding(&self) -> Option<&Outstanding> {
        self.outstanding.as_ref()
    }

    /// Notes a first transmission. In resend mode it replaces any earlier
    /// outstanding request.
    pub fn record_send(&mut self, destination: SocketAddr, sequence_id: u32, packet: Vec<u8>, now: Instant) {
        if self.mode == Mode::NoResend {
            return;
        }
        self.outstanding = Some(Outstanding {
            destination,
            sequence_id,
            packet,
            attempts: 1,
            sent_at: now,
        });
    }

    /// Classifies an arrival and, for a fresh one, settles the outstanding
    /// request.
    pub fn on_receive(&mut self, source: SocketAddr, sequence_id: u32) -> Inbound {
        if self.history.register(source.ip(), sequence_id) {
            return Inbound::Duplicate;
        }
        let mut anomalies = Vec::new();
        if let Some(request) = self.outstanding.take() {
            if request.sequence_id != sequence_id {
                anomalies.push(Anomaly::SequenceMismatch {
                    expected: request.sequence_id,
                    received: sequence_id,
                });
            }
            if request.destination != source {
                anomalies.push(Anomaly::UnexpectedSource {
                    expected: request.destination,
                    received: source,
                });
            }
        }
        Inbound::Fresh { anomalies }
    }

    /// Returns the packet to send again if its deadline has passed.
    ///
    /// Once a packet has gone out `MAX_SEND_ATTEMPTS` times, a passed
    /// deadline is a fatal `RetriesExhausted`.
    pub fn poll(&mut self, now: Instant) -> Result<Option<(SocketAddr, Vec<u8>)>> {
        let Some(request) = self.outstanding.as_mut() else {
            return Ok(None);
        };
        if now < request.deadline() {
            return Ok(None);
        }
        if request.attempts >= MAX_SEND_ATTEMPTS {
            let attempts = request.attempts;
            self.outstanding = None;
            return Err(Error::RetriesExhausted { attempts });
        }
        request.attempts += 1;
        request.sent_at = now;
        Ok(Some((request.destination, request.packet.clone())))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(Outstanding::deadline)
    }
}
