//! Session records
//!
//! A session is one remote peer. Its mutable fields live behind a
//! per-session lock so work on one peer never waits on another.

pub mod registry;

pub use registry::{Registration, Registry, SessionHandle};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::journal::RecoveryJournal;
use crate::midi::MidiMessage;

/// Sync clock and RTP timestamp resolution: 100 microseconds
pub const TICKS_PER_SECOND: u64 = 10_000;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Slot is free for reuse
    Unused,
    /// Registered, no handshake pending
    Idle,
    /// Invitation sent on the control port
    AwaitingFirstInv,
    /// Invitation sent on the data port
    AwaitingSecondInv,
    /// Both ports accepted
    Established,
}

impl SessionStatus {
    /// Sessions that receive distributed MIDI
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Idle | SessionStatus::Established)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Unused => "unused",
            SessionStatus::Idle => "idle",
            SessionStatus::AwaitingFirstInv => "awaiting-first-inv",
            SessionStatus::AwaitingSecondInv => "awaiting-second-inv",
            SessionStatus::Established => "established",
        };
        f.write_str(s)
    }
}

/// Which side opened the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Peer invited us
    Responder,
    /// We invited the peer
    Initiator,
}

/// Mutable per-session fields
#[derive(Debug)]
pub struct SessionState {
    pub status: SessionStatus,
    pub role: SessionRole,
    /// Bumped on every register/reset; handles from older lifetimes go stale
    pub generation: u64,
    /// Peer ssrc, unknown until an initiator session is first accepted
    pub ssrc: Option<u32>,
    /// Our ssrc towards this peer
    pub send_ssrc: u32,
    pub initiator: u32,
    pub addr: IpAddr,
    pub control_port: u16,
    pub data_port: u16,
    pub name: String,
    /// Last outbound RTP sequence
    pub seq: u16,
    pub start: Instant,
    pub journal: RecoveryJournal,
    /// Last computed peer clock offset in ticks
    pub offset_estimate: Option<i64>,
}

impl SessionState {
    pub(crate) fn unused() -> Self {
        Self {
            status: SessionStatus::Unused,
            role: SessionRole::Responder,
            generation: 0,
            ssrc: None,
            send_ssrc: 0,
            initiator: 0,
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: 0,
            data_port: 0,
            name: String::new(),
            seq: 1,
            start: Instant::now(),
            journal: RecoveryJournal::new(),
            offset_estimate: None,
        }
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.control_port)
    }

    /// Peer data address, control port + 1 when not announced
    pub fn data_addr(&self) -> SocketAddr {
        let port = if self.data_port != 0 {
            self.data_port
        } else {
            self.control_port.wrapping_add(1)
        };
        SocketAddr::new(self.addr, port)
    }

    /// Ticks since the session started
    pub fn elapsed_ticks(&self) -> u64 {
        let elapsed = self.start.elapsed();
        elapsed.as_secs() * TICKS_PER_SECOND + (elapsed.subsec_micros() / 100) as u64
    }

    /// RTP timestamp for a packet sent now
    pub fn rtp_timestamp(&self) -> u32 {
        self.elapsed_ticks() as u32
    }

    /// Advance to the next outbound sequence and return it
    pub fn advance_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Record an event against the current sequence
    pub fn record(&mut self, message: &MidiMessage) -> bool {
        let seq = self.seq;
        self.journal.record(seq, message)
    }

    pub fn add_note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        let seq = self.seq;
        self.journal.add_note_on(seq, channel, note, velocity);
    }

    pub fn add_note_off(&mut self, channel: u8, note: u8) {
        let seq = self.seq;
        self.journal.add_note_off(seq, channel, note);
    }

    pub fn add_program(&mut self, channel: u8, program: u8) {
        let seq = self.seq;
        self.journal.add_program(seq, channel, program);
    }

    pub fn add_control(&mut self, channel: u8, controller: u8, value: u8) {
        let seq = self.seq;
        self.journal.add_control(seq, channel, controller, value);
    }

    /// Apply a receiver acknowledgment. Clears the journal when the peer has
    /// seen our current sequence; returns whether it did.
    pub fn acknowledge(&mut self, ack_seq: u16) -> bool {
        if ack_seq >= self.seq {
            self.journal.reset();
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Self::unused();
        self.generation = generation;
    }
}

/// One registry slot
#[derive(Debug)]
pub struct Session {
    index: usize,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            state: Mutex::new(SessionState::unused()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Lock the session fields
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }
}
