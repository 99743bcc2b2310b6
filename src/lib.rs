//! # RTP-MIDI Session
//!
//! Network core of an AppleMIDI (RTP-MIDI) service: session handshake and
//! teardown, clock synchronization, per-session sequencing and the recovery
//! journal that lets peers repair lost MIDI over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    Listener (network::listener)                       │
//! │   control port ─┐        data port ─┐          note port ─┐           │
//! │                 ▼                   ▼                     ▼           │
//! │        ┌────────────────┐   ┌────────────────┐   ┌────────────────┐   │
//! │        │ codec::command │   │  codec::rtp +  │   │ codec::note_   │   │
//! │        │    decode      │   │ codec::payload │   │    packet      │   │
//! │        └───────┬────────┘   └───────┬────────┘   └───────┬────────┘   │
//! │                ▼                    │                    │            │
//! │   ┌──────────────────────────┐      │ MIDI               │ MIDI       │
//! │   │ ProtocolEngine           │      ▼                    ▼            │
//! │   │ IN/OK/NO/BY/CK/RS/RL     │   ┌──────────────────────────────┐     │
//! │   └───────┬──────────────────┘   │  WorkQueue (mutex + condvar) │     │
//! │           │                      └──────────────┬───────────────┘     │
//! └───────────┼─────────────────────────────────────┼─────────────────────┘
//!             ▼                                     ▼
//! ┌──────────────────────────┐        ┌──────────────────────────────┐
//! │ session::Registry        │◄───────┤ MidiSender worker thread     │
//! │  Session (own lock)      │        │  Distributor: journal + RTP  │
//! │   └─ RecoveryJournal     │        │  fan-out to every peer       │
//! └──────────────────────────┘        └──────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod journal;
pub mod midi;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Service-wide constants
pub mod constants {
    /// Default AppleMIDI control port
    pub const DEFAULT_CONTROL_PORT: u16 = 5004;

    /// Default local note port
    pub const DEFAULT_NOTE_PORT: u16 = 5006;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Default number of concurrent sessions
    pub const DEFAULT_MAX_SESSIONS: usize = 8;
}
