//! Wire codec for AppleMIDI session commands, RTP and RTP-MIDI payloads
//!
//! Every decoder reads through [`cursor::WireReader`], so a truncated
//! datagram always fails with `NeedMoreData` rather than a partial value.

pub mod command;
pub mod cursor;
pub mod note_packet;
pub mod payload;
pub mod rtp;

pub use command::{Command, CommandTag, SessionPayload, SyncPayload};
pub use cursor::WireReader;
pub use note_packet::{note_port_midi, NotePacket};
pub use payload::{decode_midi_payload, encode_midi_payload, MidiPayload, PayloadFlags};
pub use rtp::{RtpHeader, RtpPacket};

use bytes::Bytes;

use crate::error::CodecError;

/// Decode an AppleMIDI command datagram
pub fn decode_command(datagram: &[u8]) -> Result<Command, CodecError> {
    Command::decode(datagram)
}

/// Encode an AppleMIDI command into one datagram
pub fn encode_command(command: &Command) -> Result<Bytes, CodecError> {
    command.encode()
}

/// Decode an RTP datagram
pub fn decode_rtp(datagram: &[u8]) -> Result<RtpPacket, CodecError> {
    RtpPacket::decode(datagram)
}

/// Encode an RTP packet into one datagram
pub fn encode_rtp(packet: &RtpPacket) -> Result<Bytes, CodecError> {
    packet.encode()
}
