//! Local note port datagrams
//!
//! Local tools push MIDI to the service through a plain UDP port. A
//! datagram either starts with the [`NOTE_TAG`] byte followed by MIDI
//! bytes (`0xaa 0x96 0x3c 0x7f` is a note-on on channel 7), or is a bare
//! MIDI byte stream.

use super::cursor::WireReader;
use crate::error::CodecError;

/// Leading byte of a tagged note packet
pub const NOTE_TAG: u8 = 0xaa;

/// Size of the classic tagged note-on/off packet
pub const NOTE_PACKET_SIZE: usize = 4;

/// Fixed-size tagged note packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotePacket {
    pub status: u8,
    pub note: u8,
    pub velocity: u8,
}

impl NotePacket {
    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        let mut reader = WireReader::new(datagram);
        let tag = reader.read_u8()?;
        if tag != NOTE_TAG {
            return Err(CodecError::Malformed(format!("note packet tag {:#04x}", tag)));
        }
        let packet = Self {
            status: reader.read_u8()?,
            note: reader.read_u8()?,
            velocity: reader.read_u8()?,
        };
        if reader.remaining() != 0 {
            return Err(CodecError::Malformed(format!(
                "note packet of {} bytes",
                datagram.len()
            )));
        }
        Ok(packet)
    }

    pub fn encode(&self) -> [u8; NOTE_PACKET_SIZE] {
        [NOTE_TAG, self.status, self.note, self.velocity]
    }

    /// MIDI bytes carried by the packet
    pub fn midi_bytes(&self) -> [u8; 3] {
        [self.status, self.note, self.velocity]
    }
}

/// MIDI bytes carried by a note port datagram, tagged or not
pub fn note_port_midi(datagram: &[u8]) -> &[u8] {
    match datagram.split_first() {
        Some((&NOTE_TAG, rest)) => rest,
        _ => datagram,
    }
}
