//! RTP-MIDI payload header
//!
//! Short form (length <= 15):
//! ```text
//! ┌─┬─┬─┬─┬───────┐
//! │B│J│Z│P│  LEN  │   B = 0
//! └─┴─┴─┴─┴───────┘
//! ```
//! Long form (length up to 4095):
//! ```text
//! ┌─┬─┬─┬─┬───────┬───────────────┐
//! │B│J│Z│P│LEN hi │    LEN lo     │   B = 1
//! └─┴─┴─┴─┴───────┴───────────────┘
//! ```
//! The MIDI command list follows the header; the recovery journal follows
//! the command list when J is set.

use bytes::{BufMut, Bytes, BytesMut};

use super::cursor::WireReader;
use crate::error::CodecError;

/// Long header form
pub const FLAG_B: u8 = 0x80;
/// Journal attached
pub const FLAG_J: u8 = 0x40;
/// First command carries a delta time
pub const FLAG_Z: u8 = 0x20;
/// Phantom status byte
pub const FLAG_P: u8 = 0x10;

/// Largest length the short header can carry
pub const SHORT_MAX_LEN: usize = 0x0f;

/// Largest length the long header can carry
pub const LONG_MAX_LEN: usize = 0x0fff;

/// Payload header flag nibble
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadFlags {
    pub journal: bool,
    pub zero_delta: bool,
    pub phantom: bool,
}

impl PayloadFlags {
    pub fn with_journal(journal: bool) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.journal {
            bits |= FLAG_J;
        }
        if self.zero_delta {
            bits |= FLAG_Z;
        }
        if self.phantom {
            bits |= FLAG_P;
        }
        bits
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            journal: bits & FLAG_J != 0,
            zero_delta: bits & FLAG_Z != 0,
            phantom: bits & FLAG_P != 0,
        }
    }
}

/// Decoded MIDI payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiPayload<'a> {
    pub flags: PayloadFlags,
    /// Whether the long header form was used
    pub long_header: bool,
    pub commands: &'a [u8],
    /// Bytes after the command list, the journal when `flags.journal` is set
    pub trailer: &'a [u8],
}

/// Header size needed for `len` bytes of MIDI commands
pub fn header_len(len: usize) -> usize {
    if len > SHORT_MAX_LEN {
        2
    } else {
        1
    }
}

/// Write the header and command list, choosing the header form from the length
pub fn write_midi_payload(
    buf: &mut BytesMut,
    flags: PayloadFlags,
    commands: &[u8],
) -> Result<(), CodecError> {
    let len = commands.len();
    if len > LONG_MAX_LEN {
        return Err(CodecError::PayloadTooLong(len));
    }

    if len > SHORT_MAX_LEN {
        buf.put_u8(FLAG_B | flags.bits() | ((len >> 8) as u8 & 0x0f));
        buf.put_u8((len & 0xff) as u8);
    } else {
        buf.put_u8(flags.bits() | len as u8);
    }
    buf.put_slice(commands);
    Ok(())
}

/// Encode a payload header and command list into a new buffer
pub fn encode_midi_payload(flags: PayloadFlags, commands: &[u8]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(header_len(commands.len()) + commands.len());
    write_midi_payload(&mut buf, flags, commands)?;
    Ok(buf.freeze())
}

/// Split an RTP payload into flags, command list and trailer
pub fn decode_midi_payload(payload: &[u8]) -> Result<MidiPayload<'_>, CodecError> {
    let mut reader = WireReader::new(payload);
    let first = reader.read_u8()?;

    let long_header = first & FLAG_B != 0;
    let len = if long_header {
        let low = reader.read_u8()?;
        (((first & 0x0f) as usize) << 8) | low as usize
    } else {
        (first & 0x0f) as usize
    };

    let commands = reader.read_bytes(len)?;
    Ok(MidiPayload {
        flags: PayloadFlags::from_bits(first),
        long_header,
        commands,
        trailer: reader.rest(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_form() {
        let bytes = encode_midi_payload(PayloadFlags::default(), &[0x90, 0x3c, 0x7f]).unwrap();
        assert_eq!(bytes.as_ref(), &[0x03, 0x90, 0x3c, 0x7f]);

        let decoded = decode_midi_payload(&bytes).unwrap();
        assert!(!decoded.long_header);
        assert_eq!(decoded.commands, &[0x90, 0x3c, 0x7f]);
        assert!(decoded.trailer.is_empty());
    }

    #[test]
    fn test_long_form_splits_length() {
        let commands = vec![0xf8u8; 0x123];
        let bytes = encode_midi_payload(PayloadFlags::with_journal(true), &commands).unwrap();
        assert_eq!(bytes[0], FLAG_B | FLAG_J | 0x01);
        assert_eq!(bytes[1], 0x23);
        assert_eq!(bytes.len(), 2 + 0x123);
    }

    #[test]
    fn test_journal_trailer() {
        let mut buf = BytesMut::new();
        write_midi_payload(&mut buf, PayloadFlags::with_journal(true), &[0xc0, 0x05]).unwrap();
        buf.put_slice(&[0x80, 0x00, 0x01]);

        let decoded = decode_midi_payload(&buf).unwrap();
        assert!(decoded.flags.journal);
        assert_eq!(decoded.commands, &[0xc0, 0x05]);
        assert_eq!(decoded.trailer, &[0x80, 0x00, 0x01]);
    }

    #[test]
    fn test_too_long() {
        let commands = vec![0u8; LONG_MAX_LEN + 1];
        assert_eq!(
            encode_midi_payload(PayloadFlags::default(), &commands),
            Err(CodecError::PayloadTooLong(LONG_MAX_LEN + 1))
        );
    }

    #[test]
    fn test_truncated_payload() {
        assert!(decode_midi_payload(&[]).unwrap_err().is_incomplete());
        assert!(decode_midi_payload(&[FLAG_B | 0x01]).unwrap_err().is_incomplete());
        assert!(decode_midi_payload(&[0x03, 0x90]).unwrap_err().is_incomplete());
    }

    proptest! {
        #[test]
        fn test_header_form_selection(len in 0usize..=LONG_MAX_LEN, journal in any::<bool>()) {
            let commands = vec![0x42u8; len];
            let bytes =
                encode_midi_payload(PayloadFlags::with_journal(journal), &commands).unwrap();

            let expected_header = if len <= SHORT_MAX_LEN { 1 } else { 2 };
            prop_assert_eq!(bytes.len(), expected_header + len);
            prop_assert_eq!(bytes[0] & FLAG_B != 0, len > SHORT_MAX_LEN);

            let decoded = decode_midi_payload(&bytes).unwrap();
            prop_assert_eq!(decoded.commands.len(), len);
            prop_assert_eq!(decoded.flags.journal, journal);
        }
    }
}
