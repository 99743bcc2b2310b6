//! RTP packet header
//!
//! ```text
//!  0                   1                   2                   3
//! ┌───┬─┬─┬───────┬─┬─────────────┬───────────────────────────────┐
//! │V=2│P│X│  CC   │M│     PT      │       sequence number         │
//! ├───┴─┴─┴───────┴─┴─────────────┴───────────────────────────────┤
//! │                           timestamp                           │
//! ├───────────────────────────────────────────────────────────────┤
//! │                             SSRC                              │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::cursor::WireReader;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::CodecError;

pub const RTP_VERSION: u8 = 2;

/// Dynamic payload type used for RTP-MIDI
pub const MIDI_PAYLOAD_TYPE: u8 = 97;

/// Fixed header size without CSRCs
pub const RTP_HEADER_SIZE: usize = 12;

/// The CC field is four bits wide
pub const MAX_CSRCS: usize = 15;

/// RTP fixed header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
}

impl RtpHeader {
    /// Header for an outbound MIDI packet
    pub fn midi(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            marker: false,
            payload_type: MIDI_PAYLOAD_TYPE,
            sequence,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
        }
    }

    /// Encoded size including CSRCs
    pub fn size(&self) -> usize {
        RTP_HEADER_SIZE + self.csrcs.len() * 4
    }

    fn first_word(&self) -> u16 {
        ((self.version as u16 & 0x03) << 14)
            | ((self.padding as u16) << 13)
            | ((self.extension as u16) << 12)
            | ((self.csrcs.len() as u16 & 0x0f) << 8)
            | ((self.marker as u16) << 7)
            | (self.payload_type as u16 & 0x7f)
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.first_word());
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }
    }

    pub fn read_from(reader: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let word = reader.read_u16()?;
        let sequence = reader.read_u16()?;
        let timestamp = reader.read_u32()?;
        let ssrc = reader.read_u32()?;

        let csrc_count = ((word >> 8) & 0x0f) as usize;
        let mut csrcs = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrcs.push(reader.read_u32()?);
        }

        Ok(Self {
            version: (word >> 14) as u8,
            padding: word & 0x2000 != 0,
            extension: word & 0x1000 != 0,
            marker: word & 0x0080 != 0,
            payload_type: (word & 0x7f) as u8,
            sequence,
            timestamp,
            ssrc,
            csrcs,
        })
    }
}

/// RTP header plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.header.csrcs.len() > MAX_CSRCS {
            return Err(CodecError::Malformed(format!(
                "{} CSRCs exceed the limit of {}",
                self.header.csrcs.len(),
                MAX_CSRCS
            )));
        }

        let total = self.header.size() + self.payload.len();
        if total > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        self.header.write_to(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        let mut reader = WireReader::new(datagram);
        let header = RtpHeader::read_from(&mut reader)?;
        if header.version != RTP_VERSION {
            return Err(CodecError::Malformed(format!(
                "unsupported RTP version {}",
                header.version
            )));
        }
        let payload = Bytes::copy_from_slice(reader.rest());
        Ok(Self { header, payload })
    }
}
