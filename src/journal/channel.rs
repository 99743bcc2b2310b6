//! Per-channel journal
//!
//! ```text
//! ┌─┬───────┬─┬───────────────────┬───────────────┐
//! │S│CHAN(4)│H│     LENGTH (10)   │P C M W N E T A│
//! └─┴───────┴─┴───────────────────┴───────────────┘
//! ```
//! LENGTH counts the whole channel journal including this header.
//! Chapters follow in P, C, N order.

use bytes::{BufMut, BytesMut};

use super::chapter_c::ChapterC;
use super::chapter_n::ChapterN;
use super::chapter_p::{ChapterP, CHAPTER_P_SIZE};

pub const CHANNEL_HEADER_SIZE: usize = 3;

/// Chapter presence bits
pub const CHAPTER_P: u8 = 0x80;
pub const CHAPTER_C: u8 = 0x40;
pub const CHAPTER_M: u8 = 0x20;
pub const CHAPTER_W: u8 = 0x10;
pub const CHAPTER_N: u8 = 0x08;
pub const CHAPTER_E: u8 = 0x04;
pub const CHAPTER_T: u8 = 0x02;
pub const CHAPTER_A: u8 = 0x01;

/// Largest value of the 10-bit length field
const MAX_CHANNEL_LEN: usize = 0x3ff;

/// Journal state for one MIDI channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelJournal {
    /// Zero-based MIDI channel
    channel: u8,
    chapter_p: Option<ChapterP>,
    chapter_c: Option<ChapterC>,
    chapter_n: Option<ChapterN>,
}

impl ChannelJournal {
    pub fn new(channel: u8) -> Self {
        Self {
            channel: channel & 0x0f,
            chapter_p: None,
            chapter_c: None,
            chapter_n: None,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn chapter_n(&self) -> Option<&ChapterN> {
        self.chapter_n.as_ref()
    }

    pub fn chapter_c(&self) -> Option<&ChapterC> {
        self.chapter_c.as_ref()
    }

    pub fn chapter_p(&self) -> Option<&ChapterP> {
        self.chapter_p.as_ref()
    }

    pub fn chapter_n_mut(&mut self) -> &mut ChapterN {
        self.chapter_n.get_or_insert_with(ChapterN::new)
    }

    pub fn chapter_c_mut(&mut self) -> &mut ChapterC {
        self.chapter_c.get_or_insert_with(ChapterC::new)
    }

    pub fn set_program(&mut self, program: u8) {
        self.chapter_p = Some(ChapterP::new(program));
    }

    /// Chapter presence bitfield
    pub fn bitfield(&self) -> u8 {
        let mut bits = 0;
        if self.chapter_p.is_some() {
            bits |= CHAPTER_P;
        }
        if self.chapter_c.as_ref().map_or(false, |c| !c.is_empty()) {
            bits |= CHAPTER_C;
        }
        if self.chapter_n.is_some() {
            bits |= CHAPTER_N;
        }
        bits
    }

    /// Packed size including the channel header
    pub fn packed_len(&self) -> usize {
        CHANNEL_HEADER_SIZE
            + self.chapter_p.map_or(0, |_| CHAPTER_P_SIZE)
            + self.chapter_c.as_ref().map_or(0, ChapterC::packed_len)
            + self.chapter_n.as_ref().map_or(0, ChapterN::packed_len)
    }

    pub fn pack(&self, buf: &mut BytesMut) {
        let len = self.packed_len();
        if len > MAX_CHANNEL_LEN {
            tracing::warn!(channel = self.channel, len, "Channel journal length overflows header");
        }

        let header: u16 = (1 << 15)
            | ((self.channel as u16 & 0x0f) << 11)
            | (len as u16 & MAX_CHANNEL_LEN as u16);
        buf.put_u16(header);
        buf.put_u8(self.bitfield());

        if let Some(p) = &self.chapter_p {
            p.pack(buf);
        }
        if let Some(c) = &self.chapter_c {
            c.pack(buf);
        }
        if let Some(n) = &self.chapter_n {
            n.pack(buf);
        }
    }
}
