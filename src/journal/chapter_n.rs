//! Chapter N: note on/off state
//!
//! ```text
//! ┌─┬─────────────┬───────┬───────┐
//! │B│   LEN (7)   │LOW (4)│HIGH(4)│
//! ├─┼─────────────┼─┬─────┴───────┤  repeated LEN times
//! │S│  NOTENUM    │Y│  VELOCITY   │
//! ├─┴─────────────┴─┴─────────────┤
//! │ OFFBITS[LOW..=HIGH]           │
//! └───────────────────────────────┘
//! ```

use bytes::{BufMut, BytesMut};

/// Most note logs one chapter holds
pub const MAX_NOTES: usize = 127;

/// Off-bit bytes covering notes 0..=127
pub const OFFBIT_BYTES: usize = 16;

/// One pending note-on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteLog {
    pub note: u8,
    pub velocity: u8,
}

/// Note chapter of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterN {
    b_flag: bool,
    notes: Vec<NoteLog>,
    offbits: [u8; OFFBIT_BYTES],
    low: u8,
    high: u8,
}

impl Default for ChapterN {
    fn default() -> Self {
        Self::new()
    }
}

impl ChapterN {
    /// Empty chapter; low > high means no off-bit bytes are written
    pub fn new() -> Self {
        Self {
            b_flag: false,
            notes: Vec::new(),
            offbits: [0; OFFBIT_BYTES],
            low: 0x0f,
            high: 0x00,
        }
    }

    /// Record a note-on. Returns false when the chapter is full.
    pub fn note_on(&mut self, note: u8, velocity: u8) -> bool {
        self.b_flag = true;
        if self.notes.len() >= MAX_NOTES {
            tracing::debug!(note, "Chapter N note log full");
            return false;
        }
        self.notes.push(NoteLog {
            note: note & 0x7f,
            velocity: velocity & 0x7f,
        });
        true
    }

    /// Record a note-off in the off-bit map
    pub fn note_off(&mut self, note: u8) {
        self.b_flag = true;
        let (offset, bit) = offbit_position(note);
        self.high = self.high.max(offset);
        self.low = self.low.min(offset);
        self.offbits[offset as usize] |= 1 << bit;
    }

    pub fn notes(&self) -> &[NoteLog] {
        &self.notes
    }

    pub fn offbits(&self) -> &[u8; OFFBIT_BYTES] {
        &self.offbits
    }

    /// Off-bit byte range as (low, high)
    pub fn range(&self) -> (u8, u8) {
        (self.low, self.high)
    }

    fn offbit_len(&self) -> usize {
        if self.high >= self.low {
            (self.high - self.low) as usize + 1
        } else {
            0
        }
    }

    pub fn packed_len(&self) -> usize {
        2 + self.notes.len() * 2 + self.offbit_len()
    }

    pub fn pack(&self, buf: &mut BytesMut) {
        buf.put_u8(((self.b_flag as u8) << 7) | (self.notes.len() as u8 & 0x7f));
        buf.put_u8((self.low << 4) | (self.high & 0x0f));
        for log in &self.notes {
            // S and Y stay clear
            buf.put_u8(log.note & 0x7f);
            buf.put_u8(log.velocity & 0x7f);
        }
        if self.offbit_len() > 0 {
            buf.put_slice(&self.offbits[self.low as usize..=self.high as usize]);
        }
    }
}

/// Byte index and bit for a note in the off-bit map.
///
/// The bit is one below the note's position in its byte, wrapping to bit 7
/// for notes on a byte boundary.
pub fn offbit_position(note: u8) -> (u8, u8) {
    let note = note & 0x7f;
    let offset = note / 8;
    let bit = (note % 8 + 7) % 8;
    (offset, bit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chapter_has_no_offbits() {
        let chapter = ChapterN::new();
        let mut buf = BytesMut::new();
        chapter.pack(&mut buf);
        assert_eq!(buf.as_ref(), &[0x00, 0xf0]);
        assert_eq!(chapter.packed_len(), 2);
    }

    #[test]
    fn test_offbit_note_seven() {
        let mut chapter = ChapterN::new();
        chapter.note_off(7);

        assert_eq!(chapter.offbits()[0], 1 << 6);
        assert_eq!(chapter.range(), (0, 0));

        let mut buf = BytesMut::new();
        chapter.pack(&mut buf);
        assert_eq!(buf.as_ref(), &[0x80, 0x00, 0x40]);
    }

    #[test]
    fn test_offbit_range_grows() {
        let mut chapter = ChapterN::new();
        chapter.note_off(60);
        chapter.note_off(20);

        assert_eq!(chapter.range(), (2, 7));
        assert_eq!(chapter.packed_len(), 2 + 6);
        assert_eq!(offbit_position(60), (7, 3));
        assert_eq!(offbit_position(16), (2, 7));
    }

    #[test]
    fn test_notes_are_packed_in_order() {
        let mut chapter = ChapterN::new();
        chapter.note_on(60, 100);
        chapter.note_on(64, 90);

        let mut buf = BytesMut::new();
        chapter.pack(&mut buf);
        assert_eq!(buf.as_ref(), &[0x82, 0xf0, 60, 100, 64, 90]);
    }

    #[test]
    fn test_note_log_capacity() {
        let mut chapter = ChapterN::new();
        for i in 0..MAX_NOTES {
            assert!(chapter.note_on((i % 128) as u8, 1));
        }
        assert!(!chapter.note_on(1, 1));
        assert_eq!(chapter.notes().len(), MAX_NOTES);
    }
}
