//! Recovery journal
//!
//! Records the note, control and program state sent to one peer since the
//! peer last acknowledged a sequence number, so a receiver can repair
//! packet loss. Appended to outbound RTP-MIDI payloads when non-empty.
//!
//! ```text
//! ┌─┬─┬─┬─┬───────────┬───────────────────────────────┐
//! │S│Y│A│H│TOTCHAN-1 4│  checkpoint sequence (16)     │
//! ├─┴─┴─┴─┴───────────┴───────────────────────────────┤
//! │ channel journal × TOTCHAN                         │
//! └───────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod chapter_c;
pub mod chapter_n;
pub mod chapter_p;

pub use channel::ChannelJournal;
pub use chapter_c::ChapterC;
pub use chapter_n::ChapterN;
pub use chapter_p::ChapterP;

use bytes::{BufMut, Bytes, BytesMut};

use crate::midi::MidiMessage;

/// Journal header flags (upper nibble of the first byte)
pub const JOURNAL_FLAG_S: u8 = 0x08;
pub const JOURNAL_FLAG_Y: u8 = 0x04;
pub const JOURNAL_FLAG_A: u8 = 0x02;
pub const JOURNAL_FLAG_H: u8 = 0x01;

pub const JOURNAL_HEADER_SIZE: usize = 3;

pub const MIDI_CHANNELS: usize = 16;

/// Per-session recovery journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryJournal {
    flags: u8,
    seq: u16,
    channels: [Option<ChannelJournal>; MIDI_CHANNELS],
}

impl Default for RecoveryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryJournal {
    pub fn new() -> Self {
        Self {
            flags: JOURNAL_FLAG_S,
            seq: 0,
            channels: Default::default(),
        }
    }

    /// Number of channels with recorded state
    pub fn total_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.total_channels() == 0
    }

    /// Sequence number of the last recorded event
    pub fn seq(&self) -> u16 {
        self.seq
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn channel(&self, channel: u8) -> Option<&ChannelJournal> {
        self.channels.get(channel as usize).and_then(Option::as_ref)
    }

    /// Channel journal to update, stamping the header. None for a bad channel.
    fn touch(&mut self, seq: u16, channel: u8) -> Option<&mut ChannelJournal> {
        if channel as usize >= MIDI_CHANNELS {
            tracing::warn!(channel, "Ignoring journal event for invalid channel");
            return None;
        }
        self.flags |= JOURNAL_FLAG_A | JOURNAL_FLAG_S;
        self.seq = seq;
        Some(self.channels[channel as usize].get_or_insert_with(|| ChannelJournal::new(channel)))
    }

    /// Record a note-on. Velocity zero counts as note-off.
    pub fn add_note_on(&mut self, seq: u16, channel: u8, note: u8, velocity: u8) {
        if velocity == 0 {
            return self.add_note_off(seq, channel, note);
        }
        if note > 0x7f {
            tracing::warn!(note, "Ignoring journal event for invalid note");
            return;
        }
        if let Some(journal) = self.touch(seq, channel) {
            journal.chapter_n_mut().note_on(note, velocity);
        }
    }

    pub fn add_note_off(&mut self, seq: u16, channel: u8, note: u8) {
        if note > 0x7f {
            tracing::warn!(note, "Ignoring journal event for invalid note");
            return;
        }
        if let Some(journal) = self.touch(seq, channel) {
            journal.chapter_n_mut().note_off(note);
        }
    }

    pub fn add_control(&mut self, seq: u16, channel: u8, controller: u8, value: u8) {
        if controller > 0x7f {
            tracing::warn!(controller, "Ignoring journal event for invalid controller");
            return;
        }
        if let Some(journal) = self.touch(seq, channel) {
            journal.chapter_c_mut().control(controller, value);
        }
    }

    pub fn add_program(&mut self, seq: u16, channel: u8, program: u8) {
        if let Some(journal) = self.touch(seq, channel) {
            journal.set_program(program);
        }
    }

    /// Fold a MIDI message into the journal. Returns false for messages no
    /// chapter covers.
    pub fn record(&mut self, seq: u16, message: &MidiMessage) -> bool {
        match *message {
            MidiMessage::NoteOn { channel, note, velocity } => {
                self.add_note_on(seq, channel, note, velocity)
            }
            MidiMessage::NoteOff { channel, note, .. } => self.add_note_off(seq, channel, note),
            MidiMessage::ControlChange { channel, controller, value } => {
                self.add_control(seq, channel, controller, value)
            }
            MidiMessage::ProgramChange { channel, program } => {
                self.add_program(seq, channel, program)
            }
            _ => return false,
        }
        true
    }

    /// Packed size, zero when empty
    pub fn packed_len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        JOURNAL_HEADER_SIZE
            + self
                .channels
                .iter()
                .flatten()
                .map(ChannelJournal::packed_len)
                .sum::<usize>()
    }

    /// Append the packed journal to `buf`. Writes nothing when empty.
    pub fn pack_into(&self, buf: &mut BytesMut) {
        let totchan = self.total_channels();
        if totchan == 0 {
            return;
        }

        buf.put_u8(((self.flags & 0x0f) << 4) | ((totchan - 1) as u8 & 0x0f));
        buf.put_u16(self.seq);
        for channel in self.channels.iter().flatten() {
            channel.pack(buf);
        }
    }

    /// Packed journal; empty bytes mean no journal is attached
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.packed_len());
        self.pack_into(&mut buf);
        buf.freeze()
    }

    /// Drop all recorded state
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
