//! MIDI 1.0 message parsing
//!
//! Splits a raw MIDI byte stream (as found in an RTP-MIDI command list or
//! on the local note port) into messages, honoring running status.

/// MIDI message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (0-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Polyphonic Key Pressure
    PolyPressure { channel: u8, note: u8, pressure: u8 },

    /// Control Change: channel (0-15), controller (0-127), value (0-127)
    ControlChange { channel: u8, controller: u8, value: u8 },

    /// Program Change: channel (0-15), program (0-127)
    ProgramChange { channel: u8, program: u8 },

    /// Channel Pressure
    ChannelPressure { channel: u8, pressure: u8 },

    /// Pitch Bend: 14-bit value
    PitchBend { channel: u8, value: u16 },

    /// System common, real-time or exclusive message, kept verbatim
    System(Vec<u8>),
}

impl MidiMessage {
    /// Channel for channel voice messages
    pub fn channel(&self) -> Option<u8> {
        match self {
            MidiMessage::NoteOff { channel, .. }
            | MidiMessage::NoteOn { channel, .. }
            | MidiMessage::PolyPressure { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::ChannelPressure { channel, .. }
            | MidiMessage::PitchBend { channel, .. } => Some(*channel),
            MidiMessage::System(_) => None,
        }
    }

    /// Wire bytes with an explicit status byte
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                vec![0x80 | channel, *note, *velocity]
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                vec![0x90 | channel, *note, *velocity]
            }
            MidiMessage::PolyPressure { channel, note, pressure } => {
                vec![0xa0 | channel, *note, *pressure]
            }
            MidiMessage::ControlChange { channel, controller, value } => {
                vec![0xb0 | channel, *controller, *value]
            }
            MidiMessage::ProgramChange { channel, program } => vec![0xc0 | channel, *program],
            MidiMessage::ChannelPressure { channel, pressure } => vec![0xd0 | channel, *pressure],
            MidiMessage::PitchBend { channel, value } => {
                vec![0xe0 | channel, (value & 0x7f) as u8, ((value >> 7) & 0x7f) as u8]
            }
            MidiMessage::System(bytes) => bytes.clone(),
        }
    }

    fn from_channel(status: u8, data: &[u8]) -> Self {
        let channel = status & 0x0f;
        match status & 0xf0 {
            0x80 => MidiMessage::NoteOff { channel, note: data[0], velocity: data[1] },
            0x90 => MidiMessage::NoteOn { channel, note: data[0], velocity: data[1] },
            0xa0 => MidiMessage::PolyPressure { channel, note: data[0], pressure: data[1] },
            0xb0 => MidiMessage::ControlChange { channel, controller: data[0], value: data[1] },
            0xc0 => MidiMessage::ProgramChange { channel, program: data[0] },
            0xd0 => MidiMessage::ChannelPressure { channel, pressure: data[0] },
            _ => MidiMessage::PitchBend {
                channel,
                value: (data[0] as u16) | ((data[1] as u16) << 7),
            },
        }
    }
}

/// Number of data bytes following a status byte
fn data_len(status: u8) -> usize {
    match status {
        0x80..=0xbf | 0xe0..=0xef => 2,
        0xc0..=0xdf => 1,
        0xf1 | 0xf3 => 1,
        0xf2 => 2,
        _ => 0,
    }
}

/// Split a MIDI byte stream into messages.
///
/// Data bytes without a usable running status and incomplete trailing
/// messages are dropped.
pub fn parse_stream(bytes: &[u8]) -> Vec<MidiMessage> {
    let mut messages = Vec::new();
    let mut running: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let byte = bytes[i];

        // Real-time bytes never disturb running status
        if byte >= 0xf8 {
            messages.push(MidiMessage::System(vec![byte]));
            i += 1;
            continue;
        }

        if byte == 0xf0 {
            running = None;
            let end = bytes[i..].iter().position(|&b| b == 0xf7).map(|p| i + p + 1);
            match end {
                Some(end) => {
                    messages.push(MidiMessage::System(bytes[i..end].to_vec()));
                    i = end;
                }
                None => {
                    tracing::debug!(len = bytes.len() - i, "Dropping unterminated sysex");
                    break;
                }
            }
            continue;
        }

        let (status, start) = if byte & 0x80 != 0 {
            (byte, i + 1)
        } else {
            match running {
                Some(status) => (status, i),
                None => {
                    i += 1;
                    continue;
                }
            }
        };

        let needed = data_len(status);
        let mut buf = [0u8; 2];
        let mut filled = 0;
        let mut j = start;
        let mut interrupted = false;
        while filled < needed && j < bytes.len() {
            let b = bytes[j];
            j += 1;
            if b >= 0xf8 {
                // Real-time bytes may sit between data bytes
                messages.push(MidiMessage::System(vec![b]));
            } else if b & 0x80 != 0 {
                interrupted = true;
                j -= 1;
                break;
            } else {
                buf[filled] = b;
                filled += 1;
            }
        }
        if interrupted {
            i = j;
            continue;
        }
        if filled < needed {
            tracing::debug!(status, "Dropping truncated MIDI message");
            break;
        }
        let data = &buf[..needed];

        if status < 0xf0 {
            running = Some(status);
            messages.push(MidiMessage::from_channel(status, data));
        } else {
            running = None;
            let mut raw = Vec::with_capacity(needed + 1);
            raw.push(status);
            raw.extend_from_slice(data);
            messages.push(MidiMessage::System(raw));
        }
        i = j;
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note_on() {
        let messages = parse_stream(&[0x96, 0x3c, 0x7f]);
        assert_eq!(
            messages,
            vec![MidiMessage::NoteOn { channel: 6, note: 0x3c, velocity: 0x7f }]
        );
    }

    #[test]
    fn test_running_status() {
        let messages = parse_stream(&[0x90, 0x3c, 0x40, 0x3e, 0x40, 0xc1, 0x05, 0x06]);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1], MidiMessage::NoteOn { channel: 0, note: 0x3e, velocity: 0x40 });
        assert_eq!(messages[3], MidiMessage::ProgramChange { channel: 1, program: 6 });
    }

    #[test]
    fn test_realtime_inside_running_status() {
        let messages = parse_stream(&[0xb2, 0x07, 0x64, 0xf8, 0x0a, 0x20]);
        assert_eq!(messages[1], MidiMessage::System(vec![0xf8]));
        assert_eq!(
            messages[2],
            MidiMessage::ControlChange { channel: 2, controller: 0x0a, value: 0x20 }
        );
    }

    #[test]
    fn test_sysex_and_truncation() {
        let messages = parse_stream(&[0xf0, 0x7e, 0x01, 0xf7, 0x90, 0x3c]);
        assert_eq!(messages, vec![MidiMessage::System(vec![0xf0, 0x7e, 0x01, 0xf7])]);

        assert!(parse_stream(&[0x3c, 0x40]).is_empty());
    }

    #[test]
    fn test_interrupted_message() {
        let messages = parse_stream(&[0x90, 0x3c, 0x80, 0x3c, 0x00]);
        assert_eq!(messages, vec![MidiMessage::NoteOff { channel: 0, note: 0x3c, velocity: 0 }]);
    }

    #[test]
    fn test_realtime_inside_message() {
        let messages = parse_stream(&[0x90, 0x3c, 0xf8, 0x40]);
        assert_eq!(
            messages,
            vec![
                MidiMessage::System(vec![0xf8]),
                MidiMessage::NoteOn { channel: 0, note: 0x3c, velocity: 0x40 },
            ]
        );

        // Running status survives too
        let messages = parse_stream(&[0x90, 0x3c, 0x40, 0x3e, 0xfe, 0x41]);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], MidiMessage::System(vec![0xfe]));
        assert_eq!(messages[2], MidiMessage::NoteOn { channel: 0, note: 0x3e, velocity: 0x41 });
    }

    #[test]
    fn test_to_bytes() {
        let bend = MidiMessage::PitchBend { channel: 3, value: 0x2000 };
        assert_eq!(bend.to_bytes(), vec![0xe3, 0x00, 0x40]);
        assert_eq!(parse_stream(&bend.to_bytes()), vec![bend]);
        assert_eq!(MidiMessage::System(vec![0xfa]).channel(), None);
    }
}
