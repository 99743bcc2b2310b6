//! AppleMIDI session command frames
//!
//! Packet format (network byte order):
//! ```text
//! ┌────────────┬─────────┬──────────────────────────────────────┐
//! │ 0xFFFF (2) │ Tag (2) │ Body (variant specific)              │
//! └────────────┴─────────┴──────────────────────────────────────┘
//!
//! IN / OK / NO / BY : version(4) initiator(4) ssrc(4) name\0
//! CK                : ssrc(4) count(1) padding(3) ts1(8) ts2(8) ts3(8)
//! RS                : ssrc(4) sequence(4)
//! RL                : ssrc(4) limit(4)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::cursor::WireReader;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::CodecError;

/// Leading signature of every command frame
pub const SIGNATURE: u16 = 0xffff;

/// Protocol version carried in session commands
pub const PROTOCOL_VERSION: u32 = 2;

/// Signature plus tag
pub const HEADER_SIZE: usize = 4;

/// Fixed part of an IN/OK/NO/BY body
pub const SESSION_BODY_SIZE: usize = 12;

/// Full CK frame
pub const SYNC_SIZE: usize = HEADER_SIZE + 4 + 1 + 3 + 3 * 8;

/// Longest name that still fits in one datagram with its terminator
pub const MAX_NAME_LEN: usize = MAX_PACKET_SIZE - HEADER_SIZE - SESSION_BODY_SIZE - 1;

/// Two-letter command tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandTag {
    Invitation = 0x494e,
    Accept = 0x4f4b,
    Reject = 0x4e4f,
    End = 0x4259,
    Sync = 0x434b,
    Feedback = 0x5253,
    BitrateLimit = 0x524c,
}

impl CommandTag {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x494e => Some(Self::Invitation),
            0x4f4b => Some(Self::Accept),
            0x4e4f => Some(Self::Reject),
            0x4259 => Some(Self::End),
            0x434b => Some(Self::Sync),
            0x5253 => Some(Self::Feedback),
            0x524c => Some(Self::BitrateLimit),
            _ => None,
        }
    }

    /// Two-letter mnemonic used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invitation => "IN",
            Self::Accept => "OK",
            Self::Reject => "NO",
            Self::End => "BY",
            Self::Sync => "CK",
            Self::Feedback => "RS",
            Self::BitrateLimit => "RL",
        }
    }
}

/// Body shared by Invitation, Accept, Reject and End
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPayload {
    pub version: u32,
    /// Token correlating an invitation with its answer
    pub initiator: u32,
    pub ssrc: u32,
    pub name: String,
}

impl SessionPayload {
    pub fn new(initiator: u32, ssrc: u32, name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            initiator,
            ssrc,
            name: name.into(),
        }
    }
}

/// Clock synchronization body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPayload {
    pub ssrc: u32,
    /// Step of the three-way exchange, 0..=2
    pub count: u8,
    /// Reserved bytes, echoed back unchanged
    pub padding: [u8; 3],
    pub timestamps: [u64; 3],
}

impl SyncPayload {
    /// Opening step of an exchange
    pub fn start(ssrc: u32, now: u64) -> Self {
        Self {
            ssrc,
            count: 0,
            padding: [0; 3],
            timestamps: [now, 0, 0],
        }
    }

    /// Count that answers this one
    pub fn next_count(&self) -> u8 {
        if self.count < 2 {
            self.count + 1
        } else {
            0
        }
    }

    /// Reply carrying our ssrc and `now` stamped into the slot of the next count.
    /// The other slots and the padding are carried over.
    pub fn answer(&self, ssrc: u32, now: u64) -> Self {
        let count = self.next_count();
        let mut timestamps = self.timestamps;
        timestamps[count as usize] = now;
        Self {
            ssrc,
            count,
            padding: self.padding,
            timestamps,
        }
    }

    /// Peer clock offset once all three stamps are known
    pub fn offset_estimate(&self) -> i64 {
        let [t1, t2, t3] = self.timestamps;
        let midpoint = ((t3 as i128 + t1 as i128) / 2) as i64;
        midpoint.wrapping_sub(t2 as i64)
    }
}

/// A decoded command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Invitation(SessionPayload),
    Accept(SessionPayload),
    Reject(SessionPayload),
    End(SessionPayload),
    Sync(SyncPayload),
    Feedback { ssrc: u32, last_ack_seq: u32 },
    BitrateLimit { ssrc: u32, limit: u32 },
}

impl Command {
    /// Create a receiver feedback acknowledging `seq`
    pub fn feedback(ssrc: u32, seq: u16) -> Self {
        Command::Feedback {
            ssrc,
            last_ack_seq: seq as u32,
        }
    }

    pub fn tag(&self) -> CommandTag {
        match self {
            Command::Invitation(_) => CommandTag::Invitation,
            Command::Accept(_) => CommandTag::Accept,
            Command::Reject(_) => CommandTag::Reject,
            Command::End(_) => CommandTag::End,
            Command::Sync(_) => CommandTag::Sync,
            Command::Feedback { .. } => CommandTag::Feedback,
            Command::BitrateLimit { .. } => CommandTag::BitrateLimit,
        }
    }

    /// Sender ssrc of any variant
    pub fn ssrc(&self) -> u32 {
        match self {
            Command::Invitation(p) | Command::Accept(p) | Command::Reject(p) | Command::End(p) => {
                p.ssrc
            }
            Command::Sync(s) => s.ssrc,
            Command::Feedback { ssrc, .. } | Command::BitrateLimit { ssrc, .. } => *ssrc,
        }
    }

    /// Quick check for the command signature
    pub fn is_command(datagram: &[u8]) -> bool {
        datagram.len() >= 2 && datagram[0] == 0xff && datagram[1] == 0xff
    }

    /// Serialize into a single datagram
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(SIGNATURE);
        buf.put_u16(self.tag() as u16);

        match self {
            Command::Invitation(p) | Command::Accept(p) | Command::Reject(p) | Command::End(p) => {
                buf.put_u32(p.version);
                buf.put_u32(p.initiator);
                buf.put_u32(p.ssrc);
                buf.put_slice(wire_name(&p.name));
                buf.put_u8(0);
            }
            Command::Sync(s) => {
                if s.count > 2 {
                    return Err(CodecError::InvalidSyncCount(s.count));
                }
                buf.put_u32(s.ssrc);
                buf.put_u8(s.count);
                buf.put_slice(&s.padding);
                for ts in s.timestamps {
                    buf.put_u64(ts);
                }
            }
            Command::Feedback { ssrc, last_ack_seq } => {
                buf.put_u32(*ssrc);
                buf.put_u32(*last_ack_seq);
            }
            Command::BitrateLimit { ssrc, limit } => {
                buf.put_u32(*ssrc);
                buf.put_u32(*limit);
            }
        }

        if buf.len() > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(buf.len()));
        }
        Ok(buf.freeze())
    }

    fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + match self {
                Command::Invitation(p)
                | Command::Accept(p)
                | Command::Reject(p)
                | Command::End(p) => SESSION_BODY_SIZE + wire_name(&p.name).len() + 1,
                Command::Sync(_) => SYNC_SIZE - HEADER_SIZE,
                Command::Feedback { .. } | Command::BitrateLimit { .. } => 8,
            }
    }

    /// Parse one datagram
    pub fn decode(datagram: &[u8]) -> Result<Command, CodecError> {
        let mut reader = WireReader::new(datagram);

        let signature = reader.read_u16()?;
        if signature != SIGNATURE {
            return Err(CodecError::BadSignature(signature));
        }
        let raw_tag = reader.read_u16()?;
        let tag = CommandTag::from_u16(raw_tag).ok_or(CodecError::UnknownCommand(raw_tag))?;

        let command = match tag {
            CommandTag::Invitation => Command::Invitation(decode_session(&mut reader)?),
            CommandTag::Accept => Command::Accept(decode_session(&mut reader)?),
            CommandTag::Reject => Command::Reject(decode_session(&mut reader)?),
            CommandTag::End => Command::End(decode_session(&mut reader)?),
            CommandTag::Sync => {
                let ssrc = reader.read_u32()?;
                let count = reader.read_u8()?;
                let padding = reader.read_array::<3>()?;
                let timestamps = [reader.read_u64()?, reader.read_u64()?, reader.read_u64()?];
                if count > 2 {
                    return Err(CodecError::InvalidSyncCount(count));
                }
                Command::Sync(SyncPayload {
                    ssrc,
                    count,
                    padding,
                    timestamps,
                })
            }
            CommandTag::Feedback => Command::Feedback {
                ssrc: reader.read_u32()?,
                last_ack_seq: reader.read_u32()?,
            },
            CommandTag::BitrateLimit => Command::BitrateLimit {
                ssrc: reader.read_u32()?,
                limit: reader.read_u32()?,
            },
        };

        Ok(command)
    }
}

fn decode_session(reader: &mut WireReader<'_>) -> Result<SessionPayload, CodecError> {
    let version = reader.read_u32()?;
    let initiator = reader.read_u32()?;
    let ssrc = reader.read_u32()?;

    // Name runs to the end of the datagram; the terminator is optional
    let raw = reader.rest();
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let name = String::from_utf8_lossy(&raw[..end]).into_owned();

    Ok(SessionPayload {
        version,
        initiator,
        ssrc,
        name,
    })
}

/// Name bytes as they go on the wire, cut at any embedded NUL
fn wire_name(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}
