//! Chapter P: program change state

use bytes::{BufMut, BytesMut};

pub const CHAPTER_P_SIZE: usize = 3;

/// Program chapter of one channel. Bank select is not tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChapterP {
    pub program: u8,
    pub bank_msb: u8,
    pub bank_lsb: u8,
}

impl ChapterP {
    pub fn new(program: u8) -> Self {
        Self {
            program: program & 0x7f,
            bank_msb: 0,
            bank_lsb: 0,
        }
    }

    pub fn pack(&self, buf: &mut BytesMut) {
        buf.put_u8(0x80 | (self.program & 0x7f));
        buf.put_u8(self.bank_msb & 0x7f);
        buf.put_u8(self.bank_lsb & 0x7f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack() {
        let mut buf = BytesMut::new();
        ChapterP::new(42).pack(&mut buf);
        assert_eq!(buf.as_ref(), &[0x80 | 42, 0, 0]);
    }
}
