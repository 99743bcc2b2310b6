//! Chapter C: control change state
//!
//! One log per controller number, latest value wins. Logs are written in
//! controller order.
//!
//! ```text
//! ┌─┬─────────────┐
//! │S│  LEN-1 (7)  │
//! ├─┼─────────────┼─┬─────────────┐  repeated LEN times
//! │S│   NUMBER    │A│    VALUE    │
//! └─┴─────────────┴─┴─────────────┘
//! ```

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

/// Control change chapter of one channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterC {
    controllers: BTreeMap<u8, u8>,
}

impl ChapterC {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&mut self, controller: u8, value: u8) {
        self.controllers.insert(controller & 0x7f, value & 0x7f);
    }

    pub fn value(&self, controller: u8) -> Option<u8> {
        self.controllers.get(&controller).copied()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn packed_len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            1 + 2 * self.controllers.len()
        }
    }

    pub fn pack(&self, buf: &mut BytesMut) {
        if self.is_empty() {
            return;
        }
        buf.put_u8(0x80 | ((self.controllers.len() - 1) as u8 & 0x7f));
        for (&number, &value) in &self.controllers {
            buf.put_u8(0x80 | number);
            // A clear: plain 7-bit value
            buf.put_u8(value);
        }
    }
}
