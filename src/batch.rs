// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coalescing of posted register writes.
//!
//! When the outgoing queue backs up, small posted writes are gathered into a single
//! REGION_WRITE_MULTI message instead of each taking a slot and a trip through the socket. The
//! proxy decides when a batch is started and flushed; this module only holds the entries and
//! encodes them.

use zerocopy::IntoBytes;

use crate::message::Command;
use crate::message::Header;
use crate::message::HeaderFlags;
use crate::message::Message;
use crate::message::WriteMultiBody;
use crate::message::WriteMultiEntry;
use crate::message::MULTI_WRITE_DATA_SIZE;
use crate::Result;

/// Whether a posted write of `count` bytes may be coalesced.
pub fn eligible(count: usize, posted_writes_disabled: bool, write_multiple: bool) -> bool {
    !posted_writes_disabled && write_multiple && count <= MULTI_WRITE_DATA_SIZE
}

/// Posted writes waiting to be sent together, in program order.
#[derive(Debug, Default)]
pub struct WriteBatch {
    entries: Vec<WriteMultiEntry>,
}

impl WriteBatch {
    pub fn new() -> WriteBatch {
        WriteBatch::default()
    }

    /// Appends a write. `data` must fit in one entry; see [`eligible`].
    pub fn push(&mut self, region: u32, offset: u64, data: &[u8]) {
        let count = data.len().min(MULTI_WRITE_DATA_SIZE);
        let mut entry = WriteMultiEntry {
            offset,
            region,
            count: count as u32,
            data: [0; MULTI_WRITE_DATA_SIZE],
        };
        entry.data[..count].copy_from_slice(&data[..count]);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WriteMultiEntry] {
        &self.entries
    }

    /// Encodes the batch as a REGION_WRITE_MULTI request that expects no reply.
    pub fn into_message(self, id: u16) -> Result<Message> {
        let body = WriteMultiBody {
            wr_cnt: self.entries.len() as u64,
        };
        Message::new(
            Header::request(id, Command::RegionWriteMulti, HeaderFlags::NO_REPLY),
            &[body.as_bytes(), self.entries.as_slice().as_bytes()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::body_prefix;
    use crate::message::HEADER_SIZE;

    #[test]
    fn eligibility() {
        assert!(eligible(4, false, true));
        assert!(eligible(8, false, true));
        assert!(!eligible(9, false, true));
        assert!(!eligible(4, true, true));
        assert!(!eligible(4, false, false));
    }

    #[test]
    fn encode_keeps_order() {
        let mut batch = WriteBatch::new();
        batch.push(0, 0x10, &[1, 2, 3, 4]);
        batch.push(2, 0x20, &[5]);
        batch.push(0, 0x10, &[6, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(batch.len(), 3);

        let msg = batch.into_message(42).unwrap();
        let hdr = msg.header();
        assert_eq!(hdr.id, 42);
        assert_eq!(hdr.get_command(), Some(Command::RegionWriteMulti));
        assert!(hdr.no_reply());
        assert_eq!(msg.len(), HEADER_SIZE + 8 + 3 * 24);

        let (body, mut rest) = body_prefix::<WriteMultiBody>(msg.payload()).unwrap();
        assert_eq!(body.wr_cnt, 3);
        let mut entries = Vec::new();
        while !rest.is_empty() {
            let (entry, tail) = body_prefix::<WriteMultiEntry>(rest).unwrap();
            entries.push(entry);
            rest = tail;
        }
        assert_eq!(entries[0].offset, 0x10);
        assert_eq!(entries[0].count, 4);
        assert_eq!(&entries[0].data[..4], &[1, 2, 3, 4]);
        assert_eq!(entries[1].region, 2);
        assert_eq!(entries[1].count, 1);
        assert_eq!(entries[2].data, [6, 7, 8, 9, 10, 11, 12, 13]);
    }
}
