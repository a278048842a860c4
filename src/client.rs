// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed calls into the server.
//!
//! Each call builds its request, picks a send mode and checks the reply against the limits that
//! were negotiated. Values reported by the server are never trusted for allocation sizes beyond
//! fixed ceilings.

use std::mem::size_of;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;

use zerocopy::IntoBytes;

use crate::message::body_prefix;
use crate::message::Command;
use crate::message::DeviceInfo;
use crate::message::DirtyBitmap;
use crate::message::DirtyPages;
use crate::message::DirtyPagesFlags;
use crate::message::DirtyRange;
use crate::message::DmaMapFlags;
use crate::message::DmaProt;
use crate::message::DmaTableEntry;
use crate::message::Header;
use crate::message::HeaderFlags;
use crate::message::IrqInfo;
use crate::message::IrqSet;
use crate::message::IrqSetFlags;
use crate::message::Message;
use crate::message::RegionAccess;
use crate::message::RegionFlags;
use crate::message::RegionInfo;
use crate::message::HEADER_SIZE;
use crate::proxy::Proxy;
use crate::proxy::Reply;
use crate::scm::FdBundle;
use crate::Error;
use crate::Result;

/// Most regions a device may report.
pub const MAX_REGIONS: u32 = 100;
/// Most IRQ indexes a device may report.
pub const MAX_IRQS: u32 = 50;

/// One guest memory range to make visible to the server.
#[derive(Copy, Clone, Debug)]
pub struct DmaMapping<'a> {
    pub iova: u64,
    pub size: u64,
    /// Offset of the range in `fd`.
    pub offset: u64,
    pub prot: DmaProt,
    /// Backing memory the server may map. Without it the server accesses the range through
    /// DMA_READ and DMA_WRITE requests.
    pub fd: Option<BorrowedFd<'a>>,
}

/// Result of a region info query.
#[derive(Debug)]
pub struct RegionInfoReply {
    pub info: RegionInfo,
    /// Capability chain following the fixed part, if the server sent one.
    pub caps: Vec<u8>,
    /// Descriptor through which the region can be mapped.
    pub fd: Option<OwnedFd>,
}

/// Data of an IRQ set call.
#[derive(Copy, Clone, Debug)]
pub enum IrqSetData<'a> {
    /// Applies the action to `count` vectors.
    None { count: u32 },
    /// One flag per vector.
    Bool(&'a [bool]),
    /// One eventfd per vector; `None` detaches the vector's eventfd.
    Eventfds(&'a [Option<BorrowedFd<'a>>]),
}

fn request(command: Command, body: &[&[u8]]) -> Result<Message> {
    Message::new(Header::request(0, command, HeaderFlags::empty()), body)
}

/// Space for a reply carrying `body` bytes after the header.
fn reply_capacity(body: usize) -> usize {
    HEADER_SIZE + body
}

/// Size in bytes of the dirty bitmap covering `size` bytes at `pgsize` granularity.
pub fn bitmap_size(size: u64, pgsize: u64) -> Result<u64> {
    if pgsize == 0 || !pgsize.is_power_of_two() {
        return Err(Error::InvalidParam("page size is not a power of two"));
    }
    let pages = size.div_ceil(pgsize);
    Ok(pages.div_ceil(64) * size_of::<u64>() as u64)
}

/// Checks that vectors `[start, start + count)` are addressable and returns the end.
fn irq_range_end(start: u32, count: usize) -> Result<u32> {
    u32::try_from(count)
        .ok()
        .and_then(|count| start.checked_add(count))
        .ok_or(Error::InvalidParam("IRQ vector range overflows"))
}

/// Splits eventfds into runs of only valid or only invalid entries, each at most `max` long.
/// Yields the start index and length of every run.
fn eventfd_runs(fds: &[Option<BorrowedFd>], max: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = 0;
    while start < fds.len() {
        let valid = fds[start].is_some();
        let mut end = start + 1;
        while end < fds.len() && end - start < max && fds[end].is_some() == valid {
            end += 1;
        }
        runs.push((start, end - start));
        start = end;
    }
    runs
}

impl Proxy {
    fn max_xfer(&self) -> usize {
        self.capabilities().max_xfer_size as usize
    }

    fn call(&self, msg: Message, fds: FdBundle, reply_body: usize) -> Result<Reply> {
        self.send_wait(msg, fds, reply_capacity(reply_body), true)
    }

    pub fn get_device_info(&self) -> Result<DeviceInfo> {
        let info = DeviceInfo {
            argsz: size_of::<DeviceInfo>() as u32,
            ..Default::default()
        };
        let msg = request(Command::DeviceGetInfo, &[info.as_bytes()])?;
        let reply = self.call(msg, FdBundle::new(), size_of::<DeviceInfo>())?;
        let info: DeviceInfo = reply.body()?;
        if info.num_regions > MAX_REGIONS {
            return Err(Error::InvalidReply("too many regions"));
        }
        if info.num_irqs > MAX_IRQS {
            return Err(Error::InvalidReply("too many IRQ indexes"));
        }
        Ok(info)
    }

    /// Queries region `index`. If the capability chain does not fit the first reply, the query
    /// is repeated once with the size the server asked for.
    pub fn get_region_info(&self, index: u32) -> Result<RegionInfoReply> {
        let mut argsz = size_of::<RegionInfo>();
        loop {
            let query = RegionInfo {
                argsz: argsz as u32,
                index,
                ..Default::default()
            };
            let msg = request(Command::DeviceGetRegionInfo, &[query.as_bytes()])?;
            let mut reply = self.call(msg, FdBundle::with_recv_capacity(1), argsz)?;
            let (info, rest) = body_prefix::<RegionInfo>(reply.payload())
                .map_err(|_| Error::InvalidReply("region info too short"))?;
            if info.index != index {
                return Err(Error::InvalidReply("region info for another index"));
            }

            let needed = info.argsz as usize;
            if needed > argsz {
                if argsz != size_of::<RegionInfo>() || needed > self.max_xfer() {
                    return Err(Error::InvalidReply("region info does not fit"));
                }
                argsz = needed;
                continue;
            }

            let caps_len = needed.saturating_sub(size_of::<RegionInfo>()).min(rest.len());
            let caps = rest[..caps_len].to_vec();
            let fd = reply.take_fds().into_iter().next();
            let mmap = RegionFlags::from_bits_truncate(info.flags).contains(RegionFlags::MMAP);
            if fd.is_some() && mmap {
                self.disable_posted_writes();
            }
            return Ok(RegionInfoReply { info, caps, fd });
        }
    }

    pub fn get_irq_info(&self, index: u32) -> Result<IrqInfo> {
        let query = IrqInfo {
            argsz: size_of::<IrqInfo>() as u32,
            index,
            ..Default::default()
        };
        let msg = request(Command::DeviceGetIrqInfo, &[query.as_bytes()])?;
        let reply = self.call(msg, FdBundle::new(), size_of::<IrqInfo>())?;
        let info: IrqInfo = reply.body()?;
        if info.index != index {
            return Err(Error::InvalidReply("IRQ info for another index"));
        }
        Ok(info)
    }

    /// Maps guest memory for the server.
    ///
    /// Mappings are sent in chunks of at most `max_fds` entries. Every chunk but the last waits
    /// for its reply so that a failure stops the remaining chunks. The last chunk waits too
    /// unless `batched`, in which case its outcome is collected by [`Proxy::wait_pending`].
    pub fn dma_map(&self, maps: &[DmaMapping], batched: bool) -> Result<()> {
        let caps = self.capabilities();
        if maps.len() > caps.max_dma_maps as usize {
            return Err(Error::InvalidParam("too many DMA mappings"));
        }
        let chunk_len = caps.max_fds.max(1) as usize;
        let chunks = maps.chunks(chunk_len).count();
        for (i, chunk) in maps.chunks(chunk_len).enumerate() {
            let mut table = Vec::with_capacity(chunk.len());
            let mut fds = Vec::new();
            for map in chunk {
                let mut flags = DmaMapFlags::empty();
                if let Some(fd) = map.fd {
                    flags |= DmaMapFlags::MAPPABLE;
                    fds.push(fd);
                }
                table.push(DmaTableEntry {
                    address: map.iova,
                    size: map.size,
                    offset: map.offset,
                    protection: map.prot.bits(),
                    flags: flags.bits(),
                });
            }
            let mut bundle = FdBundle::new();
            bundle.attach(&fds)?;
            let msg = request(Command::DmaMap, &[table.as_slice().as_bytes()])?;
            let capacity = reply_capacity(msg.payload().len());
            if i + 1 == chunks && batched {
                self.send_nowait(msg, bundle, capacity)?;
            } else {
                self.send_wait(msg, bundle, capacity, true)?;
            }
        }
        Ok(())
    }

    /// Unmaps a range without collecting dirty pages. The outcome is collected by
    /// [`Proxy::wait_pending`].
    pub fn dma_unmap(&self, iova: u64, size: u64) -> Result<()> {
        let entry = DmaTableEntry {
            address: iova,
            size,
            ..Default::default()
        };
        let msg = request(Command::DmaUnmap, &[entry.as_bytes()])?;
        self.send_nowait(msg, FdBundle::new(), reply_capacity(size_of::<DmaTableEntry>()))
    }

    /// Unmaps a range and returns the bitmap of pages dirtied in it at `pgsize` granularity.
    pub fn dma_unmap_dirty(&self, iova: u64, size: u64, pgsize: u64) -> Result<Vec<u8>> {
        let bitmap = DirtyBitmap {
            pgsize,
            size: self.checked_bitmap_size(size, pgsize)?,
        };
        let entry = DmaTableEntry {
            address: iova,
            size,
            ..Default::default()
        };
        let msg = request(Command::DmaUnmapDirty, &[entry.as_bytes(), bitmap.as_bytes()])?;
        let fixed = size_of::<DmaTableEntry>() + size_of::<DirtyBitmap>();
        let reply = self.call(msg, FdBundle::new(), fixed + bitmap.size as usize)?;
        let (_, rest) = body_prefix::<DmaTableEntry>(reply.payload())
            .map_err(|_| Error::InvalidReply("unmap reply too short"))?;
        let (reply_bitmap, data) = body_prefix::<DirtyBitmap>(rest)
            .map_err(|_| Error::InvalidReply("unmap reply too short"))?;
        if reply_bitmap.size != bitmap.size || data.len() != bitmap.size as usize {
            return Err(Error::InvalidReply("dirty bitmap size mismatch"));
        }
        Ok(data.to_vec())
    }

    fn checked_bitmap_size(&self, size: u64, pgsize: u64) -> Result<u64> {
        let caps = self.capabilities();
        if pgsize & caps.pgsizes == 0 {
            return Err(Error::InvalidParam("unsupported dirty page size"));
        }
        let bytes = bitmap_size(size, pgsize)?;
        if bytes > caps.migration.max_bitmap_size {
            return Err(Error::InvalidParam("dirty bitmap too large"));
        }
        // The bitmap comes back in a single reply.
        if bytes > caps.max_xfer_size as u64 {
            return Err(Error::InvalidParam("dirty bitmap larger than the transfer size"));
        }
        Ok(bytes)
    }

    /// Configures interrupts of IRQ `index`, starting at vector `start`.
    ///
    /// Eventfds are sent in runs of at most `max_fds`; a run of `None` entries is sent without
    /// descriptors, which detaches those vectors.
    pub fn set_irqs(
        &self,
        index: u32,
        action: IrqSetFlags,
        start: u32,
        data: IrqSetData,
    ) -> Result<()> {
        let irq_set = |flags: IrqSetFlags, start: u32, count: u32, extra: usize| IrqSet {
            argsz: (size_of::<IrqSet>() + extra) as u32,
            flags: (flags | action).bits(),
            index,
            start,
            count,
        };
        let reply_body = size_of::<IrqSet>();
        let count = match data {
            IrqSetData::None { count } => count as usize,
            IrqSetData::Bool(values) => values.len(),
            IrqSetData::Eventfds(fds) => fds.len(),
        };
        irq_range_end(start, count)?;

        match data {
            IrqSetData::None { count } => {
                let set = irq_set(IrqSetFlags::DATA_NONE, start, count, 0);
                let msg = request(Command::DeviceSetIrqs, &[set.as_bytes()])?;
                self.call(msg, FdBundle::new(), reply_body)?;
            }
            IrqSetData::Bool(values) => {
                if values.len() > self.max_xfer() {
                    return Err(Error::InvalidParam("too many IRQ vectors"));
                }
                let bytes: Vec<u8> = values.iter().map(|&v| v as u8).collect();
                let set = irq_set(IrqSetFlags::DATA_BOOL, start, bytes.len() as u32, bytes.len());
                let msg = request(Command::DeviceSetIrqs, &[set.as_bytes(), &bytes])?;
                self.call(msg, FdBundle::new(), reply_body)?;
            }
            IrqSetData::Eventfds(fds) => {
                let max = self.capabilities().max_fds.max(1) as usize;
                for (offset, len) in eventfd_runs(fds, max) {
                    let run: Vec<BorrowedFd> =
                        fds[offset..offset + len].iter().flatten().copied().collect();
                    let mut bundle = FdBundle::new();
                    bundle.attach(&run)?;
                    let run_start = start
                        .checked_add(offset as u32)
                        .ok_or(Error::InvalidParam("IRQ vector range overflows"))?;
                    let set = irq_set(IrqSetFlags::DATA_EVENTFD, run_start, len as u32, 0);
                    let msg = request(Command::DeviceSetIrqs, &[set.as_bytes()])?;
                    self.call(msg, bundle, reply_body)?;
                }
            }
        }
        Ok(())
    }

    pub fn region_read(&self, region: u32, offset: u64, count: usize) -> Result<Vec<u8>> {
        if count > self.max_xfer() {
            return Err(Error::InvalidParam("read larger than the transfer size"));
        }
        let access = RegionAccess {
            offset,
            region,
            count: count as u32,
        };
        let msg = request(Command::RegionRead, &[access.as_bytes()])?;
        let reply = self.call(msg, FdBundle::new(), size_of::<RegionAccess>() + count)?;
        let (access, data) = body_prefix::<RegionAccess>(reply.payload())
            .map_err(|_| Error::InvalidReply("region read reply too short"))?;
        let returned = access.count as usize;
        if returned > count || data.len() < returned {
            return Err(Error::InvalidReply("region read returned the wrong amount"));
        }
        Ok(data[..returned].to_vec())
    }

    /// Writes `data` to a region. A posted write returns once queued and may be coalesced with
    /// other posted writes; otherwise the call waits for the server.
    pub fn region_write(&self, region: u32, offset: u64, data: &[u8], post: bool) -> Result<()> {
        if data.len() > self.max_xfer() {
            return Err(Error::InvalidParam("write larger than the transfer size"));
        }
        let access = RegionAccess {
            offset,
            region,
            count: data.len() as u32,
        };
        if post && !self.posted_writes_disabled() {
            let msg = Message::new(
                Header::request(0, Command::RegionWrite, HeaderFlags::NO_REPLY),
                &[access.as_bytes(), data],
            )?;
            return self.post_region_write(msg, region, offset, data);
        }
        let msg = request(Command::RegionWrite, &[access.as_bytes(), data])?;
        let reply = self.call(msg, FdBundle::new(), size_of::<RegionAccess>())?;
        let access: RegionAccess = reply.body()?;
        if access.count as usize > data.len() {
            return Err(Error::InvalidReply("region write reported too many bytes"));
        }
        Ok(())
    }

    pub fn device_reset(&self) -> Result<()> {
        let msg = request(Command::DeviceReset, &[])?;
        self.call(msg, FdBundle::new(), 0)?;
        Ok(())
    }

    fn dirty_pages(&self, flags: DirtyPagesFlags) -> Result<()> {
        let body = DirtyPages {
            argsz: size_of::<DirtyPages>() as u32,
            flags: flags.bits(),
        };
        let msg = request(Command::DirtyPages, &[body.as_bytes()])?;
        self.call(msg, FdBundle::new(), size_of::<DirtyPages>())?;
        Ok(())
    }

    pub fn dirty_pages_start(&self) -> Result<()> {
        self.dirty_pages(DirtyPagesFlags::START)
    }

    pub fn dirty_pages_stop(&self) -> Result<()> {
        self.dirty_pages(DirtyPagesFlags::STOP)
    }

    /// Returns the bitmap of pages in `[iova, iova + size)` dirtied since the last query.
    pub fn dirty_pages_get_bitmap(&self, iova: u64, size: u64, pgsize: u64) -> Result<Vec<u8>> {
        let bitmap_bytes = self.checked_bitmap_size(size, pgsize)?;
        let fixed = size_of::<DirtyPages>() + size_of::<DirtyRange>();
        let body = DirtyPages {
            argsz: (fixed + bitmap_bytes as usize) as u32,
            flags: DirtyPagesFlags::GET_BITMAP.bits(),
        };
        let range = DirtyRange {
            iova,
            size,
            bitmap: DirtyBitmap {
                pgsize,
                size: bitmap_bytes,
            },
        };
        let msg = request(Command::DirtyPages, &[body.as_bytes(), range.as_bytes()])?;
        let reply = self.call(msg, FdBundle::new(), fixed + bitmap_bytes as usize)?;
        let (_, rest) = body_prefix::<DirtyPages>(reply.payload())
            .map_err(|_| Error::InvalidReply("dirty pages reply too short"))?;
        let (reply_range, data) = body_prefix::<DirtyRange>(rest)
            .map_err(|_| Error::InvalidReply("dirty pages reply too short"))?;
        if reply_range.bitmap.size != bitmap_bytes || data.len() != bitmap_bytes as usize {
            return Err(Error::InvalidReply("dirty bitmap size mismatch"));
        }
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use tempfile::tempfile;

    use super::*;

    #[test]
    fn bitmap_sizes() {
        assert_eq!(bitmap_size(4096, 4096).unwrap(), 8);
        assert_eq!(bitmap_size(64 * 4096, 4096).unwrap(), 8);
        assert_eq!(bitmap_size(65 * 4096, 4096).unwrap(), 16);
        assert_eq!(bitmap_size(1, 4096).unwrap(), 8);
        assert!(bitmap_size(4096, 3000).is_err());
    }

    #[test]
    fn irq_ranges() {
        assert_eq!(irq_range_end(0, 4).unwrap(), 4);
        assert_eq!(irq_range_end(u32::MAX - 2, 2).unwrap(), u32::MAX);
        assert!(matches!(
            irq_range_end(u32::MAX, 1),
            Err(Error::InvalidParam(_))
        ));
        assert!(irq_range_end(1, u32::MAX as usize).is_err());
    }

    #[test]
    fn eventfd_run_splitting() {
        let a = tempfile().unwrap();
        let fd = Some(a.as_fd());
        let fds = [fd, fd, fd, None, None, fd, fd, fd, fd, fd];
        assert_eq!(eventfd_runs(&fds, 3), vec![(0, 3), (3, 2), (5, 3), (8, 2)]);
        assert!(eventfd_runs(&[], 3).is_empty());
        assert_eq!(eventfd_runs(&[None, None, None, None], 8), vec![(0, 4)]);
    }
}
