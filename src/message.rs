// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Define communication messages for the vfio-user protocol.
//!
//! Every message starts with a fixed 16 byte [`Header`]. The header is followed by a
//! command-specific body and, for some commands, raw data bytes (register contents, bitmaps,
//! capability documents). All numeric fields are little-endian.

use std::mem::size_of;

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::Error;
use crate::Result;

#[cfg(target_endian = "big")]
compile_error!("vfio-user messages are little-endian; big-endian hosts are not supported");

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Room reserved for fixed-size command bodies on top of the negotiated data transfer size.
pub const MAX_FIXED_BODY: usize = 256;

/// Protocol version spoken by this implementation.
pub const VFIO_USER_MAJOR_VER: u16 = 0;
pub const VFIO_USER_MINOR_VER: u16 = 1;

/// Largest amount of inline data a single entry of a REGION_WRITE_MULTI message can carry.
pub const MULTI_WRITE_DATA_SIZE: usize = 8;

/// Mask of the message type bits in [`Header::flags`].
pub const TYPE_MASK: u32 = 0xf;

/// Largest message that may be received when `max_xfer` bytes of data are allowed per message.
pub fn max_message_size(max_xfer: u32) -> usize {
    HEADER_SIZE + MAX_FIXED_BODY + max_xfer as usize
}

/// Commands understood by either end of the connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u16)]
pub enum Command {
    Version = 1,
    DmaMap = 2,
    DmaUnmap = 3,
    DeviceGetInfo = 4,
    DeviceGetRegionInfo = 5,
    DeviceGetIrqInfo = 6,
    DeviceSetIrqs = 7,
    RegionRead = 8,
    RegionWrite = 9,
    DmaRead = 10,
    DmaWrite = 11,
    VmInterrupt = 12,
    DeviceReset = 13,
    DirtyPages = 14,
    RegionWriteMulti = 15,
    DmaUnmapDirty = 16,
}

/// Value of the type bits of [`Header::flags`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum MsgType {
    Request = 0,
    Reply = 1,
}

bitflags! {
    /// Flag bits of [`Header::flags`] above the type nibble.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// The sender does not expect a reply.
        const NO_REPLY = 0x10;
        /// The reply carries an error in `error_code`.
        const ERROR = 0x20;
    }
}

/// Common message header.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Header {
    pub id: u16,
    pub command: u16,
    pub size: u32,
    pub flags: u32,
    pub error_code: u32,
}

const_assert_eq!(HEADER_SIZE, 16);

impl Header {
    /// Create a request header. `size` is filled in when the message is assembled.
    pub fn request(id: u16, command: Command, flags: HeaderFlags) -> Self {
        Header {
            id,
            command: command as u16,
            size: HEADER_SIZE as u32,
            flags: MsgType::Request as u32 | flags.bits(),
            error_code: 0,
        }
    }

    /// Create the reply header matching `request`. A non-zero `errno` marks the reply as an error.
    pub fn reply_to(request: &Header, errno: u32) -> Self {
        let mut flags = MsgType::Reply as u32;
        if errno != 0 {
            flags |= HeaderFlags::ERROR.bits();
        }
        Header {
            id: request.id,
            command: request.command,
            size: HEADER_SIZE as u32,
            flags,
            error_code: errno,
        }
    }

    pub fn get_command(&self) -> Option<Command> {
        Command::n(self.command)
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::n(self.flags & TYPE_MASK)
    }

    pub fn get_flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    pub fn is_reply(&self) -> bool {
        self.msg_type() == Some(MsgType::Reply)
    }

    pub fn no_reply(&self) -> bool {
        self.get_flags().contains(HeaderFlags::NO_REPLY)
    }

    /// Returns the peer's errno if this is an error reply.
    pub fn error(&self) -> Option<u32> {
        if self.get_flags().contains(HeaderFlags::ERROR) {
            Some(self.error_code)
        } else {
            None
        }
    }

    /// Check whether this header is the reply for `req`.
    pub fn is_reply_for(&self, req: &Header) -> bool {
        self.is_reply() && self.id == req.id && self.command == req.command
    }

    /// Validates the framing fields of a received header.
    ///
    /// Fails if the size is smaller than the header, larger than `max_size`, or the type bits
    /// are neither REQUEST nor REPLY.
    pub fn validate(&self, max_size: usize) -> Result<MsgType> {
        if (self.size as usize) < HEADER_SIZE {
            return Err(Error::MalformedMessage("size smaller than header"));
        }
        if self.size as usize > max_size {
            return Err(Error::MalformedMessage("size exceeds maximum transfer size"));
        }
        self.msg_type()
            .ok_or(Error::MalformedMessage("unknown message type"))
    }
}

/// A complete message: header followed by its body, in wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    buf: Vec<u8>,
}

impl Message {
    /// Assemble a message from a header and body parts. The header's size is set to the total.
    pub fn new(mut header: Header, body: &[&[u8]]) -> Result<Message> {
        let body_len: usize = body.iter().map(|b| b.len()).sum();
        let total = HEADER_SIZE
            .checked_add(body_len)
            .ok_or(Error::OversizedMsg)?;
        header.size = u32::try_from(total).map_err(|_| Error::OversizedMsg)?;
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(header.as_bytes());
        for part in body {
            buf.extend_from_slice(part);
        }
        Ok(Message { buf })
    }

    /// Wrap bytes that were received from the peer. `bytes` must hold exactly one message.
    pub fn from_bytes(bytes: Vec<u8>, max_size: usize) -> Result<Message> {
        let (header, _) = Header::read_from_prefix(&bytes)
            .map_err(|_| Error::MalformedMessage("truncated header"))?;
        header.validate(max_size)?;
        if header.size as usize != bytes.len() {
            return Err(Error::MalformedMessage("size does not match message length"));
        }
        Ok(Message { buf: bytes })
    }

    pub fn header(&self) -> Header {
        // `buf` always holds at least a header.
        Header::read_from_prefix(&self.buf)
            .map(|(hdr, _)| hdr)
            .unwrap_or_default()
    }

    pub fn set_header(&mut self, header: &Header) {
        self.buf[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    pub fn set_id(&mut self, id: u16) {
        let mut hdr = self.header();
        hdr.id = id;
        self.set_header(&hdr);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    /// Reads a fixed-size body from the start of the payload.
    pub fn body<T: FromBytes>(&self) -> Result<T> {
        body_prefix(self.payload()).map(|(body, _)| body)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Decode one message from `bytes`, which must contain exactly the message.
pub fn decode(bytes: &[u8], max_xfer: u32) -> Result<Message> {
    Message::from_bytes(bytes.to_vec(), max_message_size(max_xfer))
}

/// Split a fixed-size body off the front of `bytes`.
pub fn body_prefix<T: FromBytes>(bytes: &[u8]) -> Result<(T, &[u8])> {
    T::read_from_prefix(bytes).map_err(|_| Error::MalformedMessage("payload too short"))
}

/// Body of VFIO_USER_VERSION. Followed by a NUL-terminated capability document.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VersionBody {
    pub major: u16,
    pub minor: u16,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DmaProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DmaMapFlags: u32 {
        /// A file descriptor backing the region is attached to the message.
        const MAPPABLE = 0x1;
    }
}

/// Entry of the table carried by VFIO_USER_DMA_MAP and VFIO_USER_DMA_UNMAP.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DmaTableEntry {
    pub address: u64,
    pub size: u64,
    pub offset: u64,
    pub protection: u32,
    pub flags: u32,
}

/// Describes a dirty page bitmap: page granularity and bitmap length in bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DirtyBitmap {
    pub pgsize: u64,
    pub size: u64,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        const RESET = 0x1;
        const PCI = 0x2;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DeviceInfo {
    pub argsz: u32,
    pub flags: u32,
    pub num_regions: u32,
    pub num_irqs: u32,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        /// The region may be mapped directly into the guest.
        const MMAP = 0x4;
        const CAPS = 0x8;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RegionInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub cap_offset: u32,
    pub size: u64,
    pub offset: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IrqInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub count: u32,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IrqSetFlags: u32 {
        const DATA_NONE = 0x1;
        const DATA_BOOL = 0x2;
        const DATA_EVENTFD = 0x4;
        const ACTION_MASK = 0x8;
        const ACTION_UNMASK = 0x10;
        const ACTION_TRIGGER = 0x20;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IrqSet {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub start: u32,
    pub count: u32,
}

/// Body of VFIO_USER_REGION_READ and VFIO_USER_REGION_WRITE, followed by the data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RegionAccess {
    pub offset: u64,
    pub region: u32,
    pub count: u32,
}

/// Body of VFIO_USER_REGION_WRITE_MULTI, followed by `wr_cnt` entries.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WriteMultiBody {
    pub wr_cnt: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WriteMultiEntry {
    pub offset: u64,
    pub region: u32,
    pub count: u32,
    pub data: [u8; MULTI_WRITE_DATA_SIZE],
}

/// Body of VFIO_USER_DMA_READ and VFIO_USER_DMA_WRITE, followed by the data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DmaAccess {
    pub offset: u64,
    pub count: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VmInterrupt {
    pub index: u32,
    pub subindex: u32,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DirtyPagesFlags: u32 {
        const START = 0x1;
        const STOP = 0x2;
        const GET_BITMAP = 0x4;
    }
}

/// Body of VFIO_USER_DIRTY_PAGES. A GET_BITMAP request is followed by a [`DirtyRange`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DirtyPages {
    pub argsz: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DirtyRange {
    pub iova: u64,
    pub size: u64,
    pub bitmap: DirtyBitmap,
}

const_assert_eq!(size_of::<DmaTableEntry>(), 32);
const_assert_eq!(size_of::<RegionInfo>(), 32);
const_assert_eq!(size_of::<IrqSet>(), 20);
const_assert_eq!(size_of::<RegionAccess>(), 16);
const_assert_eq!(size_of::<WriteMultiEntry>(), 24);
const_assert_eq!(size_of::<DirtyRange>(), 32);

/// A request initiated by the server, already split into its typed parts.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerRequest<'a> {
    /// Read `count` bytes of guest memory at `offset`.
    DmaRead { offset: u64, count: u32 },
    /// Write `data` to guest memory at `offset`.
    DmaWrite { offset: u64, data: &'a [u8] },
    /// Raise the interrupt `subindex` of IRQ `index`.
    VmInterrupt { index: u32, subindex: u32 },
}

impl<'a> ServerRequest<'a> {
    /// Parse a request message sent by the server. Commands the client never serves yield
    /// `InvalidParam`.
    pub fn parse(msg: &'a Message) -> Result<ServerRequest<'a>> {
        let hdr = msg.header();
        match hdr.get_command() {
            Some(Command::DmaRead) => {
                let access: DmaAccess = msg.body()?;
                Ok(ServerRequest::DmaRead {
                    offset: access.offset,
                    count: access.count,
                })
            }
            Some(Command::DmaWrite) => {
                let (access, data) = body_prefix::<DmaAccess>(msg.payload())?;
                if data.len() != access.count as usize {
                    return Err(Error::MalformedMessage("DMA write count mismatch"));
                }
                Ok(ServerRequest::DmaWrite {
                    offset: access.offset,
                    data,
                })
            }
            Some(Command::VmInterrupt) => {
                let intr: VmInterrupt = msg.body()?;
                Ok(ServerRequest::VmInterrupt {
                    index: intr.index,
                    subindex: intr.subindex,
                })
            }
            _ => Err(Error::InvalidParam("unsupported server request")),
        }
    }
}
