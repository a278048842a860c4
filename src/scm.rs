// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Passing file descriptors alongside vfio-user messages.
//!
//! Descriptors travel as `SCM_RIGHTS` ancillary data attached to the first byte of a message. The
//! receive side must not let one `recvmsg` cross into the next message, otherwise the descriptors
//! attached to that message are lost; the proxy therefore reads the header of every message with
//! its own call.

use std::io;
use std::io::IoSlice;
use std::mem::size_of;
use std::mem::MaybeUninit;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use libc::c_void;
use libc::cmsghdr;
use libc::iovec;
use libc::msghdr;
use libc::MSG_CMSG_CLOEXEC;
use libc::MSG_CTRUNC;
use libc::MSG_DONTWAIT;
use libc::MSG_NOSIGNAL;
use libc::SCM_RIGHTS;
use libc::SOL_SOCKET;

use crate::Error;
use crate::Result;

/// Control buffer space needed to carry `count` descriptors.
fn cmsg_space(count: usize) -> usize {
    // SAFETY: CMSG_SPACE only performs arithmetic on its argument.
    unsafe { libc::CMSG_SPACE((count * size_of::<RawFd>()) as u32) as usize }
}

/// A control message buffer aligned for `cmsghdr`.
struct CmsgBuffer(Vec<u64>);

impl CmsgBuffer {
    fn with_capacity(bytes: usize) -> CmsgBuffer {
        CmsgBuffer(vec![0u64; bytes.div_ceil(size_of::<u64>())])
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        self.0.as_mut_ptr() as *mut c_void
    }
}

fn zeroed_msghdr() -> msghdr {
    // SAFETY: msghdr only contains integers and pointers, for which all-zero is valid. musl adds
    // private padding fields that cannot be initialized any other way.
    unsafe { MaybeUninit::<msghdr>::zeroed().assume_init() }
}

/// Sends `bufs` on `sock` without blocking, attaching `fds` to the first byte.
///
/// Returns the number of bytes written, which may be less than the total. A full socket buffer is
/// reported as `ErrorKind::WouldBlock`.
#[allow(clippy::useless_conversion)]
pub fn send_with_fds(sock: BorrowedFd, bufs: &[IoSlice], fds: &[RawFd]) -> io::Result<usize> {
    let cmsg_capacity = cmsg_space(fds.len());
    let mut cmsg_buffer = CmsgBuffer::with_capacity(cmsg_capacity);

    let mut msg = zeroed_msghdr();
    // IoSlice is guaranteed to be ABI compatible with iovec.
    msg.msg_iov = bufs.as_ptr() as *mut iovec;
    msg.msg_iovlen = bufs.len().try_into().unwrap_or(0);

    if !fds.is_empty() {
        msg.msg_control = cmsg_buffer.as_mut_ptr();
        msg.msg_controllen = cmsg_capacity.try_into().unwrap_or(0);
        // SAFETY: msg_control points at a buffer large enough for one cmsghdr carrying
        // `fds.len()` descriptors, so CMSG_FIRSTHDR is non-null and CMSG_DATA is in bounds.
        unsafe {
            let cmsg: *mut cmsghdr = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = SOL_SOCKET;
            (*cmsg).cmsg_type = SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * size_of::<RawFd>()) as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg) as *mut RawFd,
                fds.len(),
            );
        }
    }

    loop {
        // SAFETY: msg was built from valid (or null) pointers of the indicated lengths and the
        // return value is checked.
        let ret = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, MSG_NOSIGNAL | MSG_DONTWAIT) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receives into `buf` without blocking, accepting up to `max_fds` descriptors.
///
/// Returns the byte count (0 on orderly shutdown) and the descriptors that arrived. Descriptors
/// are close-on-exec. If the peer attached more descriptors than `max_fds` the ones that did
/// arrive are closed and an `InvalidData` error is returned.
#[allow(clippy::useless_conversion, clippy::unnecessary_cast)]
pub fn recv_with_fds(
    sock: BorrowedFd,
    buf: &mut [u8],
    max_fds: usize,
) -> io::Result<(usize, Vec<OwnedFd>)> {
    // Always leave room for at least one descriptor so that unexpected ones are detected rather
    // than silently discarded by the kernel.
    let cmsg_capacity = cmsg_space(max_fds.max(1));
    let mut cmsg_buffer = CmsgBuffer::with_capacity(cmsg_capacity);

    let mut iov = iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let mut msg = zeroed_msghdr();
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buffer.as_mut_ptr();
    msg.msg_controllen = cmsg_capacity.try_into().unwrap_or(0);

    let count = loop {
        // SAFETY: msg points at `buf` and `cmsg_buffer`, both valid for their stated lengths.
        let ret = unsafe {
            libc::recvmsg(
                sock.as_raw_fd(),
                &mut msg,
                MSG_DONTWAIT | MSG_CMSG_CLOEXEC,
            )
        };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut fds = Vec::new();
    // SAFETY: the kernel filled in msg_control/msg_controllen; CMSG_FIRSTHDR/CMSG_NXTHDR only
    // return headers that lie inside that buffer.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == SOL_SOCKET && (*cmsg).cmsg_type == SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..data_len / size_of::<RawFd>() {
                    // The descriptors were installed in this process by recvmsg and are owned
                    // by nobody else.
                    fds.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & MSG_CTRUNC != 0 || fds.len() > max_fds {
        // Dropping `fds` closes whatever did arrive.
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("too many descriptors attached (limit {})", max_fds),
        ));
    }

    Ok((count, fds))
}

/// File descriptors travelling with one message.
///
/// Descriptors to send are owned duplicates so that a queued message stays valid after the caller
/// returns; they are closed once the message has been written. Received descriptors are owned as
/// well and are closed on every path that does not hand them to the caller.
#[derive(Debug, Default)]
pub struct FdBundle {
    send: Vec<OwnedFd>,
    recv_capacity: usize,
    received: Vec<OwnedFd>,
}

impl FdBundle {
    pub fn new() -> FdBundle {
        FdBundle::default()
    }

    /// A bundle expecting up to `recv_capacity` descriptors back.
    pub fn with_recv_capacity(recv_capacity: usize) -> FdBundle {
        FdBundle {
            recv_capacity,
            ..Default::default()
        }
    }

    /// Duplicates `fds` for transmission.
    pub fn attach<F: AsFd>(&mut self, fds: &[F]) -> Result<()> {
        for fd in fds {
            let dup = fd
                .as_fd()
                .try_clone_to_owned()
                .map_err(Error::SocketError)?;
            self.send.push(dup);
        }
        Ok(())
    }

    /// Takes ownership of already duplicated descriptors for transmission.
    pub fn attach_owned(&mut self, fds: Vec<OwnedFd>) {
        self.send.extend(fds);
    }

    pub fn send_count(&self) -> usize {
        self.send.len()
    }

    pub(crate) fn send_fds(&self) -> Vec<RawFd> {
        self.send.iter().map(|fd| fd.as_raw_fd()).collect()
    }

    /// Closes the local copies once the peer has received them.
    pub(crate) fn release_sent(&mut self) {
        self.send.clear();
    }

    pub fn recv_capacity(&self) -> usize {
        self.recv_capacity
    }

    pub fn recv_count(&self) -> usize {
        self.received.len()
    }

    /// Stores descriptors that arrived with a reply. Descriptors beyond the declared capacity are
    /// closed and the whole set is rejected.
    pub(crate) fn accept(&mut self, fds: Vec<OwnedFd>) -> Result<()> {
        if self.received.len() + fds.len() > self.recv_capacity {
            return Err(Error::IncorrectFds {
                expected: self.recv_capacity,
                got: self.received.len() + fds.len(),
            });
        }
        self.received.extend(fds);
        Ok(())
    }

    /// Returns the received descriptors, leaving the bundle empty.
    pub fn extract(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.received)
    }
}
