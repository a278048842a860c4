// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! epoll and eventfd wrappers used by the proxy's worker threads.

use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem::MaybeUninit;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::ptr::null_mut;

use libc::c_int;
use libc::epoll_event;
use libc::EPOLLHUP;
use libc::EPOLLIN;
use libc::EPOLLOUT;
use libc::EPOLLRDHUP;
use libc::EPOLL_CLOEXEC;
use libc::EPOLL_CTL_ADD;
use libc::EPOLL_CTL_DEL;
use libc::EPOLL_CTL_MOD;

const EVENT_CONTEXT_MAX_EVENTS: usize = 8;

/// What a registered descriptor stands for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u64)]
pub enum Token {
    /// The connection socket.
    Socket = 0,
    /// The worker's stop event.
    Stop = 1,
    /// Incoming requests are waiting to be dispatched.
    Dispatch = 2,
}

/// Readiness a descriptor is watched for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventType {
    Read,
    ReadWrite,
}

impl From<EventType> for u32 {
    fn from(et: EventType) -> u32 {
        let v = match et {
            EventType::Read => EPOLLIN | EPOLLRDHUP,
            EventType::ReadWrite => EPOLLIN | EPOLLRDHUP | EPOLLOUT,
        };
        v as u32
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TriggeredEvent {
    pub token: Token,
    pub is_readable: bool,
    pub is_writable: bool,
    pub is_hungup: bool,
}

fn errno_result<T>() -> io::Result<T> {
    Err(io::Error::last_os_error())
}

/// An epoll instance with descriptors registered under a [`Token`].
///
/// Registrations may be changed from any thread while another thread waits.
pub struct EventContext {
    epoll_ctx: File,
}

impl EventContext {
    pub fn new() -> io::Result<EventContext> {
        // SAFETY: epoll_create1 takes no pointers; the result is checked.
        let epoll_fd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return errno_result();
        }
        Ok(EventContext {
            // SAFETY: the descriptor was just created and is owned by nobody else.
            epoll_ctx: unsafe { File::from_raw_fd(epoll_fd) },
        })
    }

    pub fn build_with(fd_tokens: &[(BorrowedFd, EventType, Token)]) -> io::Result<EventContext> {
        let ctx = EventContext::new()?;
        for (fd, event_type, token) in fd_tokens {
            ctx.add_for_event(*fd, *event_type, *token)?;
        }
        Ok(ctx)
    }

    fn ctl(
        &self,
        op: c_int,
        fd: BorrowedFd,
        event_type: EventType,
        token: Token,
    ) -> io::Result<()> {
        let mut evt = epoll_event {
            events: event_type.into(),
            u64: token as u64,
        };
        // SAFETY: both descriptors are valid and `evt` outlives the call.
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_ctx.as_raw_fd(), op, fd.as_raw_fd(), &mut evt)
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    pub fn add_for_event(
        &self,
        fd: BorrowedFd,
        event_type: EventType,
        token: Token,
    ) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, event_type, token)
    }

    /// Changes the readiness `fd` is watched for.
    pub fn modify(&self, fd: BorrowedFd, event_type: EventType, token: Token) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, event_type, token)
    }

    pub fn delete(&self, fd: BorrowedFd) -> io::Result<()> {
        // SAFETY: a null event is allowed for EPOLL_CTL_DEL; the result is checked.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll_ctx.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd.as_raw_fd(),
                null_mut(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until at least one registered descriptor is ready.
    pub fn wait(&self) -> io::Result<Vec<TriggeredEvent>> {
        let mut epoll_events: [MaybeUninit<epoll_event>; EVENT_CONTEXT_MAX_EVENTS] =
            [MaybeUninit::uninit(); EVENT_CONTEXT_MAX_EVENTS];
        let ret = loop {
            // SAFETY: the kernel writes at most `max_events` entries into `epoll_events`.
            let ret = unsafe {
                libc::epoll_wait(
                    self.epoll_ctx.as_raw_fd(),
                    epoll_events.as_mut_ptr() as *mut epoll_event,
                    epoll_events.len() as c_int,
                    -1,
                )
            };
            if ret >= 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                break ret;
            }
        };
        if ret < 0 {
            return errno_result();
        }

        let events = epoll_events[..ret as usize]
            .iter()
            .filter_map(|e| {
                // SAFETY: epoll_wait initialized the first `ret` entries.
                let e = unsafe { e.assume_init() };
                let token = Token::n(e.u64)?;
                Some(TriggeredEvent {
                    token,
                    is_readable: e.events & (EPOLLIN as u32) != 0,
                    is_writable: e.events & (EPOLLOUT as u32) != 0,
                    is_hungup: e.events & ((EPOLLHUP | EPOLLRDHUP) as u32) != 0,
                })
            })
            .collect();
        Ok(events)
    }
}

/// An eventfd counter.
#[derive(Debug)]
pub struct Event(File);

impl Event {
    pub fn new() -> io::Result<Event> {
        // SAFETY: eventfd takes no pointers; the result is checked.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return errno_result();
        }
        // SAFETY: the descriptor was just created and is owned by nobody else.
        Ok(Event(unsafe { File::from_raw_fd(fd) }))
    }

    pub fn try_clone(&self) -> io::Result<Event> {
        self.0.try_clone().map(Event)
    }

    pub fn signal(&self) -> io::Result<()> {
        (&self.0).write_all(&1u64.to_ne_bytes())
    }

    /// Resets the counter. Returns false if it was not signaled.
    pub fn reset(&self) -> io::Result<bool> {
        let mut buf = [0u8; 8];
        match (&self.0).read(&mut buf) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for Event {
    fn as_fd(&self) -> BorrowedFd {
        self.0.as_fd()
    }
}
