// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recycled records for messages in flight.
//!
//! Every message the proxy sends or receives lives in a [`Slot`] while it sits in one of the
//! proxy's queues. Slots are kept in an arena and referred to by index, so queues only move
//! [`SlotId`]s around. A released slot goes back on the free list with its condition variable
//! intact; everything else is reset.

use std::sync::Arc;
use std::sync::Condvar;

use crate::message::Message;
use crate::scm::FdBundle;
use crate::Error;

/// Index of a slot in the pool.
pub type SlotId = usize;

/// How the sender of a message waits for its outcome.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotKind {
    /// Fire and forget: released as soon as it is written.
    Async,
    /// Reply expected but nobody blocks on it, unless a caller later joins it through
    /// `wait_pending`, which sets `awaited`.
    NoWait { awaited: bool },
    /// A caller is blocked on the slot's condition variable.
    Wait,
    /// A request received from the server.
    Request,
}

impl SlotKind {
    /// Whether a thread is blocked on this slot and will release it itself.
    pub fn has_waiter(&self) -> bool {
        matches!(self, SlotKind::Wait | SlotKind::NoWait { awaited: true })
    }
}

/// An error forced onto a slot by the proxy rather than reported by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotError {
    Disconnected,
    IncorrectFds { expected: usize, got: usize },
    Malformed(&'static str),
    ReplyTooLarge { capacity: usize, size: usize },
}

impl SlotError {
    /// The error a slot is left with when the connection fails with `e` while the slot's reply
    /// is in flight.
    pub fn from_error(e: &Error) -> SlotError {
        match e {
            Error::IncorrectFds { expected, got } => SlotError::IncorrectFds {
                expected: *expected,
                got: *got,
            },
            Error::MalformedMessage(what) => SlotError::Malformed(*what),
            _ => SlotError::Disconnected,
        }
    }
}

impl From<SlotError> for Error {
    fn from(e: SlotError) -> Error {
        match e {
            SlotError::Disconnected => Error::Disconnected,
            SlotError::IncorrectFds { expected, got } => Error::IncorrectFds { expected, got },
            SlotError::Malformed(what) => Error::MalformedMessage(what),
            SlotError::ReplyTooLarge { capacity, size } => Error::ReplyTooLarge { capacity, size },
        }
    }
}

pub struct Slot {
    pub kind: SlotKind,
    /// Correlation id of the message.
    pub id: u16,
    /// Message to transmit, or the request received from the server.
    pub msg: Option<Message>,
    /// Bytes of `msg` already written to the socket.
    pub sent: usize,
    pub fds: FdBundle,
    /// Largest reply accepted for this request.
    pub reply_capacity: usize,
    pub reply: Option<Message>,
    pub complete: bool,
    pub error: Option<SlotError>,
    pub cond: Arc<Condvar>,
    in_use: bool,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            kind: SlotKind::Async,
            id: 0,
            msg: None,
            sent: 0,
            fds: FdBundle::new(),
            reply_capacity: 0,
            reply: None,
            complete: false,
            error: None,
            cond: Arc::new(Condvar::new()),
            in_use: false,
        }
    }

    /// Marks the slot complete with `error` unless it already completed.
    pub fn fail(&mut self, error: SlotError) {
        if !self.complete {
            self.error = Some(error);
            self.complete = true;
        }
    }

    /// Bytes of the outbound message still to be written.
    pub fn unsent(&self) -> &[u8] {
        match &self.msg {
            Some(msg) => &msg.as_bytes()[self.sent.min(msg.len())..],
            None => &[],
        }
    }
}

#[derive(Default)]
pub struct SlotPool {
    slots: Vec<Slot>,
    free: Vec<SlotId>,
}

impl SlotPool {
    pub fn new() -> SlotPool {
        SlotPool::default()
    }

    /// Takes a slot off the free list, growing the arena when it is empty.
    pub fn acquire(
        &mut self,
        kind: SlotKind,
        msg: Option<Message>,
        fds: FdBundle,
        reply_capacity: usize,
    ) -> SlotId {
        let slot_id = match self.free.pop() {
            Some(slot_id) => slot_id,
            None => {
                self.slots.push(Slot::new());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[slot_id];
        slot.kind = kind;
        slot.id = msg.as_ref().map(|m| m.header().id).unwrap_or(0);
        slot.msg = msg;
        slot.sent = 0;
        slot.fds = fds;
        slot.reply_capacity = reply_capacity;
        slot.reply = None;
        slot.complete = false;
        slot.error = None;
        slot.in_use = true;
        slot_id
    }

    /// Clears the slot and returns it to the free list. Any buffers and descriptors still held
    /// are dropped here.
    pub fn release(&mut self, slot_id: SlotId) {
        let slot = &mut self.slots[slot_id];
        if !slot.in_use {
            return;
        }
        slot.msg = None;
        slot.reply = None;
        slot.fds = FdBundle::new();
        slot.error = None;
        slot.complete = false;
        slot.in_use = false;
        self.free.push(slot_id);
    }

    pub fn get(&self, slot_id: SlotId) -> &Slot {
        &self.slots[slot_id]
    }

    pub fn get_mut(&mut self, slot_id: SlotId) -> &mut Slot {
        &mut self.slots[slot_id]
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;
    use crate::message::Header;
    use crate::message::HeaderFlags;

    fn request(id: u16) -> Message {
        Message::new(
            Header::request(id, Command::DeviceReset, HeaderFlags::empty()),
            &[],
        )
        .unwrap()
    }

    #[test]
    fn acquire_release_recycles() {
        let mut pool = SlotPool::new();
        let a = pool.acquire(SlotKind::Wait, Some(request(1)), FdBundle::new(), 64);
        let b = pool.acquire(SlotKind::Async, Some(request(2)), FdBundle::new(), 0);
        assert_ne!(a, b);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.get(a).id, 1);
        assert_eq!(pool.get(b).id, 2);

        let cond = pool.get(a).cond.clone();
        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        // Releasing twice is harmless.
        pool.release(a);
        assert_eq!(pool.in_use(), 1);

        let c = pool.acquire(
            SlotKind::NoWait { awaited: false },
            Some(request(3)),
            FdBundle::new(),
            0,
        );
        assert_eq!(c, a);
        assert!(Arc::ptr_eq(&cond, &pool.get(c).cond));
        assert!(!pool.get(c).complete);
        assert!(pool.get(c).reply.is_none());
    }

    #[test]
    fn fail_only_once() {
        let mut pool = SlotPool::new();
        let a = pool.acquire(SlotKind::Wait, Some(request(1)), FdBundle::new(), 64);
        pool.get_mut(a).fail(SlotError::Malformed("short"));
        pool.get_mut(a).fail(SlotError::Disconnected);
        assert!(pool.get(a).complete);
        assert_eq!(pool.get(a).error, Some(SlotError::Malformed("short")));
    }

    #[test]
    fn unsent_tracks_progress() {
        let mut pool = SlotPool::new();
        let a = pool.acquire(SlotKind::Async, Some(request(1)), FdBundle::new(), 0);
        assert_eq!(pool.get(a).unsent().len(), 16);
        pool.get_mut(a).sent = 10;
        assert_eq!(pool.get(a).unsent().len(), 6);
    }

    #[test]
    fn error_mapping() {
        assert_eq!(
            SlotError::from_error(&Error::MalformedMessage("bad")),
            SlotError::Malformed("bad")
        );
        assert_eq!(
            SlotError::from_error(&Error::UnexpectedReply(3)),
            SlotError::Disconnected
        );
        assert!(matches!(
            Error::from(SlotError::ReplyTooLarge {
                capacity: 1,
                size: 2
            }),
            Error::ReplyTooLarge {
                capacity: 1,
                size: 2
            }
        ));
    }

    #[test]
    fn waiter_kinds() {
        assert!(SlotKind::Wait.has_waiter());
        assert!(SlotKind::NoWait { awaited: true }.has_waiter());
        assert!(!SlotKind::NoWait { awaited: false }.has_waiter());
        assert!(!SlotKind::Async.has_waiter());
        assert!(!SlotKind::Request.has_waiter());
    }
}
