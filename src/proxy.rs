// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One vfio-user connection.
//!
//! A [`Proxy`] multiplexes any number of caller threads over a single socket. Outbound messages
//! are written inline when the socket has room and queued otherwise; an I/O thread drains the
//! queue when the socket becomes writable and reads everything the server sends. Replies are
//! matched to their requests by id. Requests from the server are handed to a dispatcher thread,
//! which runs the registered [`RequestHandler`] with the [`GlobalLock`] held.
//!
//! All queues and connection state sit behind one mutex. Nothing blocks while holding it: the
//! socket is non-blocking and waiters sleep on per-slot condition variables.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::io::IoSlice;
use std::mem;
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Instant;

use log::debug;
use log::error;
use log::trace;
use log::warn;
use zerocopy::FromBytes;

use crate::batch;
use crate::batch::WriteBatch;
use crate::caps;
use crate::caps::Capabilities;
use crate::caps::MAX_MAX_FDS;
use crate::config::ProxyConfig;
use crate::global_lock::GlobalLock;
use crate::message::max_message_size;
use crate::message::Header;
use crate::message::Message;
use crate::message::MsgType;
use crate::message::ServerRequest;
use crate::message::HEADER_SIZE;
use crate::poll::Event;
use crate::poll::EventContext;
use crate::poll::EventType;
use crate::poll::Token;
use crate::scm::recv_with_fds;
use crate::scm::send_with_fds;
use crate::scm::FdBundle;
use crate::slot::SlotError;
use crate::slot::SlotId;
use crate::slot::SlotKind;
use crate::slot::SlotPool;
use crate::worker::WorkerThread;
use crate::Error;
use crate::Result;

/// Ids of timed out requests whose late replies are dropped instead of treated as protocol
/// errors.
const MAX_ABANDONED_IDS: usize = 256;

/// Lifecycle of a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Connected,
    /// The connection failed and was shut down for reading.
    Error,
    /// `disconnect` is in progress.
    Closing,
    Closed,
}

/// The reply to a synchronous call.
#[derive(Debug)]
pub struct Reply {
    msg: Message,
    fds: Vec<OwnedFd>,
}

impl Reply {
    pub fn header(&self) -> Header {
        self.msg.header()
    }

    pub fn payload(&self) -> &[u8] {
        self.msg.payload()
    }

    /// Reads a fixed-size body from the start of the payload.
    pub fn body<T: FromBytes>(&self) -> Result<T> {
        self.msg
            .body()
            .map_err(|_| Error::InvalidReply("reply too short"))
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    /// File descriptors that came with the reply.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        mem::take(&mut self.fds)
    }
}

/// A request sent by the server.
#[derive(Debug)]
pub struct IncomingRequest {
    msg: Message,
}

impl IncomingRequest {
    pub fn header(&self) -> Header {
        self.msg.header()
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub fn parse(&self) -> Result<ServerRequest> {
        ServerRequest::parse(&self.msg)
    }
}

/// Handles requests sent by the server.
///
/// Runs on the proxy's dispatcher thread with the global lock held, if one was set. The handler
/// answers through the [`Responder`]; if it returns an error without having answered, an error
/// reply is sent for it.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &IncomingRequest, responder: &Responder<'_>) -> anyhow::Result<()>;
}

impl<F> RequestHandler for F
where
    F: Fn(&IncomingRequest, &Responder<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, request: &IncomingRequest, responder: &Responder<'_>) -> anyhow::Result<()> {
        self(request, responder)
    }
}

/// Sends the answer to one server request.
pub struct Responder<'a> {
    shared: &'a Shared,
    request: Header,
    replied: Cell<bool>,
}

impl Responder<'_> {
    /// Sends a successful reply carrying `body`. Nothing is sent for requests marked NO_REPLY.
    pub fn send_reply(&self, body: &[&[u8]]) -> Result<()> {
        self.replied.set(true);
        if self.request.no_reply() {
            return Ok(());
        }
        let msg = Message::new(Header::reply_to(&self.request, 0), body)?;
        self.shared.send_async(msg, FdBundle::new())
    }

    /// Sends an error reply with `errno`.
    pub fn send_error_reply(&self, errno: i32) -> Result<()> {
        self.replied.set(true);
        if self.request.no_reply() {
            return Ok(());
        }
        let msg = Message::new(Header::reply_to(&self.request, errno as u32), &[])?;
        self.shared.send_async(msg, FdBundle::new())
    }

    pub fn replied(&self) -> bool {
        self.replied.get()
    }
}

/// Where the body of the message being received goes.
#[derive(Debug)]
enum Dest {
    /// Into the reply of a pending slot, or nowhere if the reply is dropped.
    Reply(Option<SlotId>),
    Request,
}

#[derive(Debug)]
struct BodyRecv {
    buf: Vec<u8>,
    filled: usize,
    dest: Dest,
}

/// A message whose bytes have not all arrived yet.
#[derive(Debug, Default)]
struct PartialRecv {
    header: [u8; HEADER_SIZE],
    header_len: usize,
    fds: Vec<OwnedFd>,
    body: Option<BodyRecv>,
}

enum Progress {
    Complete,
    Blocked,
}

struct Inner {
    state: ProxyState,
    pool: SlotPool,
    outgoing: VecDeque<SlotId>,
    pending: VecDeque<SlotId>,
    incoming: VecDeque<SlotId>,
    caps: Capabilities,
    last_nowait: Option<SlotId>,
    /// Failure of the last nowait request, reported by the next `wait_pending`.
    nowait_error: Option<Error>,
    partial: PartialRecv,
    batch: Option<WriteBatch>,
    posted_writes_disabled: bool,
    abandoned: VecDeque<u16>,
    write_interest: bool,
    socket_registered: bool,
    dispatch_scheduled: bool,
    /// Threads blocked on a slot, or woken but not yet done with it.
    waiters: usize,
}

struct Shared {
    sock: UnixStream,
    config: ProxyConfig,
    inner: Mutex<Inner>,
    close_cond: Condvar,
    poll: EventContext,
    dispatch_evt: Event,
    next_id: AtomicU16,
    timeouts: AtomicU64,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    global_lock: Mutex<Option<Arc<GlobalLock>>>,
}

fn errno_of(e: &anyhow::Error) -> i32 {
    if let Some(e) = e.downcast_ref::<Error>() {
        return e.errno();
    }
    if let Some(errno) = e.downcast_ref::<io::Error>().and_then(|e| e.raw_os_error()) {
        return errno;
    }
    libc::EINVAL
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("proxy lock poisoned")
    }

    fn next_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn global_lock(&self) -> Option<Arc<GlobalLock>> {
        self.global_lock.lock().expect("global lock slot poisoned").clone()
    }

    fn check_send(&self, inner: &Inner, msg: &Message, fds: &FdBundle) -> Result<()> {
        if inner.state != ProxyState::Connected {
            return Err(Error::Disconnected);
        }
        if fds.send_count() > inner.caps.max_fds as usize {
            return Err(Error::InvalidParam("too many file descriptors"));
        }
        if msg.len() > max_message_size(inner.caps.max_xfer_size) {
            return Err(Error::OversizedMsg);
        }
        Ok(())
    }

    fn set_write_interest(&self, inner: &mut Inner, enable: bool) {
        if inner.write_interest == enable || !inner.socket_registered {
            return;
        }
        let event_type = if enable {
            EventType::ReadWrite
        } else {
            EventType::Read
        };
        match self.poll.modify(self.sock.as_fd(), event_type, Token::Socket) {
            Ok(()) => inner.write_interest = enable,
            Err(e) => error!("failed to change socket write interest: {}", e),
        }
    }

    /// Writes as much of the slot's message as the socket takes. Returns true once all of it is
    /// out. File descriptors go with the first byte.
    fn write_slot(&self, inner: &mut Inner, slot_id: SlotId) -> Result<bool> {
        let slot = inner.pool.get_mut(slot_id);
        loop {
            if slot.unsent().is_empty() {
                return Ok(true);
            }
            let fds = if slot.sent == 0 {
                slot.fds.send_fds()
            } else {
                Vec::new()
            };
            match send_with_fds(self.sock.as_fd(), &[IoSlice::new(slot.unsent())], &fds) {
                Ok(count) => {
                    if count > 0 && slot.sent == 0 {
                        slot.fds.release_sent();
                    }
                    slot.sent += count;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(Error::SocketError(e)),
            }
        }
    }

    fn transmitted(&self, inner: &mut Inner, slot_id: SlotId) {
        let slot = inner.pool.get(slot_id);
        trace!("sent message {} ({} bytes)", slot.id, slot.sent);
        if slot.kind == SlotKind::Async {
            inner.pool.release(slot_id);
        } else {
            inner.pending.push_back(slot_id);
        }
    }

    /// Writes the slot now if nothing is queued ahead of it, otherwise queues it. On error the
    /// slot is in no queue and the caller disposes of it.
    fn send_queued(&self, inner: &mut Inner, slot_id: SlotId) -> Result<()> {
        if !inner.outgoing.is_empty() {
            inner.outgoing.push_back(slot_id);
            return Ok(());
        }
        match self.write_slot(inner, slot_id) {
            Ok(true) => {
                self.transmitted(inner, slot_id);
                Ok(())
            }
            Ok(false) => {
                inner.outgoing.push_front(slot_id);
                self.set_write_interest(inner, true);
                Ok(())
            }
            Err(e) => {
                self.fail_connection(inner, &e);
                Err(e)
            }
        }
    }

    /// Queues a slot after any pending batch, which keeps program order.
    fn enqueue(&self, inner: &mut Inner, slot_id: SlotId) -> Result<()> {
        self.flush_batch(inner)?;
        self.send_queued(inner, slot_id)
    }

    fn flush_batch(&self, inner: &mut Inner) -> Result<()> {
        let batch = match inner.batch.take() {
            Some(batch) if !batch.is_empty() => batch,
            _ => return Ok(()),
        };
        trace!("flushing {} coalesced writes", batch.len());
        let msg = batch.into_message(self.next_id())?;
        let slot_id = inner
            .pool
            .acquire(SlotKind::Async, Some(msg), FdBundle::new(), 0);
        if let Err(e) = self.send_queued(inner, slot_id) {
            inner.pool.release(slot_id);
            return Err(e);
        }
        Ok(())
    }

    fn send_async(&self, msg: Message, fds: FdBundle) -> Result<()> {
        let mut msg = msg;
        let hdr = msg.header();
        if !hdr.is_reply() && !hdr.no_reply() {
            return Err(Error::InvalidParam("async messages must not expect a reply"));
        }
        let mut inner = self.lock();
        self.check_send(&inner, &msg, &fds)?;
        if !hdr.is_reply() {
            msg.set_id(self.next_id());
        }
        let slot_id = inner.pool.acquire(SlotKind::Async, Some(msg), fds, 0);
        if let Err(e) = self.enqueue(&mut inner, slot_id) {
            inner.pool.release(slot_id);
            return Err(e);
        }
        Ok(())
    }

    fn send_nowait(&self, mut msg: Message, fds: FdBundle, reply_capacity: usize) -> Result<()> {
        let hdr = msg.header();
        if hdr.is_reply() || hdr.no_reply() {
            return Err(Error::InvalidParam("nowait messages must expect a reply"));
        }
        let mut inner = self.lock();
        self.check_send(&inner, &msg, &fds)?;
        msg.set_id(self.next_id());
        let slot_id = inner.pool.acquire(
            SlotKind::NoWait { awaited: false },
            Some(msg),
            fds,
            reply_capacity,
        );
        if let Err(e) = self.enqueue(&mut inner, slot_id) {
            inner.pool.release(slot_id);
            return Err(e);
        }
        inner.last_nowait = Some(slot_id);
        inner.nowait_error = None;
        Ok(())
    }

    fn send_wait(
        &self,
        mut msg: Message,
        fds: FdBundle,
        reply_capacity: usize,
        allow_lock_drop: bool,
    ) -> Result<Reply> {
        let hdr = msg.header();
        if hdr.is_reply() || hdr.no_reply() {
            return Err(Error::InvalidParam("wait messages must expect a reply"));
        }
        let global = if allow_lock_drop {
            self.global_lock()
        } else {
            None
        };
        let relock = global.as_deref().and_then(|lock| lock.unlock_temporarily());

        let mut inner = self.lock();
        self.check_send(&inner, &msg, &fds)?;
        msg.set_id(self.next_id());
        let slot_id = inner
            .pool
            .acquire(SlotKind::Wait, Some(msg), fds, reply_capacity);
        if let Err(e) = self.enqueue(&mut inner, slot_id) {
            inner.pool.release(slot_id);
            return Err(e);
        }
        inner.waiters += 1;
        let (inner, result) = self.wait_slot(inner, slot_id);
        drop(inner);
        drop(relock);
        result
    }

    fn wait_pending(&self) -> Result<()> {
        let global = self.global_lock();
        let relock = global.as_deref().and_then(|lock| lock.unlock_temporarily());

        let mut inner = self.lock();
        let slot_id = match inner.last_nowait.take() {
            Some(slot_id) => slot_id,
            None => {
                return match inner.nowait_error.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        };
        inner.pool.get_mut(slot_id).kind = SlotKind::NoWait { awaited: true };
        inner.waiters += 1;
        let (inner, result) = self.wait_slot(inner, slot_id);
        drop(inner);
        drop(relock);
        result.map(|_| ())
    }

    /// Blocks until the slot completes or the reply timeout passes, then disposes of the slot.
    fn wait_slot<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        slot_id: SlotId,
    ) -> (MutexGuard<'a, Inner>, Result<Reply>) {
        let deadline = Instant::now() + self.config.reply_timeout();
        let cond = inner.pool.get(slot_id).cond.clone();
        while !inner.pool.get(slot_id).complete {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = cond
                .wait_timeout(inner, deadline - now)
                .expect("proxy lock poisoned")
                .0;
        }

        let result = if inner.pool.get(slot_id).complete {
            let slot = inner.pool.get_mut(slot_id);
            if let SlotKind::NoWait { awaited } = &mut slot.kind {
                *awaited = false;
            }
            let result = match slot.error.take() {
                Some(e) => Err(e.into()),
                None => match slot.reply.take() {
                    Some(msg) => match msg.header().error() {
                        Some(errno) => Err(Error::Remote(errno)),
                        None => Ok(Reply {
                            msg,
                            fds: slot.fds.extract(),
                        }),
                    },
                    None => Err(Error::Disconnected),
                },
            };
            inner.pool.release(slot_id);
            result
        } else {
            let id = inner.pool.get(slot_id).id;
            self.abandon(&mut inner, slot_id);
            let count = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "request {} timed out after {:?} ({} timeouts on this connection)",
                id,
                self.config.reply_timeout(),
                count
            );
            Err(Error::Timeout)
        };

        inner.waiters -= 1;
        self.close_cond.notify_all();
        (inner, result)
    }

    /// Takes a timed out slot off whichever queue holds it. A reply that shows up later is
    /// dropped.
    fn abandon(&self, inner: &mut Inner, slot_id: SlotId) {
        let mut reply_in_progress = false;
        if let Some(body) = inner.partial.body.as_mut() {
            if let Dest::Reply(target) = &mut body.dest {
                if *target == Some(slot_id) {
                    *target = None;
                    reply_in_progress = true;
                }
            }
        }

        // A reply already being read is discarded as it completes; remembering its id would
        // only mask a later stray reply.
        if !reply_in_progress {
            let id = inner.pool.get(slot_id).id;
            if inner.abandoned.len() == MAX_ABANDONED_IDS {
                inner.abandoned.pop_front();
            }
            inner.abandoned.push_back(id);
        }

        if let Some(pos) = inner.pending.iter().position(|&s| s == slot_id) {
            inner.pending.remove(pos);
        } else if let Some(pos) = inner.outgoing.iter().position(|&s| s == slot_id) {
            if inner.pool.get(slot_id).sent > 0 {
                // Partly on the wire: it has to go out whole, then it is released.
                inner.pool.get_mut(slot_id).kind = SlotKind::Async;
                return;
            }
            inner.outgoing.remove(pos);
        }
        inner.pool.release(slot_id);
    }

    /// Unblocks the waiter of a slot or, if it has none, releases it.
    fn abort_slot(&self, inner: &mut Inner, slot_id: SlotId, error: SlotError) {
        let slot = inner.pool.get_mut(slot_id);
        if slot.kind.has_waiter() {
            slot.fail(error);
            slot.cond.notify_all();
            return;
        }
        if inner.last_nowait == Some(slot_id) {
            inner.last_nowait = None;
            inner.nowait_error = Some(error.into());
        }
        inner.pool.release(slot_id);
    }

    /// Shuts the connection down after an unrecoverable error and fails everything in flight.
    fn fail_connection(&self, inner: &mut Inner, err: &Error) {
        if inner.state == ProxyState::Connected {
            error!("vfio-user connection failed: {}", err);
            inner.state = ProxyState::Error;
        }
        let _ = self.sock.shutdown(Shutdown::Read);
        if inner.socket_registered {
            if let Err(e) = self.poll.delete(self.sock.as_fd()) {
                error!("failed to stop polling the socket: {}", e);
            }
            inner.socket_registered = false;
        }
        inner.batch = None;
        let in_flight: Vec<SlotId> = inner
            .outgoing
            .drain(..)
            .chain(inner.pending.drain(..))
            .collect();
        for slot_id in in_flight {
            self.abort_slot(inner, slot_id, SlotError::Disconnected);
        }
    }

    fn schedule_dispatch(&self, inner: &mut Inner) {
        if inner.dispatch_scheduled {
            return;
        }
        inner.dispatch_scheduled = true;
        if let Err(e) = self.dispatch_evt.signal() {
            error!("failed to schedule request dispatch: {}", e);
        }
    }

    /// Reads as much of the next message as is available.
    fn recv_message(&self, inner: &mut Inner, p: &mut PartialRecv) -> Result<Progress> {
        while p.body.is_none() {
            let (count, fds) = match recv_with_fds(
                self.sock.as_fd(),
                &mut p.header[p.header_len..],
                MAX_MAX_FDS as usize,
            ) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                Err(e) => return Err(Error::SocketError(e)),
            };
            if count == 0 {
                return Err(Error::Disconnected);
            }
            p.fds.extend(fds);
            p.header_len += count;
            if p.header_len == HEADER_SIZE {
                let body = self.start_body(inner, p)?;
                p.body = Some(body);
            }
        }

        if let Some(body) = p.body.as_mut() {
            while body.filled < body.buf.len() {
                let (count, _) =
                    match recv_with_fds(self.sock.as_fd(), &mut body.buf[body.filled..], 0) {
                        Ok(r) => r,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(Progress::Blocked)
                        }
                        Err(e) => return Err(Error::SocketError(e)),
                    };
                if count == 0 {
                    return Err(Error::Disconnected);
                }
                body.filled += count;
            }
        }

        if let Some(body) = mem::take(p).body {
            self.complete_message(inner, body)?;
        }
        Ok(Progress::Complete)
    }

    /// Classifies a complete header and decides where the rest of the message goes.
    fn start_body(&self, inner: &mut Inner, p: &mut PartialRecv) -> Result<BodyRecv> {
        let hdr = Header::read_from_bytes(&p.header[..])
            .map_err(|_| Error::MalformedMessage("truncated header"))?;
        let msg_type = hdr.validate(max_message_size(inner.caps.max_xfer_size))?;
        trace!(
            "received header id {} command {} size {}",
            hdr.id,
            hdr.command,
            hdr.size
        );

        let dest = match msg_type {
            MsgType::Reply => {
                match inner
                    .pending
                    .iter()
                    .position(|&s| inner.pool.get(s).id == hdr.id)
                {
                    Some(pos) => {
                        let slot_id = inner.pending[pos];
                        let slot = inner.pool.get_mut(slot_id);
                        let fds = mem::take(&mut p.fds);
                        if let Err(e) = slot.fds.accept(fds) {
                            slot.fail(SlotError::from_error(&e));
                            return Err(e);
                        }
                        if hdr.size as usize > slot.reply_capacity {
                            // The stream cannot be resynchronized past a body with no buffer.
                            let (capacity, size) = (slot.reply_capacity, hdr.size as usize);
                            slot.fail(SlotError::ReplyTooLarge { capacity, size });
                            return Err(Error::ReplyTooLarge { capacity, size });
                        }
                        Dest::Reply(Some(slot_id))
                    }
                    None => match inner.abandoned.iter().position(|&id| id == hdr.id) {
                        Some(pos) => {
                            debug!("dropping late reply {}", hdr.id);
                            inner.abandoned.remove(pos);
                            p.fds.clear();
                            Dest::Reply(None)
                        }
                        None => return Err(Error::UnexpectedReply(hdr.id)),
                    },
                }
            }
            MsgType::Request => {
                if !p.fds.is_empty() {
                    return Err(Error::UnexpectedFds);
                }
                Dest::Request
            }
        };

        let mut buf = vec![0u8; hdr.size as usize];
        buf[..HEADER_SIZE].copy_from_slice(&p.header);
        Ok(BodyRecv {
            buf,
            filled: HEADER_SIZE,
            dest,
        })
    }

    fn complete_message(&self, inner: &mut Inner, body: BodyRecv) -> Result<()> {
        match body.dest {
            Dest::Reply(None) => {}
            Dest::Reply(Some(slot_id)) => {
                let msg = Message::from_bytes(body.buf, usize::MAX)?;
                if let Some(pos) = inner.pending.iter().position(|&s| s == slot_id) {
                    inner.pending.remove(pos);
                }
                self.finish_reply(inner, slot_id, msg);
            }
            Dest::Request => {
                let msg = Message::from_bytes(body.buf, usize::MAX)?;
                let slot_id =
                    inner
                        .pool
                        .acquire(SlotKind::Request, Some(msg), FdBundle::new(), 0);
                inner.incoming.push_back(slot_id);
                self.schedule_dispatch(inner);
            }
        }
        Ok(())
    }

    /// Completes a slot that has left the pending queue.
    fn finish_reply(&self, inner: &mut Inner, slot_id: SlotId, reply: Message) {
        let slot = inner.pool.get_mut(slot_id);
        slot.reply = Some(reply);
        slot.complete = true;
        if slot.kind.has_waiter() {
            slot.cond.notify_all();
            return;
        }

        let failure = slot
            .reply
            .as_ref()
            .and_then(|m| m.header().error())
            .map(Error::Remote);
        if let Some(e) = &failure {
            warn!("request {} without waiter failed: {}", slot.id, e);
        }
        if inner.last_nowait == Some(slot_id) {
            inner.last_nowait = None;
            inner.nowait_error = failure;
        }
        inner.pool.release(slot_id);
    }

    fn handle_readable(&self) {
        let mut inner = self.lock();
        while inner.state == ProxyState::Connected {
            let mut partial = mem::take(&mut inner.partial);
            match self.recv_message(&mut inner, &mut partial) {
                Ok(Progress::Complete) => {}
                Ok(Progress::Blocked) => {
                    inner.partial = partial;
                    break;
                }
                Err(e) => {
                    if let Some(BodyRecv {
                        dest: Dest::Reply(Some(slot_id)),
                        ..
                    }) = &partial.body
                    {
                        inner.pool.get_mut(*slot_id).fail(SlotError::from_error(&e));
                    }
                    // Closes any descriptors that came with the broken message.
                    drop(partial);
                    self.fail_connection(&mut inner, &e);
                }
            }
        }
    }

    fn handle_writable(&self) {
        let mut inner = self.lock();
        if inner.state != ProxyState::Connected {
            return;
        }
        while let Some(&slot_id) = inner.outgoing.front() {
            match self.write_slot(&mut inner, slot_id) {
                Ok(true) => {
                    inner.outgoing.pop_front();
                    self.transmitted(&mut inner, slot_id);
                }
                Ok(false) => break,
                Err(e) => {
                    self.fail_connection(&mut inner, &e);
                    return;
                }
            }
        }
        if inner.outgoing.is_empty() {
            self.set_write_interest(&mut inner, false);
        }
        if inner.batch.is_some() && inner.outgoing.len() < self.config.out_low_watermark {
            if let Err(e) = self.flush_batch(&mut inner) {
                error!("failed to flush coalesced writes: {}", e);
            }
        }
    }

    fn post_region_write(&self, msg: Message, region: u32, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != ProxyState::Connected {
            return Err(Error::Disconnected);
        }
        if batch::eligible(
            data.len(),
            inner.posted_writes_disabled,
            inner.caps.write_multiple,
        ) && (inner.batch.is_some() || inner.outgoing.len() > self.config.out_high_watermark)
        {
            let batch = inner.batch.get_or_insert_with(WriteBatch::new);
            batch.push(region, offset, data);
            if batch.len() >= self.config.max_batch_entries {
                self.flush_batch(&mut inner)?;
            }
            return Ok(());
        }
        drop(inner);
        self.send_async(msg, FdBundle::new())
    }

    fn dispatch_requests(&self) {
        let work: Vec<(SlotId, IncomingRequest)> = {
            let mut inner = self.lock();
            inner.dispatch_scheduled = false;
            let slots: Vec<SlotId> = inner.incoming.drain(..).collect();
            slots
                .into_iter()
                .filter_map(|slot_id| {
                    let msg = inner.pool.get_mut(slot_id).msg.take();
                    if msg.is_none() {
                        inner.pool.release(slot_id);
                    }
                    msg.map(|msg| (slot_id, IncomingRequest { msg }))
                })
                .collect()
        };
        if work.is_empty() {
            return;
        }

        let handler = self.handler.lock().expect("handler slot poisoned").clone();
        let global = self.global_lock();
        {
            let _guard = global.as_deref().map(|lock| lock.lock());
            for (_, request) in &work {
                self.handle_request(handler.as_deref(), request);
            }
        }

        let mut inner = self.lock();
        for (slot_id, _) in work {
            inner.pool.release(slot_id);
        }
    }

    fn handle_request(&self, handler: Option<&dyn RequestHandler>, request: &IncomingRequest) {
        let hdr = request.header();
        let responder = Responder {
            shared: self,
            request: hdr,
            replied: Cell::new(false),
        };
        let result = match handler {
            Some(handler) => handler.handle(request, &responder),
            None => Err(anyhow::anyhow!("no request handler registered")),
        };
        if let Err(e) = result {
            warn!("failed to handle request {} (command {}): {:#}", hdr.id, hdr.command, e);
            if !responder.replied() {
                if let Err(e) = responder.send_error_reply(errno_of(&e)) {
                    warn!("failed to send error reply: {}", e);
                }
            }
        }
    }

    /// Fails every queued slot during teardown.
    fn drain_all(&self, inner: &mut Inner) {
        inner.partial = PartialRecv::default();
        inner.batch = None;
        let slots: Vec<SlotId> = inner
            .outgoing
            .drain(..)
            .chain(inner.pending.drain(..))
            .chain(inner.incoming.drain(..))
            .collect();
        for slot_id in slots {
            self.abort_slot(inner, slot_id, SlotError::Disconnected);
        }
        inner.last_nowait = None;
    }
}

fn run_io(shared: Arc<Shared>, stop: Event) {
    if let Err(e) = shared
        .poll
        .add_for_event(stop.as_fd(), EventType::Read, Token::Stop)
    {
        error!("failed to watch the stop event: {}", e);
        return;
    }
    loop {
        let events = match shared.poll.wait() {
            Ok(events) => events,
            Err(e) => {
                error!("failed to wait for socket events: {}", e);
                return;
            }
        };
        let mut readable = false;
        let mut writable = false;
        for event in &events {
            match event.token {
                Token::Stop => return,
                Token::Socket => {
                    readable |= event.is_readable || event.is_hungup;
                    writable |= event.is_writable;
                }
                Token::Dispatch => {}
            }
        }
        if writable {
            shared.handle_writable();
        }
        if readable {
            shared.handle_readable();
        }
    }
}

fn run_dispatcher(shared: Arc<Shared>, stop: Event) {
    let ctx = match EventContext::build_with(&[
        (stop.as_fd(), EventType::Read, Token::Stop),
        (shared.dispatch_evt.as_fd(), EventType::Read, Token::Dispatch),
    ]) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to set up request dispatch: {}", e);
            return;
        }
    };
    loop {
        let events = match ctx.wait() {
            Ok(events) => events,
            Err(e) => {
                error!("failed to wait for requests: {}", e);
                return;
            }
        };
        if events.iter().any(|e| e.token == Token::Stop) {
            return;
        }
        if events.iter().any(|e| e.token == Token::Dispatch) {
            if let Err(e) = shared.dispatch_evt.reset() {
                error!("failed to reset the dispatch event: {}", e);
            }
            shared.dispatch_requests();
        }
    }
}

struct Workers {
    io: WorkerThread<()>,
    dispatcher: WorkerThread<()>,
}

/// A connection to a vfio-user server.
///
/// Methods take `&self` and may be called from any number of threads. Dropping the proxy
/// disconnects it.
pub struct Proxy {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl Proxy {
    /// Connects to the server listening on `path` and negotiates capabilities.
    pub fn connect<P: AsRef<Path>>(path: P, config: ProxyConfig) -> Result<Proxy> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| Error::SocketConnect {
            path: path.display().to_string(),
            source,
        })?;
        Proxy::from_stream(stream, config)
    }

    /// Takes over an already connected socket and negotiates capabilities.
    pub fn from_stream(stream: UnixStream, config: ProxyConfig) -> Result<Proxy> {
        let proxy = Proxy::start(stream, config)?;
        match caps::negotiate(&proxy, &proxy.shared.config) {
            Ok(caps) => {
                proxy.shared.lock().caps = caps;
                debug!("vfio-user connection established");
                Ok(proxy)
            }
            Err(e) => {
                error!("vfio-user negotiation failed: {}", e);
                proxy.disconnect();
                Err(e)
            }
        }
    }

    /// Starts the worker threads on `stream` without negotiating. Until capabilities are set the
    /// protocol defaults apply.
    pub(crate) fn start(stream: UnixStream, config: ProxyConfig) -> Result<Proxy> {
        config.validate()?;
        stream.set_nonblocking(true).map_err(Error::SocketError)?;
        let poll = EventContext::build_with(&[(stream.as_fd(), EventType::Read, Token::Socket)])
            .map_err(Error::EventSetup)?;
        let dispatch_evt = Event::new().map_err(Error::EventSetup)?;

        let shared = Arc::new(Shared {
            sock: stream,
            config,
            inner: Mutex::new(Inner {
                state: ProxyState::Connected,
                pool: SlotPool::new(),
                outgoing: VecDeque::new(),
                pending: VecDeque::new(),
                incoming: VecDeque::new(),
                caps: Capabilities::default(),
                last_nowait: None,
                nowait_error: None,
                partial: PartialRecv::default(),
                batch: None,
                posted_writes_disabled: false,
                abandoned: VecDeque::new(),
                write_interest: false,
                socket_registered: true,
                dispatch_scheduled: false,
                waiters: 0,
            }),
            close_cond: Condvar::new(),
            poll,
            dispatch_evt,
            next_id: AtomicU16::new(0),
            timeouts: AtomicU64::new(0),
            handler: Mutex::new(None),
            global_lock: Mutex::new(None),
        });

        let io_shared = shared.clone();
        let io = WorkerThread::start("v_user_io", move |stop| run_io(io_shared, stop))
            .map_err(Error::EventSetup)?;
        let dispatch_shared = shared.clone();
        let dispatcher = WorkerThread::start("v_user_dispatch", move |stop| {
            run_dispatcher(dispatch_shared, stop)
        })
        .map_err(Error::EventSetup)?;

        Ok(Proxy {
            shared,
            workers: Mutex::new(Some(Workers { io, dispatcher })),
        })
    }

    /// Sends a reply or a NO_REPLY request without waiting for anything. Requests get the next
    /// id; replies keep the id of the request they answer.
    pub fn send_async(&self, msg: Message, fds: FdBundle) -> Result<()> {
        self.shared.send_async(msg, fds)
    }

    /// Sends a request whose reply is checked later by [`Proxy::wait_pending`], or only logged.
    pub fn send_nowait(&self, msg: Message, fds: FdBundle, reply_capacity: usize) -> Result<()> {
        self.shared.send_nowait(msg, fds, reply_capacity)
    }

    /// Sends a request and blocks until its reply arrives or the reply timeout passes.
    ///
    /// `reply_capacity` bounds the size of the reply, header included, and `fds` declares how
    /// many descriptors the reply may carry. With `allow_lock_drop`, the global lock is released
    /// while blocked if the calling thread holds it.
    pub fn send_wait(
        &self,
        msg: Message,
        fds: FdBundle,
        reply_capacity: usize,
        allow_lock_drop: bool,
    ) -> Result<Reply> {
        self.shared
            .send_wait(msg, fds, reply_capacity, allow_lock_drop)
    }

    /// Waits for the reply to the most recent nowait request, if it is still outstanding, and
    /// returns its error if it failed.
    pub fn wait_pending(&self) -> Result<()> {
        self.shared.wait_pending()
    }

    /// Sends a posted region write, coalescing it with others while the socket is backed up.
    /// `msg` is the stand-alone REGION_WRITE form used when the write is not coalesced.
    pub(crate) fn post_region_write(
        &self,
        msg: Message,
        region: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.shared.post_region_write(msg, region, offset, data)
    }

    pub fn set_request_handler<H: RequestHandler + 'static>(&self, handler: H) {
        *self.shared.handler.lock().expect("handler slot poisoned") = Some(Arc::new(handler));
    }

    pub fn set_global_lock(&self, lock: Arc<GlobalLock>) {
        *self
            .shared
            .global_lock
            .lock()
            .expect("global lock slot poisoned") = Some(lock);
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.lock().caps
    }

    pub fn state(&self) -> ProxyState {
        self.shared.lock().state
    }

    /// Stops coalescing and posting writes, e.g. once a region is mapped directly and ordering
    /// against guest accesses matters.
    pub fn disable_posted_writes(&self) {
        self.shared.lock().posted_writes_disabled = true;
    }

    pub fn posted_writes_disabled(&self) -> bool {
        self.shared.lock().posted_writes_disabled
    }

    /// Number of synchronous calls that timed out.
    pub fn timeouts(&self) -> u64 {
        self.shared.timeouts.load(Ordering::Relaxed)
    }

    /// Number of message slots in use.
    pub fn slots_in_use(&self) -> usize {
        self.shared.lock().pool.in_use()
    }

    /// Closes the connection. Every waiter is woken with [`Error::Disconnected`] and every queued
    /// message is dropped. Returns once the worker threads have exited.
    pub fn disconnect(&self) {
        {
            let mut inner = self.shared.lock();
            match inner.state {
                ProxyState::Closed => return,
                ProxyState::Closing => {
                    while inner.state != ProxyState::Closed {
                        inner = self
                            .shared
                            .close_cond
                            .wait(inner)
                            .expect("proxy lock poisoned");
                    }
                    return;
                }
                ProxyState::Connected | ProxyState::Error => inner.state = ProxyState::Closing,
            }
        }
        debug!("disconnecting vfio-user proxy");
        let _ = self.shared.sock.shutdown(Shutdown::Read);

        let workers = self.workers.lock().expect("workers poisoned").take();
        if let Some(Workers {
            mut io,
            mut dispatcher,
        }) = workers
        {
            io.stop();

            // Wake waiters before stopping the dispatcher, whose handler may be one of them.
            {
                let mut inner = self.shared.lock();
                self.shared.drain_all(&mut inner);
            }

            if dispatcher.is_current() {
                // Called from a request handler: the dispatcher exits once the handler returns.
                dispatcher.detach();
            } else {
                let global = self.shared.global_lock();
                let relock = global.as_deref().and_then(|lock| lock.unlock_temporarily());
                dispatcher.stop();
                drop(relock);
            }
        }

        let mut inner = self.shared.lock();
        self.shared.drain_all(&mut inner);
        while inner.waiters > 0 {
            inner = self
                .shared
                .close_cond
                .wait(inner)
                .expect("proxy lock poisoned");
        }
        inner.state = ProxyState::Closed;
        self.shared.close_cond.notify_all();
        debug!("vfio-user proxy closed");
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::io::Write;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    use zerocopy::IntoBytes;

    use super::*;
    use crate::message::Command;
    use crate::message::DmaAccess;
    use crate::message::HeaderFlags;
    use crate::message::RegionAccess;

    fn config() -> ProxyConfig {
        ProxyConfig {
            reply_timeout_ms: 2000,
            ..Default::default()
        }
    }

    fn read_msg(sock: &mut UnixStream) -> Message {
        let mut hdr = [0u8; HEADER_SIZE];
        sock.read_exact(&mut hdr).unwrap();
        let size = Header::read_from_bytes(&hdr[..]).unwrap().size as usize;
        let mut buf = hdr.to_vec();
        buf.resize(size, 0);
        sock.read_exact(&mut buf[HEADER_SIZE..]).unwrap();
        Message::from_bytes(buf, usize::MAX).unwrap()
    }

    fn reply(req: &Message, body: &[u8]) -> Vec<u8> {
        Message::new(Header::reply_to(&req.header(), 0), &[body])
            .unwrap()
            .into_bytes()
    }

    fn reset_request() -> Message {
        Message::new(
            Header::request(0, Command::DeviceReset, HeaderFlags::empty()),
            &[],
        )
        .unwrap()
    }

    #[test]
    fn send_mode_checks() {
        let (client, _server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();
        assert!(matches!(
            proxy.send_async(reset_request(), FdBundle::new()),
            Err(Error::InvalidParam(_))
        ));

        let no_reply = Message::new(
            Header::request(0, Command::RegionWrite, HeaderFlags::NO_REPLY),
            &[],
        )
        .unwrap();
        assert!(matches!(
            proxy.send_nowait(no_reply.clone(), FdBundle::new(), 64),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            proxy.send_wait(no_reply, FdBundle::new(), 64, false),
            Err(Error::InvalidParam(_))
        ));
        assert_eq!(proxy.slots_in_use(), 0);
    }

    #[test]
    fn wait_for_reply() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();

        let server_thread = thread::spawn(move || {
            let req = read_msg(&mut server);
            assert_eq!(req.header().get_command(), Some(Command::DeviceReset));
            server.write_all(&reply(&req, &[])).unwrap();
            server
        });

        let reply = proxy
            .send_wait(reset_request(), FdBundle::new(), 64, false)
            .unwrap();
        assert!(reply.header().is_reply());
        assert_eq!(proxy.slots_in_use(), 0);
        let _server = server_thread.join().unwrap();
    }

    #[test]
    fn remote_error_keeps_connection() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();

        let server_thread = thread::spawn(move || {
            let req = read_msg(&mut server);
            let err = Message::new(Header::reply_to(&req.header(), libc::EBUSY as u32), &[])
                .unwrap();
            server.write_all(err.as_bytes()).unwrap();
            let req = read_msg(&mut server);
            server.write_all(&reply(&req, &[])).unwrap();
            server
        });

        assert!(matches!(
            proxy.send_wait(reset_request(), FdBundle::new(), 64, false),
            Err(Error::Remote(e)) if e == libc::EBUSY as u32
        ));
        assert_eq!(proxy.state(), ProxyState::Connected);
        proxy
            .send_wait(reset_request(), FdBundle::new(), 64, false)
            .unwrap();
        let _server = server_thread.join().unwrap();
    }

    #[test]
    fn timeout_then_late_reply() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(
            client,
            ProxyConfig {
                reply_timeout_ms: 100,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(
            proxy.send_wait(reset_request(), FdBundle::new(), 64, false),
            Err(Error::Timeout)
        ));
        assert_eq!(proxy.timeouts(), 1);
        assert_eq!(proxy.slots_in_use(), 0);

        // The late reply is dropped and the connection keeps working.
        let late = read_msg(&mut server);
        server.write_all(&reply(&late, &[])).unwrap();
        let server_thread = thread::spawn(move || {
            let req = read_msg(&mut server);
            server.write_all(&reply(&req, &[])).unwrap();
            server
        });
        proxy
            .send_wait(reset_request(), FdBundle::new(), 64, false)
            .unwrap();
        assert_eq!(proxy.state(), ProxyState::Connected);
        let _server = server_thread.join().unwrap();
    }

    #[test]
    fn timeout_during_reply_forgets_id() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(
            client,
            ProxyConfig {
                reply_timeout_ms: 500,
                ..Default::default()
            },
        )
        .unwrap();

        let (tx, rx) = channel();
        let server_thread = thread::spawn(move || {
            let req = read_msg(&mut server);
            let answer = reply(&req, &[0u8; 8]);
            // Header and part of the body, then the rest once the caller gave up.
            server.write_all(&answer[..HEADER_SIZE + 4]).unwrap();
            rx.recv().unwrap();
            server.write_all(&answer[HEADER_SIZE + 4..]).unwrap();
            // A second reply to the same request has nothing to match.
            server.write_all(&answer).unwrap();
            server
        });

        // The timeout leaves the I/O thread ample time to take the header.
        let result = proxy.send_wait(reset_request(), FdBundle::new(), 64, false);
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(proxy.shared.lock().abandoned.is_empty());
        assert_eq!(proxy.slots_in_use(), 0);
        tx.send(()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while proxy.state() == ProxyState::Connected {
            assert!(Instant::now() < deadline, "stray reply was not detected");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(proxy.state(), ProxyState::Error);
        let _server = server_thread.join().unwrap();
    }

    #[test]
    fn unknown_reply_is_fatal() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();
        let bogus = Message::new(
            Header::reply_to(
                &Header::request(0x4242, Command::DeviceReset, HeaderFlags::empty()),
                0,
            ),
            &[],
        )
        .unwrap();
        server.write_all(bogus.as_bytes()).unwrap();

        for _ in 0..200 {
            if proxy.state() == ProxyState::Error {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(proxy.state(), ProxyState::Error);
        assert!(matches!(
            proxy.send_wait(reset_request(), FdBundle::new(), 64, false),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn eof_fails_waiter() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();
        let server_thread = thread::spawn(move || {
            read_msg(&mut server);
            drop(server);
        });
        assert!(matches!(
            proxy.send_wait(reset_request(), FdBundle::new(), 64, false),
            Err(Error::Disconnected)
        ));
        server_thread.join().unwrap();
        assert_eq!(proxy.state(), ProxyState::Error);
        assert_eq!(proxy.slots_in_use(), 0);
    }

    #[test]
    fn reply_too_large() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();
        proxy
            .send_nowait(reset_request(), FdBundle::new(), 64)
            .unwrap();
        let server_thread = thread::spawn(move || {
            let pending = read_msg(&mut server);
            let req = read_msg(&mut server);
            server.write_all(&reply(&req, &[0u8; 64])).unwrap();
            (server, pending)
        });
        assert!(matches!(
            proxy.send_wait(reset_request(), FdBundle::new(), 32, false),
            Err(Error::ReplyTooLarge {
                capacity: 32,
                size: 80
            })
        ));
        // Framing is lost, so the whole connection fails and the other request with it.
        assert_eq!(proxy.state(), ProxyState::Error);
        assert!(matches!(proxy.wait_pending(), Err(Error::Disconnected)));
        assert!(matches!(
            proxy.send_wait(reset_request(), FdBundle::new(), 64, false),
            Err(Error::Disconnected)
        ));
        assert_eq!(proxy.slots_in_use(), 0);
        let _server = server_thread.join().unwrap();
    }

    #[test]
    fn nowait_then_wait_pending() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();

        proxy
            .send_nowait(reset_request(), FdBundle::new(), 64)
            .unwrap();
        let req = read_msg(&mut server);
        let (tx, rx) = channel();
        let server_thread = thread::spawn(move || {
            rx.recv().unwrap();
            let err = Message::new(Header::reply_to(&req.header(), libc::EIO as u32), &[])
                .unwrap();
            server.write_all(err.as_bytes()).unwrap();
            server
        });
        tx.send(()).unwrap();
        assert!(matches!(proxy.wait_pending(), Err(Error::Remote(_))));
        assert_eq!(proxy.slots_in_use(), 0);
        // Nothing outstanding any more.
        proxy.wait_pending().unwrap();
        let _server = server_thread.join().unwrap();
    }

    #[test]
    fn nowait_error_reported_after_completion() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();

        proxy
            .send_nowait(reset_request(), FdBundle::new(), 64)
            .unwrap();
        let req = read_msg(&mut server);
        let err = Message::new(Header::reply_to(&req.header(), libc::EIO as u32), &[]).unwrap();
        server.write_all(err.as_bytes()).unwrap();

        for _ in 0..200 {
            if proxy.slots_in_use() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(proxy.slots_in_use(), 0);
        assert!(matches!(
            proxy.wait_pending(),
            Err(Error::Remote(e)) if e == libc::EIO as u32
        ));
    }

    #[test]
    fn server_request_dispatch() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();
        let global = Arc::new(GlobalLock::new());
        proxy.set_global_lock(global.clone());
        let handler_lock = global.clone();
        proxy.set_request_handler(
            move |request: &IncomingRequest, responder: &Responder<'_>| -> anyhow::Result<()> {
                assert!(handler_lock.held_by_current_thread());
                match request.parse()? {
                    ServerRequest::DmaRead { offset, count } => {
                        let access = DmaAccess {
                            offset,
                            count,
                            padding: 0,
                        };
                        let data = vec![0xabu8; count as usize];
                        responder.send_reply(&[access.as_bytes(), &data])?;
                        Ok(())
                    }
                    _ => anyhow::bail!("unexpected request"),
                }
            },
        );

        let access = DmaAccess {
            offset: 0x1000,
            count: 4,
            padding: 0,
        };
        let req = Message::new(
            Header::request(77, Command::DmaRead, HeaderFlags::empty()),
            &[access.as_bytes()],
        )
        .unwrap();
        server.write_all(req.as_bytes()).unwrap();
        let answer = read_msg(&mut server);
        assert!(answer.header().is_reply_for(&req.header()));
        assert_eq!(answer.header().error(), None);
        assert_eq!(&answer.payload()[16..], &[0xab; 4]);

        // Unsupported request gets an error reply.
        let req = Message::new(
            Header::request(78, Command::DeviceReset, HeaderFlags::empty()),
            &[],
        )
        .unwrap();
        server.write_all(req.as_bytes()).unwrap();
        let answer = read_msg(&mut server);
        assert_eq!(answer.header().id, 78);
        assert_eq!(answer.header().error(), Some(libc::EINVAL as u32));
    }

    #[test]
    fn posted_write_is_async() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let proxy = Proxy::start(client, config()).unwrap();
        let access = RegionAccess {
            offset: 8,
            region: 1,
            count: 4,
        };
        let msg = Message::new(
            Header::request(0, Command::RegionWrite, HeaderFlags::NO_REPLY),
            &[access.as_bytes(), &[1, 2, 3, 4]],
        )
        .unwrap();
        proxy.post_region_write(msg, 1, 8, &[1, 2, 3, 4]).unwrap();
        let sent = read_msg(&mut server);
        assert!(sent.header().no_reply());
        assert_eq!(sent.header().get_command(), Some(Command::RegionWrite));
        assert_eq!(proxy.slots_in_use(), 0);
    }

    #[test]
    fn disconnect_wakes_waiter() {
        let (client, _server) = UnixStream::pair().unwrap();
        let proxy = Arc::new(Proxy::start(client, config()).unwrap());
        let waiter = proxy.clone();
        let handle =
            thread::spawn(move || waiter.send_wait(reset_request(), FdBundle::new(), 64, false));
        while proxy.slots_in_use() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        proxy.disconnect();
        assert!(matches!(handle.join().unwrap(), Err(Error::Disconnected)));
        assert_eq!(proxy.state(), ProxyState::Closed);
        assert_eq!(proxy.slots_in_use(), 0);
        // Idempotent.
        proxy.disconnect();
    }
}
