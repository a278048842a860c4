// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client side of the vfio-user protocol.
//!
//! vfio-user lets a hypervisor hand the emulation of a PCI device to a separate server process.
//! The two ends talk over a UNIX domain stream socket: the client (this crate) issues region
//! accesses, DMA mappings and interrupt configuration, and the server may call back to read or
//! write guest memory and to raise interrupts. File descriptors for shared memory and eventfds
//! travel as ancillary data next to the messages that reference them.
//!
//! A [`Proxy`] owns one connection. It frames and multiplexes messages, matches replies to the
//! callers waiting for them, coalesces posted register writes when the socket backs up, and hands
//! requests from the server to a [`RequestHandler`]. The typed calls in [`client`] build on it.

use std::io::Error as IOError;

use remain::sorted;
use thiserror::Error as ThisError;

pub mod batch;
pub mod caps;
pub mod client;
pub mod config;
pub mod global_lock;
pub mod message;
mod poll;
pub mod proxy;
pub mod scm;
mod slot;
mod worker;

pub use caps::Capabilities;
pub use config::ProxyConfig;
pub use global_lock::GlobalLock;
pub use message::Command;
pub use message::Header;
pub use message::Message;
pub use message::ServerRequest;
pub use proxy::IncomingRequest;
pub use proxy::Proxy;
pub use proxy::ProxyState;
pub use proxy::Reply;
pub use proxy::RequestHandler;
pub use proxy::Responder;

/// Errors for vfio-user operations.
#[sorted]
#[derive(Debug, ThisError)]
pub enum Error {
    /// The capability document was malformed or could not be satisfied.
    #[error("capability negotiation failed: {0}")]
    Capability(String),
    /// The proxy configuration could not be parsed.
    #[error("invalid proxy configuration: {0}")]
    Config(serde_json::Error),
    /// The connection is closing, closed or broken.
    #[error("connection to the server is gone")]
    Disconnected,
    /// Failed to set up the I/O or dispatcher thread.
    #[error("failed to start connection workers: {0}")]
    EventSetup(IOError),
    /// A reply carried more file descriptors than the request allowed for.
    #[error("wrong number of attached fds: expected at most {expected}, got {got}")]
    IncorrectFds { expected: usize, got: usize },
    /// Invalid parameters passed by the caller.
    #[error("invalid parameters: {0}")]
    InvalidParam(&'static str),
    /// A well-framed reply had contents that make no sense for its request.
    #[error("invalid reply: {0}")]
    InvalidReply(&'static str),
    /// Bad framing from the peer.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
    /// Message is too large to be encoded.
    #[error("oversized message")]
    OversizedMsg,
    /// The server answered with an error reply.
    #[error("server returned error {0}")]
    Remote(u32),
    /// A reply was larger than the buffer reserved for it.
    #[error("reply of {size} bytes exceeds the {capacity} bytes reserved for it")]
    ReplyTooLarge { capacity: usize, size: usize },
    /// Failed to connect to the server socket.
    #[error("failed to connect to {path}: {source}")]
    SocketConnect {
        path: String,
        #[source]
        source: IOError,
    },
    /// Generic socket errors.
    #[error("socket error: {0}")]
    SocketError(IOError),
    /// No reply arrived within the configured timeout.
    #[error("timed out waiting for a reply")]
    Timeout,
    /// The server attached file descriptors to a request.
    #[error("unexpected file descriptors on a server request")]
    UnexpectedFds,
    /// A reply arrived for an id with no outstanding request.
    #[error("reply for unknown request id {0}")]
    UnexpectedReply(u16),
    /// The server speaks an incompatible protocol version.
    #[error("incompatible protocol version {major}.{minor}")]
    Version { major: u16, minor: u16 },
}

/// Result of vfio-user operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno that best describes this error, for callers that report failures as errno
    /// values to the guest or to the server.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Remote(errno) => *errno as i32,
            Error::Timeout => libc::ETIMEDOUT,
            Error::Disconnected => libc::ENOTCONN,
            Error::SocketError(e)
            | Error::SocketConnect { source: e, .. }
            | Error::EventSetup(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::OversizedMsg | Error::ReplyTooLarge { .. } => libc::E2BIG,
            Error::InvalidParam(_) => libc::EINVAL,
            _ => libc::EIO,
        }
    }
}
