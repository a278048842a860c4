// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Version and capability negotiation.
//!
//! The first message on a connection is VFIO_USER_VERSION. Its body carries the protocol version
//! followed by a NUL-terminated JSON document:
//!
//! ```json
//! {"capabilities": {"max_msg_fds": 8, "max_data_xfer_size": 1048576, "pgsizes": 4096,
//!   "max_dma_maps": 65535, "migration": {"pgsize": 4096, "max_bitmap_size": 268435456},
//!   "write_multiple": true}}
//! ```
//!
//! The server answers with the same structure. Every value in effect afterwards is the smaller of
//! what was proposed and what was accepted; keys the server leaves out take the protocol default.

use log::debug;
use log::warn;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use zerocopy::IntoBytes;

use crate::config::ProxyConfig;
use crate::message::body_prefix;
use crate::message::max_message_size;
use crate::message::Command;
use crate::message::Header;
use crate::message::HeaderFlags;
use crate::message::Message;
use crate::message::VersionBody;
use crate::message::VFIO_USER_MAJOR_VER;
use crate::message::VFIO_USER_MINOR_VER;
use crate::proxy::Proxy;
use crate::scm::FdBundle;
use crate::Error;
use crate::Result;

pub const DEFAULT_MAX_FDS: u32 = 8;
pub const MAX_MAX_FDS: u32 = 16;
pub const DEFAULT_MAX_XFER_SIZE: u32 = 1024 * 1024;
pub const MAX_MAX_XFER_SIZE: u32 = 64 * 1024 * 1024;
pub const DEFAULT_PGSIZE: u64 = 4096;
pub const DEFAULT_MAX_DMA_MAPS: u32 = 65535;
pub const MAX_MAX_DMA_MAPS: u32 = 65535;
pub const DEFAULT_MAX_BITMAP_SIZE: u64 = 256 * 1024 * 1024;
pub const MAX_MAX_BITMAP_SIZE: u64 = 256 * 1024 * 1024;

/// Limits of the dirty page tracking calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MigrationCaps {
    pub pgsize: u64,
    pub max_bitmap_size: u64,
}

/// Limits in effect on a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// File descriptors per message.
    pub max_fds: u32,
    /// Data bytes per message.
    pub max_xfer_size: u32,
    /// Bitmask of supported DMA page sizes.
    pub pgsizes: u64,
    pub max_dma_maps: u32,
    pub migration: MigrationCaps,
    /// Whether the peer accepts REGION_WRITE_MULTI.
    pub write_multiple: bool,
}

impl Default for Capabilities {
    /// The limits that apply before negotiation, and for keys a peer leaves out.
    fn default() -> Self {
        Capabilities {
            max_fds: DEFAULT_MAX_FDS,
            max_xfer_size: DEFAULT_MAX_XFER_SIZE,
            pgsizes: DEFAULT_PGSIZE,
            max_dma_maps: DEFAULT_MAX_DMA_MAPS,
            migration: MigrationCaps {
                pgsize: DEFAULT_PGSIZE,
                max_bitmap_size: DEFAULT_MAX_BITMAP_SIZE,
            },
            write_multiple: false,
        }
    }
}

impl Capabilities {
    /// What the client proposes for `config`, bounded by the protocol ceilings.
    pub fn proposal(config: &ProxyConfig) -> Capabilities {
        Capabilities {
            max_fds: config.max_fds.min(MAX_MAX_FDS),
            max_xfer_size: config.max_xfer_size.min(MAX_MAX_XFER_SIZE),
            pgsizes: config.pgsizes,
            max_dma_maps: config.max_dma_maps.min(MAX_MAX_DMA_MAPS),
            migration: MigrationCaps {
                pgsize: lowest_pgsize(config.pgsizes),
                max_bitmap_size: config.max_bitmap_size.min(MAX_MAX_BITMAP_SIZE),
            },
            write_multiple: config.write_multiple,
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "capabilities": {
                "max_msg_fds": self.max_fds,
                "max_data_xfer_size": self.max_xfer_size,
                "pgsizes": self.pgsizes,
                "max_dma_maps": self.max_dma_maps,
                "migration": {
                    "pgsize": self.migration.pgsize,
                    "max_bitmap_size": self.migration.max_bitmap_size,
                },
                "write_multiple": self.write_multiple,
            }
        })
    }
}

fn lowest_pgsize(pgsizes: u64) -> u64 {
    if pgsizes == 0 {
        0
    } else {
        1 << pgsizes.trailing_zeros()
    }
}

/// Body of the VERSION request proposing `caps`.
pub fn version_payload(caps: &Capabilities) -> Result<Vec<u8>> {
    let version = VersionBody {
        major: VFIO_USER_MAJOR_VER,
        minor: VFIO_USER_MINOR_VER,
    };
    let doc = serde_json::to_string(&caps.to_json())
        .map_err(|e| Error::Capability(e.to_string()))?;
    let mut payload = version.as_bytes().to_vec();
    payload.extend_from_slice(doc.as_bytes());
    payload.push(0);
    Ok(payload)
}

type Checker = fn(&Capabilities, &mut Capabilities, &Value) -> Result<()>;

const CAP_CHECKERS: &[(&str, Checker)] = &[
    ("max_msg_fds", check_max_fds),
    ("max_data_xfer_size", check_max_xfer),
    ("pgsizes", check_pgsizes),
    ("max_dma_maps", check_max_dma_maps),
    ("migration", check_migration),
    ("write_multiple", check_write_multiple),
];

const MIGRATION_CHECKERS: &[(&str, Checker)] = &[
    ("pgsize", check_migration_pgsize),
    ("max_bitmap_size", check_max_bitmap),
];

fn cap_err(what: &str) -> Error {
    Error::Capability(what.to_string())
}

fn positive(value: &Value, name: &str) -> Result<u64> {
    match value.as_u64() {
        Some(0) => Err(cap_err(&format!("{} is zero", name))),
        Some(v) => Ok(v),
        None => Err(cap_err(&format!("{} is not an unsigned integer", name))),
    }
}

fn positive_u32(value: &Value, name: &str) -> Result<u32> {
    let v = positive(value, name)?;
    u32::try_from(v).map_err(|_| cap_err(&format!("{} out of range", name)))
}

fn check_max_fds(proposed: &Capabilities, caps: &mut Capabilities, value: &Value) -> Result<()> {
    let accepted = positive_u32(value, "max_msg_fds")?;
    caps.max_fds = proposed.max_fds.min(accepted).min(MAX_MAX_FDS);
    Ok(())
}

fn check_max_xfer(proposed: &Capabilities, caps: &mut Capabilities, value: &Value) -> Result<()> {
    let accepted = positive_u32(value, "max_data_xfer_size")?;
    caps.max_xfer_size = proposed.max_xfer_size.min(accepted).min(MAX_MAX_XFER_SIZE);
    Ok(())
}

fn check_pgsizes(proposed: &Capabilities, caps: &mut Capabilities, value: &Value) -> Result<()> {
    let accepted = positive(value, "pgsizes")?;
    let common = proposed.pgsizes & accepted;
    if common == 0 {
        return Err(cap_err("no page size in common"));
    }
    caps.pgsizes = common;
    Ok(())
}

fn check_max_dma_maps(
    proposed: &Capabilities,
    caps: &mut Capabilities,
    value: &Value,
) -> Result<()> {
    let accepted = positive_u32(value, "max_dma_maps")?;
    caps.max_dma_maps = proposed.max_dma_maps.min(accepted).min(MAX_MAX_DMA_MAPS);
    Ok(())
}

fn check_write_multiple(
    proposed: &Capabilities,
    caps: &mut Capabilities,
    value: &Value,
) -> Result<()> {
    let accepted = value
        .as_bool()
        .ok_or_else(|| cap_err("write_multiple is not a boolean"))?;
    caps.write_multiple = proposed.write_multiple && accepted;
    Ok(())
}

fn check_migration(proposed: &Capabilities, caps: &mut Capabilities, value: &Value) -> Result<()> {
    let map = value
        .as_object()
        .ok_or_else(|| cap_err("migration is not an object"))?;
    run_checkers(MIGRATION_CHECKERS, proposed, caps, map)
}

fn check_migration_pgsize(
    _proposed: &Capabilities,
    caps: &mut Capabilities,
    value: &Value,
) -> Result<()> {
    let pgsize = positive(value, "migration pgsize")?;
    if !pgsize.is_power_of_two() {
        return Err(cap_err("migration pgsize is not a power of two"));
    }
    caps.migration.pgsize = pgsize;
    Ok(())
}

fn check_max_bitmap(proposed: &Capabilities, caps: &mut Capabilities, value: &Value) -> Result<()> {
    let accepted = positive(value, "max_bitmap_size")?;
    caps.migration.max_bitmap_size = proposed
        .migration
        .max_bitmap_size
        .min(accepted)
        .min(MAX_MAX_BITMAP_SIZE);
    Ok(())
}

fn run_checkers(
    checkers: &[(&str, Checker)],
    proposed: &Capabilities,
    caps: &mut Capabilities,
    map: &Map<String, Value>,
) -> Result<()> {
    for (key, value) in map {
        match checkers.iter().find(|(name, _)| name == key) {
            Some((_, check)) => check(proposed, caps, value)?,
            None => warn!("ignoring spurious capability {}", key),
        }
    }
    Ok(())
}

/// Checks the server's VERSION reply body and computes the capabilities in effect.
pub fn parse_version_reply(proposed: &Capabilities, payload: &[u8]) -> Result<Capabilities> {
    let (version, doc) = body_prefix::<VersionBody>(payload)
        .map_err(|_| Error::InvalidReply("version reply too short"))?;
    if version.major != VFIO_USER_MAJOR_VER || version.minor > VFIO_USER_MINOR_VER {
        return Err(Error::Version {
            major: version.major,
            minor: version.minor,
        });
    }

    let defaults = Capabilities::default();
    let mut caps = Capabilities {
        max_fds: proposed.max_fds.min(defaults.max_fds),
        max_xfer_size: proposed.max_xfer_size.min(defaults.max_xfer_size),
        pgsizes: proposed.pgsizes & defaults.pgsizes,
        max_dma_maps: proposed.max_dma_maps.min(defaults.max_dma_maps),
        migration: MigrationCaps {
            // Filled in below unless the server names one.
            pgsize: 0,
            max_bitmap_size: proposed
                .migration
                .max_bitmap_size
                .min(defaults.migration.max_bitmap_size),
        },
        write_multiple: false,
    };

    if !doc.is_empty() {
        let doc = match doc.split_last() {
            Some((0, json)) => json,
            _ => return Err(cap_err("capability document is not NUL-terminated")),
        };
        let root: Value =
            serde_json::from_slice(doc).map_err(|e| Error::Capability(e.to_string()))?;
        let root = root
            .as_object()
            .ok_or_else(|| cap_err("capability document is not an object"))?;
        for (key, value) in root {
            if key != "capabilities" {
                warn!("ignoring spurious version field {}", key);
                continue;
            }
            let map = value
                .as_object()
                .ok_or_else(|| cap_err("capabilities is not an object"))?;
            run_checkers(CAP_CHECKERS, proposed, &mut caps, map)?;
        }
    }

    if caps.pgsizes == 0 {
        return Err(cap_err("no page size in common"));
    }
    if caps.migration.pgsize == 0 {
        caps.migration.pgsize = lowest_pgsize(caps.pgsizes);
    }
    if caps.migration.pgsize & caps.pgsizes == 0 {
        return Err(cap_err("migration pgsize is not a supported page size"));
    }
    Ok(caps)
}

/// Runs the version exchange on a freshly started proxy.
pub fn negotiate(proxy: &Proxy, config: &ProxyConfig) -> Result<Capabilities> {
    let proposed = Capabilities::proposal(config);
    let payload = version_payload(&proposed)?;
    let msg = Message::new(
        Header::request(0, Command::Version, HeaderFlags::empty()),
        &[&payload],
    )?;
    let reply = proxy.send_wait(
        msg,
        FdBundle::new(),
        max_message_size(DEFAULT_MAX_XFER_SIZE),
        false,
    )?;
    let caps = parse_version_reply(&proposed, reply.payload())?;
    debug!("negotiated capabilities {:?}", caps);
    Ok(caps)
}
