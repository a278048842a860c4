// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tunables of a vfio-user connection.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::caps;
use crate::Error;
use crate::Result;

/// Parameters of a [`Proxy`](crate::Proxy) connection.
///
/// The capability fields are what the client proposes during negotiation; the values in effect
/// are the lesser of these and what the server accepts.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct ProxyConfig {
    /// How long a synchronous call waits for its reply.
    pub reply_timeout_ms: u64,
    /// Outgoing backlog above which posted writes start to be coalesced.
    pub out_high_watermark: usize,
    /// Outgoing backlog below which a pending batch is flushed.
    pub out_low_watermark: usize,
    /// Entries after which a batch is sent regardless of the backlog.
    pub max_batch_entries: usize,
    pub max_fds: u32,
    pub max_xfer_size: u32,
    /// Bitmask of supported DMA page sizes.
    pub pgsizes: u64,
    pub max_dma_maps: u32,
    pub max_bitmap_size: u64,
    pub write_multiple: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            reply_timeout_ms: 5000,
            out_high_watermark: 1024,
            out_low_watermark: 128,
            max_batch_entries: 200,
            max_fds: caps::DEFAULT_MAX_FDS,
            max_xfer_size: caps::DEFAULT_MAX_XFER_SIZE,
            pgsizes: caps::DEFAULT_PGSIZE,
            max_dma_maps: caps::DEFAULT_MAX_DMA_MAPS,
            max_bitmap_size: caps::DEFAULT_MAX_BITMAP_SIZE,
            write_multiple: true,
        }
    }
}

impl ProxyConfig {
    /// Parses a JSON configuration. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<ProxyConfig> {
        let config: ProxyConfig = serde_json::from_str(json).map_err(Error::Config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reply_timeout_ms == 0 {
            return Err(Error::InvalidParam("reply-timeout-ms must be nonzero"));
        }
        if self.out_low_watermark >= self.out_high_watermark {
            return Err(Error::InvalidParam(
                "out-low-watermark must be below out-high-watermark",
            ));
        }
        if self.max_batch_entries == 0 {
            return Err(Error::InvalidParam("max-batch-entries must be nonzero"));
        }
        if self.max_fds == 0 || self.max_xfer_size == 0 || self.max_dma_maps == 0 {
            return Err(Error::InvalidParam("capability limits must be nonzero"));
        }
        if self.pgsizes == 0 || self.max_bitmap_size == 0 {
            return Err(Error::InvalidParam("capability limits must be nonzero"));
        }
        Ok(())
    }
}
