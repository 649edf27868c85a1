// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service and protocol configuration.
//!
//! The defaults target a 57.6 kbps serial line; presets cover slower links.
//! The ACK wait is linear in the fragment size: a fixed propagation allowance
//! plus the on-wire time of the fragment at the configured rate, padded by a
//! safety factor for stuffing expansion and scheduling jitter.

use std::time::Duration;

/// Default frame payload budget (packet header + data payload).
pub const DEFAULT_MTU: u16 = 256;

/// Default per-channel FIFO depth.
///
/// Must stay at least twice the worst-case in-flight fragments per sequence;
/// stop-and-wait keeps that at one, the margin absorbs scheduling stalls.
pub const DEFAULT_FIFO_DEPTH: usize = 8;

/// Default channel table capacity.
pub const DEFAULT_MAX_CHANNELS: usize = 8;

/// ACK wait budget derived from the link rate.
#[derive(Debug, Clone)]
pub struct AckTimeoutConfig {
    /// Fixed allowance independent of fragment size.
    pub base: Duration,
    /// Link rate in bits per second used for the per-byte cost.
    pub baud: u32,
    /// Multiplier padding the theoretical on-wire time.
    pub safety_factor: u32,
}

impl Default for AckTimeoutConfig {
    fn default() -> Self {
        Self::serial_57600()
    }
}

impl AckTimeoutConfig {
    /// Preset for a 57.6 kbps serial line.
    #[must_use]
    pub fn serial_57600() -> Self {
        Self {
            base: Duration::from_millis(80),
            baud: 57_600,
            safety_factor: 10,
        }
    }

    /// Preset for a 9.6 kbps line.
    #[must_use]
    pub fn serial_9600() -> Self {
        Self {
            base: Duration::from_millis(150),
            baud: 9_600,
            safety_factor: 10,
        }
    }

    /// ACK wait budget for a fragment of `payload_len` bytes.
    #[must_use]
    pub fn for_payload(&self, payload_len: usize) -> Duration {
        let bits = payload_len as u64 * 8 * u64::from(self.safety_factor);
        let micros = bits * 1_000_000 / u64::from(self.baud.max(1));
        self.base + Duration::from_micros(micros)
    }
}

/// Service-wide configuration.
#[derive(Debug, Clone)]
pub struct SdtlConfig {
    /// Frame payload budget shared by all channels (packet header included).
    pub mtu: u16,
    /// Depth of each channel's data and ACK FIFOs.
    pub fifo_depth: usize,
    /// Channel table capacity.
    pub max_channels: usize,
    /// ACK wait budget.
    pub ack_timeout: AckTimeoutConfig,
    /// Per-fragment retry cap; `None` retries until an out-of-band event,
    /// `Some(n)` surfaces a timeout after `n` retries so a disconnected peer
    /// can be detected.
    pub max_retries: Option<u32>,
}

impl Default for SdtlConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            fifo_depth: DEFAULT_FIFO_DEPTH,
            max_channels: DEFAULT_MAX_CHANNELS,
            ack_timeout: AckTimeoutConfig::default(),
            max_retries: None,
        }
    }
}

impl SdtlConfig {
    /// Preset for slow serial links: small frames, patient timeouts.
    #[must_use]
    pub fn slow_serial() -> Self {
        Self {
            mtu: 128,
            ack_timeout: AckTimeoutConfig::serial_9600(),
            ..Default::default()
        }
    }

    /// Preset for in-memory or local testing: generous FIFOs, bounded retries.
    #[must_use]
    pub fn local_test() -> Self {
        Self {
            fifo_depth: 32,
            max_retries: Some(50),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_timeout_base_only_for_empty() {
        let cfg = AckTimeoutConfig::serial_57600();
        assert_eq!(cfg.for_payload(0), Duration::from_millis(80));
    }

    #[test]
    fn test_ack_timeout_linear_in_size() {
        let cfg = AckTimeoutConfig::serial_57600();
        // 56 bytes at 57600 baud with a 10x factor: 56*8*10/57600 s = 77777 us.
        let t = cfg.for_payload(56);
        assert_eq!(t, Duration::from_millis(80) + Duration::from_micros(77_777));

        // Twice the payload adds twice the margin.
        let t2 = cfg.for_payload(112);
        assert!(t2 > t);
        assert_eq!(
            t2 - Duration::from_millis(80),
            (t - Duration::from_millis(80)) * 2 + Duration::from_micros(1)
        );
    }

    #[test]
    fn test_default_config_sane() {
        let cfg = SdtlConfig::default();
        assert_eq!(cfg.mtu, DEFAULT_MTU);
        assert!(cfg.fifo_depth >= 2);
        assert!(cfg.max_retries.is_none());
    }

    #[test]
    fn test_presets_differ_where_it_matters() {
        let slow = SdtlConfig::slow_serial();
        assert!(slow.mtu < DEFAULT_MTU);
        assert!(slow.ack_timeout.for_payload(64) > AckTimeoutConfig::serial_57600().for_payload(64));

        let local = SdtlConfig::local_test();
        assert!(local.max_retries.is_some());
    }
}
