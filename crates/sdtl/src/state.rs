// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-channel receive state record.
//!
//! Reliable channels keep a tiny state record shared between the service RX
//! thread (protocol side) and the application caller (API side). The record
//! is swapped atomically as a whole, so a reader never observes a torn
//! combination of `rx_state`, `last_received_seq` and `condition_flags`.
//!
//! `last_received_seq` is updated only when a sequence completes or is
//! canceled; a value of 0 means "never seen" (sequence codes avoid 0).

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::SdtlError;

/// Latched out-of-band condition bits.
pub mod cond {
    /// Peer requested a reset.
    pub const APP_RESET: u8 = 0x01;
    /// Peer requested a cancel.
    pub const APP_CANCEL: u8 = 0x02;
}

/// Receive-side protocol state of a reliable channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// No receiver has ever waited on the channel.
    #[default]
    Idle,
    /// A `recv_data` call is waiting for fragments.
    WaitData,
    /// The previous sequence completed.
    SeqDone,
    /// The previous receive terminated abnormally; incoming data is answered
    /// with a cancel acknowledgement until a new receiver arrives.
    RcvCanceled,
}

/// The atomically-swapped state record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    /// Receive-side protocol state.
    pub rx_state: RxState,
    /// Sequence code of the last completed sequence; 0 = never seen.
    pub last_received_seq: u16,
    /// `cond` bits currently latched.
    pub condition_flags: u8,
}

/// Shared cell holding a [`ChannelState`] snapshot.
pub struct ChannelStateCell {
    state: ArcSwap<ChannelState>,
}

impl ChannelStateCell {
    /// Create a cell in the [`RxState::Idle`] state with no conditions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(ChannelState::default()),
        }
    }

    /// Consistent snapshot of the whole record.
    #[inline]
    #[must_use]
    pub fn read(&self) -> ChannelState {
        **self.state.load()
    }

    /// Set the receive state and last-received sequence, preserving the
    /// condition flags.
    pub fn set_rx(&self, rx_state: RxState, last_received_seq: u16) {
        self.state.rcu(|cur| {
            let mut next = **cur;
            next.rx_state = rx_state;
            next.last_received_seq = last_received_seq;
            Arc::new(next)
        });
    }

    /// Set or clear condition flag bits, preserving the rest of the record.
    pub fn alter_cond_flags(&self, flags: u8, set: bool) {
        self.state.rcu(|cur| {
            let mut next = **cur;
            if set {
                next.condition_flags |= flags;
            } else {
                next.condition_flags &= !flags;
            }
            Arc::new(next)
        });
    }

    /// Check the latched conditions; reset takes precedence over cancel.
    pub fn active_condition(&self) -> Result<(), SdtlError> {
        let flags = self.read().condition_flags;
        if flags & cond::APP_RESET != 0 {
            Err(SdtlError::AppReset)
        } else if flags & cond::APP_CANCEL != 0 {
            Err(SdtlError::AppCancel)
        } else {
            Ok(())
        }
    }
}

impl Default for ChannelStateCell {
    fn default() -> Self {
        Self::new()
    }
}
