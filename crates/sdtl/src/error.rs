// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the transport.
//!
//! Errors fall into four classes with distinct handling:
//!
//! | Class | Variants | Behavior |
//! |-------|----------|----------|
//! | Setup | `InvalidMtu`, `ChannelExists`, `ServiceExists`, `NoService`, `NoChannelLocal`, `InvalidChannelType` | fatal at configuration time, never seen at runtime |
//! | Protocol | `RemoteRxCanceled`, `RemoteRxNoClient`, `Timeout`, `RxBufferSmall`, `RxFifoOverflow` | surfaced to the caller, who decides to retry or give up |
//! | Out-of-band | `AppReset`, `AppCancel` | latched conditions interrupting blocked calls |
//! | Wire/resource | `InconsistentFrameLen`, `InvalidFrameType`, `TxBufferSmall`, `MediaEof`, `Media`, `Internal` | absorbed by the RX thread or fatal |
//!
//! Wire-layer decode errors never reach the application; the RX dispatcher
//! counts and discards them.

use std::fmt;
use std::io;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SdtlError>;

/// Transport error.
#[derive(Debug)]
pub enum SdtlError {
    /// An ACK or data wait ran out of time.
    Timeout,
    /// The peer receiver canceled the sequence in progress.
    RemoteRxCanceled,
    /// No receiver is waiting on the peer channel.
    RemoteRxNoClient,
    /// The caller's buffer is smaller than an incoming fragment.
    RxBufferSmall,
    /// The TX frame buffer cannot hold the composed frame.
    TxBufferSmall,
    /// Frame length does not match what the packet header declares.
    InconsistentFrameLen,
    /// Unknown packet type bits in the base header.
    InvalidFrameType,
    /// No local channel with the requested id or name.
    NoChannelLocal,
    /// The channel data FIFO overran a lagging receiver; bytes accepted so
    /// far are intact, later fragments may have been dropped.
    RxFifoOverflow,
    /// A channel with this id or name already exists on the service.
    ChannelExists,
    /// A service with this name is already registered.
    ServiceExists,
    /// No service registered under the requested name.
    NoService,
    /// Effective MTU leaves no room for a data payload.
    InvalidMtu,
    /// The operation requires a reliable channel.
    InvalidChannelType,
    /// Latched out-of-band reset condition.
    AppReset,
    /// Latched out-of-band cancel condition.
    AppCancel,
    /// The media reached end of stream.
    MediaEof,
    /// The media rejected a transfer.
    Media(io::Error),
    /// Internal plumbing failure (FIFO closed, thread spawn, capacity).
    Internal(&'static str),
}

impl fmt::Display for SdtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "operation timed out"),
            Self::RemoteRxCanceled => write!(f, "remote receiver canceled the sequence"),
            Self::RemoteRxNoClient => write!(f, "no receiver on the remote channel"),
            Self::RxBufferSmall => write!(f, "receive buffer smaller than incoming fragment"),
            Self::TxBufferSmall => write!(f, "frame buffer too small for composed frame"),
            Self::InconsistentFrameLen => write!(f, "frame length inconsistent with packet header"),
            Self::InvalidFrameType => write!(f, "unknown packet type"),
            Self::NoChannelLocal => write!(f, "no such local channel"),
            Self::RxFifoOverflow => write!(f, "receive FIFO overran a lagging consumer"),
            Self::ChannelExists => write!(f, "channel id or name already in use"),
            Self::ServiceExists => write!(f, "service name already registered"),
            Self::NoService => write!(f, "no such service"),
            Self::InvalidMtu => write!(f, "MTU too small for data header"),
            Self::InvalidChannelType => write!(f, "operation requires a reliable channel"),
            Self::AppReset => write!(f, "reset condition raised"),
            Self::AppCancel => write!(f, "cancel condition raised"),
            Self::MediaEof => write!(f, "media end of stream"),
            Self::Media(e) => write!(f, "media error: {}", e),
            Self::Internal(what) => write!(f, "internal error: {}", what),
        }
    }
}

impl std::error::Error for SdtlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Media(e) => Some(e),
            _ => None,
        }
    }
}

impl SdtlError {
    /// True for the latched out-of-band conditions.
    #[inline]
    #[must_use]
    pub fn is_out_of_band(&self) -> bool {
        matches!(self, Self::AppReset | Self::AppCancel)
    }
}

impl From<io::Error> for SdtlError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::MediaEof
        } else {
            Self::Media(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_lowercase_prose() {
        let msg = SdtlError::RemoteRxNoClient.to_string();
        assert!(msg.contains("no receiver"));
    }

    #[test]
    fn test_out_of_band_classification() {
        assert!(SdtlError::AppReset.is_out_of_band());
        assert!(SdtlError::AppCancel.is_out_of_band());
        assert!(!SdtlError::Timeout.is_out_of_band());
    }

    #[test]
    fn test_io_eof_maps_to_media_eof() {
        let e: SdtlError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(e, SdtlError::MediaEof));

        let e: SdtlError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(e, SdtlError::Media(_)));
    }
}
