// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Port driver for bus-replication consumers.
//!
//! Upstream replication services do not speak channels; they expect a plain
//! datagram port with six operations: connect, send, receive with timeout,
//! command, state check, disconnect. [`ChannelPort`] adapts one channel to
//! that contract and folds the transport's error taxonomy into the coarse
//! statuses the consumer acts on:
//!
//! | transport result | port status |
//! |---|---|
//! | `Ok` | delivered |
//! | `RemoteRxCanceled`, `RemoteRxNoClient` | [`PortError::RemoteNeedReset`] |
//! | `AppReset` | [`PortError::ResetCmd`] |
//! | `Timeout` (receive) | [`PortError::TimedOut`] |
//! | anything else | [`PortError::Other`] |
//!
//! A receive that observed a FIFO overrun still counts as delivered; the
//! stream above re-synchronises on its own framing.

use std::fmt;
use std::time::Duration;

use crate::channel::ChannelHandle;
use crate::error::SdtlError;
use crate::packet::CmdCode;
use crate::service::SdtlService;

/// Commands a replication consumer can issue through the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCommand {
    /// Raise the reset condition on the remote end of the channel.
    ResetRemote,
    /// Clear the locally latched conditions.
    ResetLocalState,
}

/// Coarse port-level failure.
#[derive(Debug)]
pub enum PortError {
    /// The remote side rejected the transfer; it needs a reset handshake.
    RemoteNeedReset,
    /// A reset command fired; the consumer should restart its session.
    ResetCmd,
    /// The receive timeout elapsed.
    TimedOut,
    /// Anything the consumer cannot act on besides giving up.
    Other(SdtlError),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteNeedReset => write!(f, "remote side needs reset"),
            Self::ResetCmd => write!(f, "reset command received"),
            Self::TimedOut => write!(f, "port receive timed out"),
            Self::Other(e) => write!(f, "port error: {}", e),
        }
    }
}

impl std::error::Error for PortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Other(e) => Some(e),
            _ => None,
        }
    }
}

/// Result alias for port operations.
pub type PortResult<T> = std::result::Result<T, PortError>;

/// A channel adapted to the six-operation port contract.
pub struct ChannelPort {
    handle: ChannelHandle,
}

impl ChannelPort {
    /// Connect to a channel of a started service by name.
    pub fn connect(service_name: &str, channel_name: &str) -> PortResult<Self> {
        let service = SdtlService::lookup(service_name)
            .ok_or(PortError::Other(SdtlError::NoService))?;
        let handle = service.channel(channel_name).map_err(PortError::Other)?;
        Ok(Self { handle })
    }

    /// Wrap an already-open channel handle.
    #[must_use]
    pub fn from_handle(handle: ChannelHandle) -> Self {
        Self { handle }
    }

    /// Send one datagram, returning the bytes consumed.
    pub fn send(&self, data: &[u8]) -> PortResult<usize> {
        match self.handle.send_data(data) {
            Ok(()) => Ok(data.len()),
            Err(SdtlError::RemoteRxCanceled | SdtlError::RemoteRxNoClient) => {
                Err(PortError::RemoteNeedReset)
            }
            Err(SdtlError::AppReset) => Err(PortError::ResetCmd),
            Err(e) => Err(PortError::Other(e)),
        }
    }

    /// Receive one datagram with a bound on the wait for it to begin.
    ///
    /// Returns the received byte count; 0 when the receive ended on a FIFO
    /// overrun (the payload fragments delivered so far were consistent, the
    /// message boundary was lost).
    pub fn recv(&self, buf: &mut [u8], timeout: Duration) -> PortResult<usize> {
        let timeout_us = u32::try_from(timeout.as_micros()).unwrap_or(u32::MAX);
        self.handle.recv_arm_timeout(timeout_us);

        match self.handle.recv_data(buf) {
            Ok(n) => Ok(n),
            Err(SdtlError::RxFifoOverflow) => Ok(0),
            Err(SdtlError::AppReset) => Err(PortError::ResetCmd),
            Err(SdtlError::Timeout) => Err(PortError::TimedOut),
            Err(e) => Err(PortError::Other(e)),
        }
    }

    /// Issue a port command.
    pub fn command(&self, cmd: PortCommand) -> PortResult<()> {
        match cmd {
            PortCommand::ResetRemote => self
                .handle
                .send_cmd(CmdCode::Reset)
                .map_err(PortError::Other),
            PortCommand::ResetLocalState => {
                self.handle.reset_condition();
                Ok(())
            }
        }
    }

    /// Non-blocking check of the locally latched conditions.
    pub fn check_state(&self) -> PortResult<()> {
        match self.handle.check_reset_condition() {
            Ok(()) => Ok(()),
            Err(SdtlError::AppReset | SdtlError::AppCancel) => Err(PortError::ResetCmd),
            Err(e) => Err(PortError::Other(e)),
        }
    }

    /// Release the port. The channel itself stays open for other handles.
    pub fn disconnect(self) -> PortResult<()> {
        Ok(())
    }

    /// The wrapped channel handle.
    #[must_use]
    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelKind};
    use crate::config::SdtlConfig;
    use crate::media::TestBridge;
    use crate::service::SdtlService;
    use std::sync::Arc;

    fn started_service(name: &str) -> SdtlService {
        let (a, _b) = TestBridge::pair();
        let svc = SdtlService::new(name, SdtlConfig::default(), Arc::new(a)).expect("service");
        svc.create_channel(ChannelConfig {
            id: 1,
            name: "repl".into(),
            kind: ChannelKind::Reliable,
            mtu_override: 0,
        })
        .expect("channel");
        svc.start().expect("start");
        svc
    }

    #[test]
    fn test_connect_resolves_service_and_channel() {
        let svc = started_service("port-connect");

        let port = ChannelPort::connect("port-connect", "repl").expect("connect");
        assert_eq!(port.handle().id(), 1);
        port.disconnect().expect("disconnect");

        assert!(matches!(
            ChannelPort::connect("port-connect", "missing"),
            Err(PortError::Other(SdtlError::NoChannelLocal))
        ));
        assert!(matches!(
            ChannelPort::connect("no-such-service", "repl"),
            Err(PortError::Other(SdtlError::NoService))
        ));

        svc.stop().expect("stop");
    }

    #[test]
    fn test_recv_timeout_maps_to_timedout() {
        let svc = started_service("port-timeout");
        let port = ChannelPort::connect("port-timeout", "repl").expect("connect");

        let mut buf = [0u8; 32];
        let result = port.recv(&mut buf, Duration::from_millis(20));
        assert!(matches!(result, Err(PortError::TimedOut)));

        svc.stop().expect("stop");
    }

    #[test]
    fn test_check_state_reflects_conditions() {
        let svc = started_service("port-state");
        let port = ChannelPort::connect("port-state", "repl").expect("connect");

        assert!(port.check_state().is_ok());

        // Latch a condition the way an incoming CMD would.
        let handle = svc.channel("repl").expect("open");
        crate::rx::rx_cmd(
            handle_channel(&handle),
            &crate::packet::CmdHeader {
                cmd_seq_code: 0x0909,
                cmd_code: CmdCode::Cancel,
            },
        );

        assert!(matches!(port.check_state(), Err(PortError::ResetCmd)));

        port.command(PortCommand::ResetLocalState).expect("clear");
        assert!(port.check_state().is_ok());

        svc.stop().expect("stop");
    }

    /// Test-only reach-through from a public handle to the inner channel.
    fn handle_channel(handle: &ChannelHandle) -> &crate::channel::Channel {
        handle.inner()
    }

    #[test]
    fn test_send_no_receiver_needs_reset() {
        // Two bridged services; the peer never calls recv, so a reliable send
        // is answered NoReceiver and the port reports a needed reset.
        let (a, b) = TestBridge::pair();
        let near =
            SdtlService::new("port-near", SdtlConfig::default(), Arc::new(a)).expect("near");
        let far = SdtlService::new("port-far", SdtlConfig::default(), Arc::new(b)).expect("far");
        for svc in [&near, &far] {
            svc.create_channel(ChannelConfig {
                id: 1,
                name: "repl".into(),
                kind: ChannelKind::Reliable,
                mtu_override: 0,
            })
            .expect("channel");
            svc.start().expect("start");
        }

        let port = ChannelPort::connect("port-near", "repl").expect("connect");
        let result = port.send(b"nobody listening");
        assert!(matches!(result, Err(PortError::RemoteNeedReset)));

        near.stop().expect("stop near");
        far.stop().expect("stop far");
    }
}
