// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # SDTL - Segmented Datagram Transport Layer
//!
//! A light-weight framed transport carrying application datagrams of
//! arbitrary length over a byte-oriented, unreliable, in-order medium — a
//! serial link, a radio modem, or any full-duplex byte pipe. One transport
//! *service* multiplexes several logical *channels*; each channel runs
//! **reliable** (stop-and-wait ARQ with per-fragment acknowledgements) or
//! **unreliable** (fire-and-forget). Callers hand SDTL a whole message and
//! the peer channel receives that whole message; fragmentation, framing, CRC
//! protection, acknowledgement and resynchronisation happen inside.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sdtl::{ChannelConfig, ChannelKind, SdtlConfig, SdtlService, TestBridge};
//!
//! fn main() -> sdtl::Result<()> {
//!     let (near_end, far_end) = TestBridge::pair();
//!
//!     let service = SdtlService::new("telemetry", SdtlConfig::default(), Arc::new(near_end))?;
//!     service.create_channel(ChannelConfig {
//!         id: 1,
//!         name: "downlink".into(),
//!         kind: ChannelKind::Reliable,
//!         mtu_override: 0,
//!     })?;
//!     service.start()?;
//!
//!     let channel = service.channel("downlink")?;
//!     channel.send_data(b"one whole message, fragmented as needed")?;
//!
//!     service.stop()?;
//!     # let _ = far_end;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Application (send_data / recv_data)
//!        |
//! +------------------+
//! |     Channel      |  <-- fragmenting TX engine, classifying RX call
//! +------------------+
//!        |  bounded blocking FIFOs (data, ack)
//! +------------------+
//! |  RX dispatcher   |  <-- one thread per service: decode, validate, route
//! +------------------+
//!        |
//! +------------------+
//! |      Framer      |  <-- byte stuffing, CRC-16, resynchronisation
//! +------------------+
//!        |
//! +------------------+
//! |      Media       |  <-- serial port, radio, in-memory bridge
//! +------------------+
//! ```
//!
//! ## Wire Protocol
//!
//! ```text
//! Frame  = BB EE | code | packet | crc16 | BB 55     (content byte-stuffed)
//! DATA   = attr ch_id | seq_code cnt flags payload_size | payload
//! ACK    = attr ch_id | code cnt
//! CMD    = attr ch_id | cmd_seq_code cmd_code
//! ```
//!
//! Every on-wire byte belongs to exactly one frame; every frame carries
//! exactly one packet; `ch_id` selects the logical channel.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SdtlService`] | Service lifecycle, channel registry, RX thread |
//! | [`ChannelHandle`] | Application send/receive API for one channel |
//! | [`Media`] | Contract a byte-stream back-end implements |
//! | [`TestBridge`] | In-memory media pair for tests and demos |
//! | [`ChannelPort`] | Six-operation port for bus-replication consumers |
//!
//! ## Limitations
//!
//! No congestion control, no selective repeat, no cross-channel ordering.
//! On a reliable channel a receiver that observes a numbering gap waits for
//! the sender's retry of the missing fragment; there is no negative
//! acknowledgement.

/// Channel configuration, TX engine and the application RX call.
pub mod channel;
/// Service and protocol configuration.
pub mod config;
/// Port driver for bus-replication consumers.
pub mod driver;
/// Error taxonomy.
pub mod error;
/// Bounded blocking FIFO used between the RX thread and application calls.
pub mod fifo;
/// Byte-stuffed frame codec with CRC-16 protection.
pub mod framing;
/// Media abstraction and the in-memory test bridge.
pub mod media;
/// Packet headers carried inside frames.
pub mod packet;
/// Service RX dispatcher.
mod rx;
/// Service lifecycle and the process-wide registry.
pub mod service;
/// Per-channel receive state record.
pub mod state;

pub use channel::{ChannelConfig, ChannelHandle, ChannelKind, ChannelRxStat, ChannelTxStat};
pub use config::{AckTimeoutConfig, SdtlConfig};
pub use driver::{ChannelPort, PortCommand, PortError, PortResult};
pub use error::{Result, SdtlError};
pub use media::{BridgeEndpoint, Media, TestBridge};
pub use packet::{AckCode, CmdCode};
pub use rx::ServiceRxStat;
pub use service::SdtlService;
pub use state::{ChannelState, RxState};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
