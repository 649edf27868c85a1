// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet headers carried inside frames.
//!
//! Every frame payload is exactly one packet. All packets share a two-byte
//! base header; the low two bits of `attr` select the packet type.
//!
//! ```text
//! base = attr(u8) | ch_id(u8)
//!
//! DATA = base | seq_code(u16le) | cnt(u8) | flags(u8) | payload_size(u16le) | payload
//! ACK  = base | code(u8) | cnt(u8)
//! CMD  = base | cmd_seq_code(u16le) | cmd_code(u8)
//! ```
//!
//! Length validation is strict: a DATA frame must be exactly header plus
//! `payload_size` bytes; ACK and CMD must be exactly their header size.

use crate::error::SdtlError;

/// Base header size (attr + channel id).
pub const BASE_HEADER_SIZE: usize = 2;
/// Full DATA header size, including the base header.
pub const DATA_HEADER_SIZE: usize = 8;
/// Full ACK header size, including the base header.
pub const ACK_HEADER_SIZE: usize = 4;
/// Full CMD header size, including the base header.
pub const CMD_HEADER_SIZE: usize = 5;

/// Packet type, encoded in the low two bits of `attr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Data fragment.
    Data = 0,
    /// Per-fragment acknowledgement.
    Ack = 1,
    /// Out-of-band command.
    Cmd = 2,
}

impl PacketType {
    const ATTR_MASK: u8 = 0x03;

    fn from_attr(attr: u8) -> Option<Self> {
        match attr & Self::ATTR_MASK {
            0 => Some(Self::Data),
            1 => Some(Self::Ack),
            2 => Some(Self::Cmd),
            _ => None,
        }
    }
}

/// DATA packet flags.
pub mod data_flags {
    /// First fragment of a sequence.
    pub const FIRST_PKT: u8 = 0x01;
    /// Last fragment of a sequence.
    pub const LAST_PKT: u8 = 0x02;
    /// Sequence runs on a reliable channel.
    pub const RELIABLE: u8 = 0x04;
}

/// Acknowledgement code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Fragment accepted.
    GotPkt = 1,
    /// Receive side canceled the sequence.
    Canceled = 2,
    /// No receiver is waiting on the channel.
    NoReceiver = 3,
    /// Synthetic entry releasing a sender blocked on an out-of-band event.
    OutBandEvent = 4,
    /// Command accepted.
    GotCmd = 5,
}

impl AckCode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::GotPkt),
            2 => Some(Self::Canceled),
            3 => Some(Self::NoReceiver),
            4 => Some(Self::OutBandEvent),
            5 => Some(Self::GotCmd),
            _ => None,
        }
    }
}

/// Out-of-band command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdCode {
    /// Raise the reset condition on the peer channel.
    Reset = 1,
    /// Raise the cancel condition on the peer channel.
    Cancel = 2,
}

impl CmdCode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Reset),
            2 => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// DATA sub-header, the part after the base header.
///
/// This is also the record stored in the channel data FIFO ahead of the
/// payload bytes; a record with `payload_size == 0` is the synthetic
/// out-of-band entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DataSubHeader {
    /// Sequence code shared by every fragment of one message.
    pub seq_code: u16,
    /// Fragment number within the sequence, wrapping at 256.
    pub cnt: u8,
    /// `data_flags` bits.
    pub flags: u8,
    /// Payload bytes following the header.
    pub payload_size: u16,
}

/// ACK sub-header; also the record stored in the channel ACK FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckSubHeader {
    /// Acknowledgement code.
    pub code: AckCode,
    /// Fragment number being acknowledged.
    pub cnt: u8,
}

/// CMD header fields after the base header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    /// Command sequence code, for idempotent processing on the receiver.
    pub cmd_seq_code: u16,
    /// Command being issued.
    pub cmd_code: CmdCode,
}

/// A parsed packet borrowing its payload from the frame buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Data fragment.
    Data {
        /// Destination channel.
        ch_id: u8,
        /// Fragment sub-header.
        sub: DataSubHeader,
        /// Fragment payload.
        payload: &'a [u8],
    },
    /// Acknowledgement.
    Ack {
        /// Destination channel.
        ch_id: u8,
        /// Acknowledgement sub-header.
        sub: AckSubHeader,
    },
    /// Out-of-band command.
    Cmd {
        /// Destination channel.
        ch_id: u8,
        /// Command header.
        hdr: CmdHeader,
    },
}

impl Packet<'_> {
    /// Channel this packet addresses.
    #[must_use]
    pub fn ch_id(&self) -> u8 {
        match self {
            Self::Data { ch_id, .. } | Self::Ack { ch_id, .. } | Self::Cmd { ch_id, .. } => *ch_id,
        }
    }
}

/// Encode a DATA header (without payload) into `out`.
///
/// `out` must hold at least [`DATA_HEADER_SIZE`] bytes.
pub fn encode_data_header(ch_id: u8, sub: &DataSubHeader, out: &mut [u8]) -> usize {
    out[0] = PacketType::Data as u8;
    out[1] = ch_id;
    out[2..4].copy_from_slice(&sub.seq_code.to_le_bytes());
    out[4] = sub.cnt;
    out[5] = sub.flags;
    out[6..8].copy_from_slice(&sub.payload_size.to_le_bytes());
    DATA_HEADER_SIZE
}

/// Encode an ACK packet into `out`.
///
/// `out` must hold at least [`ACK_HEADER_SIZE`] bytes.
pub fn encode_ack(ch_id: u8, sub: &AckSubHeader, out: &mut [u8]) -> usize {
    out[0] = PacketType::Ack as u8;
    out[1] = ch_id;
    out[2] = sub.code as u8;
    out[3] = sub.cnt;
    ACK_HEADER_SIZE
}

/// Encode a CMD packet into `out`.
///
/// `out` must hold at least [`CMD_HEADER_SIZE`] bytes.
pub fn encode_cmd(ch_id: u8, hdr: &CmdHeader, out: &mut [u8]) -> usize {
    out[0] = PacketType::Cmd as u8;
    out[1] = ch_id;
    out[2..4].copy_from_slice(&hdr.cmd_seq_code.to_le_bytes());
    out[4] = hdr.cmd_code as u8;
    CMD_HEADER_SIZE
}

/// Parse and validate one frame payload as a packet.
///
/// # Errors
///
/// - `InvalidFrameType` for unknown type bits or unknown ACK/CMD codes,
/// - `InconsistentFrameLen` when the frame length disagrees with the header.
pub fn parse(frame: &[u8]) -> Result<Packet<'_>, SdtlError> {
    if frame.len() < BASE_HEADER_SIZE {
        return Err(SdtlError::InconsistentFrameLen);
    }

    let attr = frame[0];
    let ch_id = frame[1];
    let pkt_type = PacketType::from_attr(attr).ok_or(SdtlError::InvalidFrameType)?;

    match pkt_type {
        PacketType::Data => {
            if frame.len() < DATA_HEADER_SIZE {
                return Err(SdtlError::InconsistentFrameLen);
            }
            let sub = DataSubHeader {
                seq_code: u16::from_le_bytes([frame[2], frame[3]]),
                cnt: frame[4],
                flags: frame[5],
                payload_size: u16::from_le_bytes([frame[6], frame[7]]),
            };
            if frame.len() != DATA_HEADER_SIZE + sub.payload_size as usize {
                return Err(SdtlError::InconsistentFrameLen);
            }
            Ok(Packet::Data {
                ch_id,
                sub,
                payload: &frame[DATA_HEADER_SIZE..],
            })
        }

        PacketType::Ack => {
            if frame.len() != ACK_HEADER_SIZE {
                return Err(SdtlError::InconsistentFrameLen);
            }
            let code = AckCode::from_u8(frame[2]).ok_or(SdtlError::InvalidFrameType)?;
            Ok(Packet::Ack {
                ch_id,
                sub: AckSubHeader { code, cnt: frame[3] },
            })
        }

        PacketType::Cmd => {
            if frame.len() != CMD_HEADER_SIZE {
                return Err(SdtlError::InconsistentFrameLen);
            }
            let cmd_code = CmdCode::from_u8(frame[4]).ok_or(SdtlError::InvalidFrameType)?;
            Ok(Packet::Cmd {
                ch_id,
                hdr: CmdHeader {
                    cmd_seq_code: u16::from_le_bytes([frame[2], frame[3]]),
                    cmd_code,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_roundtrip() {
        let sub = DataSubHeader {
            seq_code: 0xBEEF,
            cnt: 3,
            flags: data_flags::FIRST_PKT | data_flags::RELIABLE,
            payload_size: 5,
        };
        let mut buf = [0u8; DATA_HEADER_SIZE + 5];
        encode_data_header(7, &sub, &mut buf);
        buf[DATA_HEADER_SIZE..].copy_from_slice(b"hello");

        match parse(&buf).expect("parse") {
            Packet::Data {
                ch_id,
                sub: parsed,
                payload,
            } => {
                assert_eq!(ch_id, 7);
                assert_eq!(parsed, sub);
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_ack_roundtrip() {
        let sub = AckSubHeader {
            code: AckCode::NoReceiver,
            cnt: 42,
        };
        let mut buf = [0u8; ACK_HEADER_SIZE];
        encode_ack(2, &sub, &mut buf);

        assert_eq!(
            parse(&buf).expect("parse"),
            Packet::Ack { ch_id: 2, sub }
        );
    }

    #[test]
    fn test_cmd_roundtrip() {
        let hdr = CmdHeader {
            cmd_seq_code: 0x1234,
            cmd_code: CmdCode::Cancel,
        };
        let mut buf = [0u8; CMD_HEADER_SIZE];
        encode_cmd(9, &hdr, &mut buf);

        assert_eq!(
            parse(&buf).expect("parse"),
            Packet::Cmd { ch_id: 9, hdr }
        );
    }

    #[test]
    fn test_data_length_mismatch_rejected() {
        let sub = DataSubHeader {
            seq_code: 1,
            cnt: 0,
            flags: 0,
            payload_size: 10,
        };
        let mut buf = [0u8; DATA_HEADER_SIZE + 4]; // 6 bytes short
        encode_data_header(1, &sub, &mut buf);

        assert!(matches!(
            parse(&buf),
            Err(SdtlError::InconsistentFrameLen)
        ));
    }

    #[test]
    fn test_ack_trailing_bytes_rejected() {
        let sub = AckSubHeader {
            code: AckCode::GotPkt,
            cnt: 0,
        };
        let mut buf = [0u8; ACK_HEADER_SIZE + 1];
        encode_ack(1, &sub, &mut buf);

        assert!(matches!(
            parse(&buf),
            Err(SdtlError::InconsistentFrameLen)
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let buf = [0x03u8, 0x01, 0x00, 0x00];
        assert!(matches!(parse(&buf), Err(SdtlError::InvalidFrameType)));
    }

    #[test]
    fn test_unknown_ack_code_rejected() {
        let buf = [PacketType::Ack as u8, 1, 0xEE, 0];
        assert!(matches!(parse(&buf), Err(SdtlError::InvalidFrameType)));
    }

    #[test]
    fn test_truncated_base_header_rejected() {
        assert!(matches!(parse(&[0x00]), Err(SdtlError::InconsistentFrameLen)));
        assert!(matches!(parse(&[]), Err(SdtlError::InconsistentFrameLen)));
    }

    #[test]
    fn test_zero_payload_data_is_valid() {
        // Zero-size DATA is legal on the wire; in the FIFO it doubles as the
        // synthetic out-of-band record.
        let sub = DataSubHeader::default();
        let mut buf = [0u8; DATA_HEADER_SIZE];
        encode_data_header(1, &sub, &mut buf);

        match parse(&buf).expect("parse") {
            Packet::Data { payload, .. } => assert!(payload.is_empty()),
            other => panic!("unexpected packet: {:?}", other),
        }
    }
}
