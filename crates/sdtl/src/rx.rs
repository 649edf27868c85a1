// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service RX dispatcher.
//!
//! One thread per service pulls byte chunks from the media, drives the frame
//! decoder, validates each frame as a packet and routes it to its channel:
//!
//! - DATA is pushed onto the channel data FIFO (or answered directly when no
//!   receiver is waiting),
//! - ACK is pushed onto the channel ACK FIFO,
//! - CMD latches an out-of-band condition and releases blocked callers with
//!   synthetic FIFO records; CMDs are ignored on unreliable channels.
//!
//! Wire-level decode errors never leave this module; they are logged at debug
//! level and show up in the service statistics.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::Channel;
use crate::framing::{DecodeEvent, DecoderStats, FrameDecoder};
use crate::packet::{self, data_flags, AckCode, AckSubHeader, CmdCode, CmdHeader, DataSubHeader, Packet};
use crate::media::Media;
use crate::state::{cond, RxState};

/// Snapshot of service-level receive statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRxStat {
    /// Raw bytes pulled from the media.
    pub bytes_received: u64,
    /// CRC-valid frames decoded.
    pub frames_received: u64,
    /// Frames discarded on CRC mismatch.
    pub bad_crc_frames: u64,
    /// Bytes consumed outside any frame.
    pub non_framed_bytes: u64,
    /// Valid frames dropped at dispatch (bad packet, unknown channel).
    pub dropped_frames: u64,
}

#[derive(Default)]
pub(crate) struct ServiceRxStatAtomic {
    bytes_received: AtomicU64,
    frames_received: AtomicU64,
    bad_crc_frames: AtomicU64,
    non_framed_bytes: AtomicU64,
    dropped_frames: AtomicU64,
}

impl ServiceRxStatAtomic {
    pub(crate) fn snapshot(&self) -> ServiceRxStat {
        ServiceRxStat {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bad_crc_frames: self.bad_crc_frames.load(Ordering::Relaxed),
            non_framed_bytes: self.non_framed_bytes.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }

    fn sync_decoder(&self, stats: &DecoderStats) {
        // Decoder counters are cumulative; mirror them instead of adding.
        self.frames_received
            .store(stats.good_frames, Ordering::Relaxed);
        self.bad_crc_frames
            .store(stats.invalid_crc, Ordering::Relaxed);
        self.non_framed_bytes
            .store(stats.non_framed_bytes, Ordering::Relaxed);
    }
}

/// The RX thread body. Returns when the media reaches end of stream, fails,
/// or the stop flag is raised.
pub(crate) fn rx_loop(
    service_name: &str,
    media: &Arc<dyn Media>,
    channels: &RwLock<Vec<Arc<Channel>>>,
    stats: &ServiceRxStatAtomic,
    stop: &AtomicBool,
    mtu: u16,
) {
    let mut decoder = FrameDecoder::new(mtu as usize + 16);
    let mut buf = vec![0u8; 2 * (mtu as usize + 10)];

    while !stop.load(Ordering::Relaxed) {
        let n = match media.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::info!("[SDTL-RX] {}: media end of stream", service_name);
                break;
            }
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    log::warn!("[SDTL-RX] {}: media read failed: {}", service_name, e);
                }
                break;
            }
        };

        let mut consumed = 0;
        while consumed < n {
            let (used, event) = decoder.poll(&buf[consumed..n]);
            consumed += used;
            match event {
                DecodeEvent::Pending => {}
                DecodeEvent::GotFrame => {
                    dispatch_frame(channels, stats, decoder.payload());
                }
                event => {
                    log::debug!("[SDTL-RX] {}: framer event {:?}", service_name, event);
                }
            }
        }

        stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        stats.sync_decoder(decoder.stats());
    }

    log::debug!("[SDTL-RX] {}: dispatcher exiting", service_name);
}

/// Validate one frame as a packet and route it to its channel.
fn dispatch_frame(
    channels: &RwLock<Vec<Arc<Channel>>>,
    stats: &ServiceRxStatAtomic,
    frame: &[u8],
) {
    let pkt = match packet::parse(frame) {
        Ok(pkt) => pkt,
        Err(e) => {
            log::debug!("[SDTL-RX] dropping frame: {}", e);
            stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // Linear scan; channel tables are tiny.
    let channel = channels
        .read()
        .iter()
        .find(|c| c.id() == pkt.ch_id())
        .cloned();
    let Some(channel) = channel else {
        log::debug!("[SDTL-RX] no channel {} for incoming packet", pkt.ch_id());
        stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
        return;
    };

    match pkt {
        Packet::Data { sub, payload, .. } => rx_data(&channel, &sub, payload),
        Packet::Ack { sub, .. } => {
            log::debug!(
                "[SDTL-RX] ch {} ack {:?} for pkt #{}",
                channel.id(),
                sub.code,
                sub.cnt
            );
            channel.push_ack(sub);
        }
        Packet::Cmd { hdr, .. } => {
            // Out-of-band commands are meaningful on reliable channels only.
            if channel.reliable() {
                rx_cmd(&channel, &hdr);
            }
        }
    }
}

/// Route one DATA fragment by receive state.
pub(crate) fn rx_data(ch: &Channel, sub: &DataSubHeader, payload: &[u8]) {
    if !ch.reliable() {
        ch.push_data(*sub, payload);
        return;
    }

    let st = ch.state.read();

    // A replayed trailer of the already finished sequence: the peer missed
    // our ACK. Acknowledge again, deliver nothing.
    if sub.flags & data_flags::LAST_PKT != 0 && sub.seq_code == st.last_received_seq {
        log::debug!(
            "[SDTL-RX] ch {} re-ack trailing pkt of seq 0x{:04X}",
            ch.id(),
            sub.seq_code
        );
        ack_or_log(ch, sub.cnt, AckCode::GotPkt);
        return;
    }

    match st.rx_state {
        RxState::RcvCanceled => ack_or_log(ch, sub.cnt, AckCode::Canceled),
        RxState::Idle | RxState::SeqDone => ack_or_log(ch, sub.cnt, AckCode::NoReceiver),
        RxState::WaitData => {
            log::debug!(
                "[SDTL-RX] ch {} pkt #{} ({} bytes, seq 0x{:04X})",
                ch.id(),
                sub.cnt,
                sub.payload_size,
                sub.seq_code
            );
            ch.push_data(*sub, payload);
        }
    }
}

/// Process an out-of-band command.
///
/// Commands are idempotent by sequence code: a retransmitted CMD only re-emits
/// the acknowledgement.
pub(crate) fn rx_cmd(ch: &Channel, hdr: &CmdHeader) {
    if ch.rx_cmd_last_seq_code.load(Ordering::Relaxed) != hdr.cmd_seq_code {
        ch.rx_cmd_last_seq_code
            .store(hdr.cmd_seq_code, Ordering::Relaxed);

        let flags = match hdr.cmd_code {
            CmdCode::Reset => cond::APP_RESET,
            CmdCode::Cancel => cond::APP_CANCEL,
        };
        log::debug!(
            "[SDTL-RX] ch {} cmd {:?} seq 0x{:04X}",
            ch.id(),
            hdr.cmd_code,
            hdr.cmd_seq_code
        );
        ch.state.alter_cond_flags(flags, true);

        // Synthetic records release a blocked receiver (zero-payload DATA)
        // and a blocked sender (out-of-band ACK).
        ch.push_data(DataSubHeader::default(), &[]);
        ch.push_ack(AckSubHeader {
            code: AckCode::OutBandEvent,
            cnt: 0,
        });
    }

    ack_or_log(ch, hdr.cmd_seq_code as u8, AckCode::GotCmd);
}

fn ack_or_log(ch: &Channel, cnt: u8, code: AckCode) {
    if let Err(e) = ch.send_ack(cnt, code) {
        log::warn!("[SDTL-RX] ch {} failed to ack ({:?}): {}", ch.id(), code, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelKind};
    use crate::config::AckTimeoutConfig;
    use crate::framing;
    use parking_lot::Mutex;

    struct CaptureMedia {
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl CaptureMedia {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
            })
        }

        fn packets(&self) -> Vec<Vec<u8>> {
            let mut out = Vec::new();
            let mut dec = FrameDecoder::new(1024);
            for frame in self.writes.lock().iter() {
                let mut consumed = 0;
                while consumed < frame.len() {
                    let (n, ev) = dec.poll(&frame[consumed..]);
                    consumed += n;
                    if ev == DecodeEvent::GotFrame {
                        out.push(dec.payload().to_vec());
                    }
                }
            }
            out
        }

        fn acks(&self) -> Vec<AckSubHeader> {
            self.packets()
                .iter()
                .filter_map(|raw| match packet::parse(raw) {
                    Ok(Packet::Ack { sub, .. }) => Some(sub),
                    _ => None,
                })
                .collect()
        }
    }

    impl Media for CaptureMedia {
        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "capture only"))
        }

        fn write(&self, buf: &[u8]) -> io::Result<()> {
            self.writes.lock().push(buf.to_vec());
            Ok(())
        }

        fn close(&self) {}
    }

    fn reliable_channel(media: Arc<dyn Media>) -> Arc<Channel> {
        Channel::new(
            ChannelConfig {
                id: 1,
                name: "rx-test".into(),
                kind: ChannelKind::Reliable,
                mtu_override: 0,
            },
            64,
            8,
            AckTimeoutConfig::default(),
            None,
            media,
        )
        .expect("channel")
    }

    fn data_sub(seq: u16, cnt: u8, flags: u8, len: u16) -> DataSubHeader {
        DataSubHeader {
            seq_code: seq,
            cnt,
            flags,
            payload_size: len,
        }
    }

    #[test]
    fn test_data_with_no_receiver_is_refused() {
        let media = CaptureMedia::new();
        let ch = reliable_channel(media.clone());

        rx_data(&ch, &data_sub(0x10, 0, data_flags::FIRST_PKT, 3), b"abc");

        assert_eq!(
            media.acks(),
            vec![AckSubHeader {
                code: AckCode::NoReceiver,
                cnt: 0
            }]
        );
        assert!(ch.data_fifo.is_empty());
    }

    #[test]
    fn test_data_in_wait_state_is_queued() {
        let media = CaptureMedia::new();
        let ch = reliable_channel(media.clone());
        ch.state.set_rx(RxState::WaitData, 0);

        rx_data(&ch, &data_sub(0x10, 0, data_flags::FIRST_PKT, 3), b"abc");

        assert_eq!(ch.data_fifo.len(), 1);
        // Per-fragment acknowledgement belongs to the application RX call.
        assert!(media.acks().is_empty());
    }

    #[test]
    fn test_data_after_cancel_is_refused() {
        let media = CaptureMedia::new();
        let ch = reliable_channel(media.clone());
        ch.state.set_rx(RxState::RcvCanceled, 0);

        rx_data(&ch, &data_sub(0x10, 2, 0, 3), b"abc");

        assert_eq!(
            media.acks(),
            vec![AckSubHeader {
                code: AckCode::Canceled,
                cnt: 2
            }]
        );
    }

    #[test]
    fn test_duplicate_trailer_is_reacked_not_delivered() {
        let media = CaptureMedia::new();
        let ch = reliable_channel(media.clone());
        // Sequence 0x77 completed earlier.
        ch.state.set_rx(RxState::SeqDone, 0x77);

        rx_data(&ch, &data_sub(0x77, 9, data_flags::LAST_PKT, 4), b"tail");

        assert_eq!(
            media.acks(),
            vec![AckSubHeader {
                code: AckCode::GotPkt,
                cnt: 9
            }]
        );
        assert!(ch.data_fifo.is_empty());
    }

    #[test]
    fn test_trailer_of_new_sequence_is_not_confused_with_duplicate() {
        let media = CaptureMedia::new();
        let ch = reliable_channel(media.clone());
        ch.state.set_rx(RxState::WaitData, 0x77);

        // Same LAST flag, different sequence: normal delivery path.
        rx_data(&ch, &data_sub(0x78, 0, data_flags::FIRST_PKT | data_flags::LAST_PKT, 4), b"data");

        assert!(media.acks().is_empty());
        assert_eq!(ch.data_fifo.len(), 1);
    }

    #[test]
    fn test_cmd_latches_condition_and_releases_waiters() {
        let media = CaptureMedia::new();
        let ch = reliable_channel(media.clone());

        rx_cmd(
            &ch,
            &CmdHeader {
                cmd_seq_code: 0x0102,
                cmd_code: CmdCode::Reset,
            },
        );

        let st = ch.state.read();
        assert_eq!(st.condition_flags & cond::APP_RESET, cond::APP_RESET);
        // One synthetic data record and one synthetic ack queued.
        assert_eq!(ch.data_fifo.len(), 1);
        assert_eq!(
            media.acks(),
            vec![AckSubHeader {
                code: AckCode::GotCmd,
                cnt: 0x02
            }]
        );
    }

    #[test]
    fn test_repeated_cmd_is_idempotent() {
        let media = CaptureMedia::new();
        let ch = reliable_channel(media.clone());
        let hdr = CmdHeader {
            cmd_seq_code: 0x0203,
            cmd_code: CmdCode::Cancel,
        };

        rx_cmd(&ch, &hdr);
        rx_cmd(&ch, &hdr);
        rx_cmd(&ch, &hdr);

        // Conditions latched once, synthetic record queued once, but every
        // repetition is acknowledged.
        assert_eq!(ch.data_fifo.len(), 1);
        assert_eq!(media.acks().len(), 3);
        assert!(media
            .acks()
            .iter()
            .all(|a| a.code == AckCode::GotCmd && a.cnt == 0x03));
    }

    #[test]
    fn test_dispatch_counts_unroutable_frames() {
        let media = CaptureMedia::new();
        let ch = reliable_channel(media);
        let channels = RwLock::new(vec![ch]);
        let stats = ServiceRxStatAtomic::default();

        // Unknown channel id.
        let mut pkt = [0u8; packet::ACK_HEADER_SIZE];
        packet::encode_ack(
            99,
            &AckSubHeader {
                code: AckCode::GotPkt,
                cnt: 0,
            },
            &mut pkt,
        );
        dispatch_frame(&channels, &stats, &pkt);

        // Garbage packet.
        dispatch_frame(&channels, &stats, &[0xFF, 0x00]);

        assert_eq!(stats.snapshot().dropped_frames, 2);
    }

    #[test]
    fn test_rx_loop_decodes_and_dispatches() {
        use crate::media::TestBridge;
        use crate::packet::DATA_HEADER_SIZE;

        let (near, far) = TestBridge::pair();
        let near: Arc<dyn Media> = Arc::new(near);

        let sink = CaptureMedia::new();
        let ch = reliable_channel(sink.clone());
        ch.state.set_rx(RxState::WaitData, 0);
        let channels = RwLock::new(vec![Arc::clone(&ch)]);
        let stats = ServiceRxStatAtomic::default();
        let stop = AtomicBool::new(false);

        // Frame one DATA packet onto the wire, then close to end the loop.
        let payload = b"loop!";
        let mut pkt = vec![0u8; DATA_HEADER_SIZE + payload.len()];
        packet::encode_data_header(
            1,
            &data_sub(0x42, 0, data_flags::FIRST_PKT | data_flags::LAST_PKT, payload.len() as u16),
            &mut pkt,
        );
        pkt[DATA_HEADER_SIZE..].copy_from_slice(payload);

        let mut frame = vec![0u8; framing::max_encoded_len(pkt.len())];
        let n = framing::compose_frame(0, &pkt, &mut frame).expect("encode");
        far.write(&frame[..n]).expect("write");
        near.close();

        rx_loop("test", &near, &channels, &stats, &stop, 64);

        assert_eq!(ch.data_fifo.len(), 1);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_received, n as u64);
        assert_eq!(snap.dropped_frames, 0);
    }
}
