// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channels: configuration, the TX engine and the application RX call.
//!
//! A channel is one logical datagram stream multiplexed onto the service's
//! medium. Reliable channels run stop-and-wait ARQ with per-fragment
//! acknowledgements; unreliable channels are fire-and-forget with identical
//! framing.
//!
//! A channel serialises its own TX and its own RX internally; concurrent
//! senders on one channel queue behind each other. Different channels are
//! fully independent.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::AckTimeoutConfig;
use crate::error::{Result, SdtlError};
use crate::fifo::{Fifo, PopError};
use crate::framing;
use crate::media::Media;
use crate::packet::{
    self, data_flags, AckCode, AckSubHeader, CmdCode, CmdHeader, DataSubHeader, ACK_HEADER_SIZE,
    CMD_HEADER_SIZE, DATA_HEADER_SIZE,
};
use crate::state::{ChannelState, ChannelStateCell, RxState};

/// Command code carried in the frame header; this transport uses a single one.
pub(crate) const FRAME_CODE: u8 = 0;

/// Payload-size hint used for the CMD acknowledgement wait budget.
const CMD_ACK_SIZE_HINT: usize = 20;

/// Delivery mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Stop-and-wait ARQ with per-fragment acknowledgement and retry.
    Reliable,
    /// Fire-and-forget.
    Unreliable,
}

/// Static channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Wire identifier, unique within the service; present in every packet.
    pub id: u8,
    /// Lookup name, unique within the service.
    pub name: String,
    /// Delivery mode.
    pub kind: ChannelKind,
    /// Per-channel MTU cap; 0 inherits the service MTU. A non-zero value is
    /// clamped to the service MTU.
    pub mtu_override: u16,
}

/// Snapshot of a channel's transmit statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTxStat {
    /// Sequences started.
    pub sequences: u32,
    /// Fragments sent (retransmissions not included).
    pub packets: u32,
    /// Framed bytes written to the media.
    pub bytes: u32,
    /// Fragment retransmissions after ACK timeouts.
    pub retries: u32,
}

/// Snapshot of a channel's receive statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRxStat {
    /// Sequences started.
    pub sequences: u32,
    /// Fragments accepted.
    pub packets: u32,
    /// Payload bytes delivered.
    pub bytes: u32,
    /// Acknowledgements emitted.
    pub acks: u32,
    /// Data FIFO overruns observed.
    pub fifo_overruns: u32,
}

#[derive(Default)]
struct TxStatAtomic {
    sequences: AtomicU32,
    packets: AtomicU32,
    bytes: AtomicU32,
    retries: AtomicU32,
}

impl TxStatAtomic {
    fn snapshot(&self) -> ChannelTxStat {
        ChannelTxStat {
            sequences: self.sequences.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct RxStatAtomic {
    sequences: AtomicU32,
    packets: AtomicU32,
    bytes: AtomicU32,
    acks: AtomicU32,
    fifo_overruns: AtomicU32,
}

impl RxStatAtomic {
    fn snapshot(&self) -> ChannelRxStat {
        ChannelRxStat {
            sequences: self.sequences.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            fifo_overruns: self.fifo_overruns.load(Ordering::Relaxed),
        }
    }
}

/// Entry of the channel data FIFO: one fragment, or the synthetic
/// zero-payload out-of-band record.
pub(crate) struct DataRecord {
    pub(crate) sub: DataSubHeader,
    pub(crate) payload: Vec<u8>,
}

struct TxScratch {
    frame: Vec<u8>,
}

/// Per-channel runtime state. Shared between the service RX thread and
/// application callers via `Arc`.
pub(crate) struct Channel {
    cfg: ChannelConfig,
    max_payload_size: usize,
    media: Arc<dyn Media>,
    ack_timeout: AckTimeoutConfig,
    max_retries: Option<u32>,

    pub(crate) data_fifo: Fifo<DataRecord>,
    pub(crate) ack_fifo: Option<Fifo<AckSubHeader>>,
    pub(crate) state: ChannelStateCell,
    pub(crate) rx_cmd_last_seq_code: AtomicU16,

    tx_seq_num: AtomicU32,
    tx_cmd_seq_num: AtomicU32,
    armed_timeout_us: AtomicU32,

    tx_lock: Mutex<TxScratch>,
    rx_lock: Mutex<()>,

    tx_stat: TxStatAtomic,
    rx_stat: RxStatAtomic,
}

impl Channel {
    pub(crate) fn new(
        cfg: ChannelConfig,
        service_mtu: u16,
        fifo_depth: usize,
        ack_timeout: AckTimeoutConfig,
        max_retries: Option<u32>,
        media: Arc<dyn Media>,
    ) -> Result<Arc<Self>> {
        let mtu = if cfg.mtu_override > 0 {
            service_mtu.min(cfg.mtu_override)
        } else {
            service_mtu
        } as usize;

        if mtu <= DATA_HEADER_SIZE {
            return Err(SdtlError::InvalidMtu);
        }
        let max_payload_size = mtu - DATA_HEADER_SIZE;

        let ack_fifo = match cfg.kind {
            ChannelKind::Reliable => Some(Fifo::new(fifo_depth)),
            ChannelKind::Unreliable => None,
        };

        Ok(Arc::new(Self {
            cfg,
            max_payload_size,
            media,
            ack_timeout,
            max_retries,
            data_fifo: Fifo::new(fifo_depth),
            ack_fifo,
            state: ChannelStateCell::new(),
            rx_cmd_last_seq_code: AtomicU16::new(0),
            tx_seq_num: AtomicU32::new(0),
            tx_cmd_seq_num: AtomicU32::new(0),
            armed_timeout_us: AtomicU32::new(0),
            tx_lock: Mutex::new(TxScratch {
                frame: vec![0u8; framing::max_encoded_len(mtu)],
            }),
            rx_lock: Mutex::new(()),
            tx_stat: TxStatAtomic::default(),
            rx_stat: RxStatAtomic::default(),
        }))
    }

    #[inline]
    pub(crate) fn id(&self) -> u8 {
        self.cfg.id
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.cfg.name
    }

    #[inline]
    pub(crate) fn reliable(&self) -> bool {
        self.cfg.kind == ChannelKind::Reliable
    }

    /// RX-thread side: queue a fragment (or the synthetic OOB record).
    pub(crate) fn push_data(&self, sub: DataSubHeader, payload: &[u8]) {
        if !self.data_fifo.push(DataRecord {
            sub,
            payload: payload.to_vec(),
        }) {
            log::warn!(
                "[SDTL] ch {} data fifo displaced an entry (consumer lagging)",
                self.cfg.id
            );
        }
    }

    /// RX-thread side: queue an acknowledgement. Ignored on unreliable
    /// channels, which have no ACK FIFO.
    pub(crate) fn push_ack(&self, sub: AckSubHeader) {
        if let Some(fifo) = &self.ack_fifo {
            fifo.push(sub);
        }
    }

    /// Emit one ACK packet onto the media. Used from both the RX dispatcher
    /// (no-receiver, canceled, duplicate-trailer, command replies) and the
    /// application RX call (per-fragment acknowledgements).
    pub(crate) fn send_ack(&self, cnt: u8, code: AckCode) -> Result<()> {
        let mut pkt = [0u8; ACK_HEADER_SIZE];
        packet::encode_ack(self.cfg.id, &AckSubHeader { code, cnt }, &mut pkt);

        let mut frame = [0u8; 2 * ACK_HEADER_SIZE + framing::FRAME_OVERHEAD_MAX];
        let n = framing::compose_frame(FRAME_CODE, &pkt, &mut frame)
            .map_err(|_| SdtlError::TxBufferSmall)?;
        self.media.write(&frame[..n]).map_err(SdtlError::from)
    }

    pub(crate) fn close(&self) {
        self.data_fifo.close();
        if let Some(fifo) = &self.ack_fifo {
            fifo.close();
        }
    }

    fn write_data_packet(
        &self,
        scratch: &mut TxScratch,
        seq_code: u16,
        cnt: u8,
        flags: u8,
        payload: &[u8],
    ) -> Result<()> {
        let sub = DataSubHeader {
            seq_code,
            cnt,
            flags,
            payload_size: payload.len() as u16,
        };
        let mut hdr = [0u8; DATA_HEADER_SIZE];
        packet::encode_data_header(self.cfg.id, &sub, &mut hdr);

        let n = framing::compose_frame_vectored(FRAME_CODE, &[&hdr, payload], &mut scratch.frame)
            .map_err(|_| SdtlError::TxBufferSmall)?;
        self.media.write(&scratch.frame[..n])?;
        self.tx_stat.bytes.fetch_add(n as u32, Ordering::Relaxed);
        Ok(())
    }

    fn write_cmd_packet(&self, scratch: &mut TxScratch, hdr: &CmdHeader) -> Result<()> {
        let mut pkt = [0u8; CMD_HEADER_SIZE];
        packet::encode_cmd(self.cfg.id, hdr, &mut pkt);

        let n = framing::compose_frame(FRAME_CODE, &pkt, &mut scratch.frame)
            .map_err(|_| SdtlError::TxBufferSmall)?;
        self.media.write(&scratch.frame[..n])?;
        self.tx_stat.bytes.fetch_add(n as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Wait for one ACK. A synthetic out-of-band entry is translated to the
    /// active condition; if the condition was already cleared, the entry is
    /// handed through and the caller treats it as unremarkable.
    fn wait_ack(&self, timeout: Duration) -> Result<AckSubHeader> {
        let fifo = self
            .ack_fifo
            .as_ref()
            .ok_or(SdtlError::Internal("ack wait on unreliable channel"))?;

        match fifo.pop_timeout(timeout) {
            Ok(ack) => {
                if ack.code == AckCode::OutBandEvent {
                    self.state.active_condition()?;
                }
                Ok(ack)
            }
            Err(PopError::TimedOut) => Err(SdtlError::Timeout),
            Err(PopError::Lagged) => Err(SdtlError::Internal("ack fifo lagged")),
            Err(PopError::Closed) => Err(SdtlError::Internal("ack fifo closed")),
        }
    }
}

/// Pseudo-random sequence code: the monotonic clock makes repeats across
/// restarts unlikely, the counter separates back-to-back sequences. 0 is
/// reserved as "never seen".
fn generate_seq_code(seq_num: u32) -> u16 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let ns = ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64;

    let mut code = (u64::from(seq_num) + (ns >> 10)) as u16;
    if code == 0 {
        code = code.wrapping_sub(1);
    }
    code
}

/// Classification of a popped fragment against the expected position.
#[derive(Debug, PartialEq, Eq)]
enum RecvClass {
    /// Sequence start.
    First,
    /// Next in-order fragment.
    InOrder,
    /// Retransmit of the last accepted fragment.
    Repeated,
    /// A gap; the sender will retry the missing fragment.
    Missed,
    /// Mid-sequence fragment with no sequence in progress.
    Omit,
}

fn classify(sub: &DataSubHeader, prev: Option<u8>) -> RecvClass {
    match prev {
        None => {
            if sub.flags & data_flags::FIRST_PKT != 0 {
                RecvClass::First
            } else {
                RecvClass::Omit
            }
        }
        Some(prev) => match sub.cnt.wrapping_sub(prev) {
            1 => RecvClass::InOrder,
            0 => RecvClass::Repeated,
            _ => RecvClass::Missed,
        },
    }
}

/// Application handle to one channel.
///
/// Cheap to clone; all methods take `&self`. One in-flight `send_data` and
/// one in-flight `recv_data` per channel; further callers queue internally.
#[derive(Clone)]
pub struct ChannelHandle {
    ch: Arc<Channel>,
}

impl ChannelHandle {
    pub(crate) fn new(ch: Arc<Channel>) -> Self {
        Self { ch }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Channel {
        &self.ch
    }

    /// Channel wire id.
    #[must_use]
    pub fn id(&self) -> u8 {
        self.ch.cfg.id
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.ch.cfg.name
    }

    /// Delivery mode.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.ch.cfg.kind
    }

    /// Largest payload carried by a single fragment on this channel.
    #[must_use]
    pub fn max_payload_size(&self) -> usize {
        self.ch.max_payload_size
    }

    /// Snapshot of the receive-side protocol state.
    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.ch.state.read()
    }

    /// Snapshot of the receive-side state machine position.
    #[must_use]
    pub fn rx_state(&self) -> RxState {
        self.ch.state.read().rx_state
    }

    /// Transmit statistics snapshot.
    #[must_use]
    pub fn tx_stat(&self) -> ChannelTxStat {
        self.ch.tx_stat.snapshot()
    }

    /// Receive statistics snapshot.
    #[must_use]
    pub fn rx_stat(&self) -> ChannelRxStat {
        self.ch.rx_stat.snapshot()
    }

    /// Arm a single-shot timeout for the next `recv_data` call. It bounds the
    /// wait for the first fragment only; once a sequence has begun, the call
    /// blocks until the sequence completes or an out-of-band event fires.
    pub fn recv_arm_timeout(&self, timeout_us: u32) {
        self.ch.armed_timeout_us.store(timeout_us, Ordering::Relaxed);
    }

    /// Non-blocking check of the latched out-of-band conditions.
    pub fn check_reset_condition(&self) -> Result<()> {
        self.ch.state.active_condition()
    }

    /// Clear all latched out-of-band conditions.
    pub fn reset_condition(&self) {
        self.ch.state.alter_cond_flags(0xFF, false);
    }

    /// Send one whole message, fragmenting as needed.
    ///
    /// On a reliable channel this blocks until every fragment is
    /// acknowledged, an out-of-band condition fires, the peer rejects the
    /// sequence, or the configured retry cap is exhausted. On an unreliable
    /// channel it returns once every fragment is written to the media.
    pub fn send_data(&self, data: &[u8]) -> Result<()> {
        let ch = &*self.ch;
        let rel = ch.reliable();
        let mut scratch = ch.tx_lock.lock();

        let seq_code = generate_seq_code(ch.tx_seq_num.load(Ordering::Relaxed));

        if rel {
            if let Some(fifo) = &ch.ack_fifo {
                // Drop stale acknowledgements from prior sequences.
                fifo.flush();
            }
        }

        ch.tx_stat.sequences.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "[SDTL] ch {} tx seq 0x{:04X}: {} bytes",
            ch.cfg.id,
            seq_code,
            data.len()
        );

        let mut flags = data_flags::FIRST_PKT
            | if rel { data_flags::RELIABLE } else { 0 };
        let mut cnt: u8 = 0;
        let mut offset = 0usize;

        loop {
            let dsize = ch.max_payload_size.min(data.len() - offset);
            let last = offset + dsize == data.len();
            if last {
                flags |= data_flags::LAST_PKT;
            }
            let fragment = &data[offset..offset + dsize];

            let mut retries = 0u32;
            loop {
                if rel {
                    ch.state.active_condition()?;
                }
                ch.write_data_packet(&mut scratch, seq_code, cnt, flags, fragment)?;
                if !rel {
                    break;
                }

                match ch.wait_ack(ch.ack_timeout.for_payload(dsize)) {
                    Ok(ack) => match ack.code {
                        AckCode::GotPkt => break,
                        AckCode::Canceled => return Err(SdtlError::RemoteRxCanceled),
                        AckCode::NoReceiver => return Err(SdtlError::RemoteRxNoClient),
                        other => {
                            log::debug!(
                                "[SDTL] ch {} stray ack {:?} for pkt #{}",
                                ch.cfg.id,
                                other,
                                ack.cnt
                            );
                            break;
                        }
                    },
                    Err(SdtlError::Timeout) => {
                        ch.tx_stat.retries.fetch_add(1, Ordering::Relaxed);
                        retries += 1;
                        if let Some(cap) = ch.max_retries {
                            if retries > cap {
                                log::warn!(
                                    "[SDTL] ch {} pkt #{} exhausted {} retries",
                                    ch.cfg.id,
                                    cnt,
                                    cap
                                );
                                return Err(SdtlError::Timeout);
                            }
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            flags &= !data_flags::FIRST_PKT;
            cnt = cnt.wrapping_add(1);
            ch.tx_stat.packets.fetch_add(1, Ordering::Relaxed);
            offset += dsize;
            if last {
                break;
            }
        }

        ch.tx_seq_num.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send an out-of-band command, retransmitting until the peer
    /// acknowledges it. Reliable channels only.
    pub fn send_cmd(&self, cmd_code: CmdCode) -> Result<()> {
        let ch = &*self.ch;
        if !ch.reliable() {
            return Err(SdtlError::InvalidChannelType);
        }
        let mut scratch = ch.tx_lock.lock();

        let hdr = CmdHeader {
            cmd_seq_code: generate_seq_code(ch.tx_cmd_seq_num.load(Ordering::Relaxed)),
            cmd_code,
        };
        log::debug!(
            "[SDTL] ch {} tx cmd {:?} seq 0x{:04X}",
            ch.cfg.id,
            cmd_code,
            hdr.cmd_seq_code
        );

        let mut retries = 0u32;
        loop {
            ch.write_cmd_packet(&mut scratch, &hdr)?;

            match ch.wait_ack(ch.ack_timeout.for_payload(CMD_ACK_SIZE_HINT)) {
                Ok(ack) if ack.code == AckCode::GotCmd => break,
                Ok(_) => {}
                // A command raised locally while ours was in flight still
                // means the peer is being reset; treat as delivered.
                Err(SdtlError::AppReset | SdtlError::AppCancel) => break,
                Err(SdtlError::Timeout) => {
                    retries += 1;
                    if let Some(cap) = ch.max_retries {
                        if retries > cap {
                            return Err(SdtlError::Timeout);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        ch.tx_cmd_seq_num.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Receive one whole message into `out`, returning the byte count.
    ///
    /// Reliable channels acknowledge each accepted fragment. A gap in the
    /// fragment numbering makes a reliable receiver wait for the sender's
    /// retry of the missing fragment; there is no negative acknowledgement.
    pub fn recv_data(&self, out: &mut [u8]) -> Result<usize> {
        let ch = &*self.ch;
        let rel = ch.reliable();
        let _guard = ch.rx_lock.lock();

        if rel {
            let cur = ch.state.read();
            ch.state.set_rx(RxState::WaitData, cur.last_received_seq);
            // Entries from an abandoned receive would confuse classification.
            ch.data_fifo.flush();
        }

        let armed_us = ch.armed_timeout_us.swap(0, Ordering::Relaxed);
        log::debug!(
            "[SDTL] ch {} rx call: buf {} bytes, armed {} us",
            ch.cfg.id,
            out.len(),
            armed_us
        );

        let mut first_pop = true;
        let mut prev: Option<u8> = None;
        let mut offset = 0usize;
        let mut final_seq = 0u16;

        let result = loop {
            if rel {
                if let Err(e) = ch.state.active_condition() {
                    break Err(e);
                }
            }

            let popped = if first_pop && armed_us > 0 {
                ch.data_fifo
                    .pop_timeout(Duration::from_micros(u64::from(armed_us)))
            } else {
                ch.data_fifo.pop()
            };
            first_pop = false;

            let rec = match popped {
                Ok(rec) => rec,
                Err(PopError::TimedOut) => break Err(SdtlError::Timeout),
                Err(PopError::Lagged) => {
                    ch.rx_stat.fifo_overruns.fetch_add(1, Ordering::Relaxed);
                    break Err(SdtlError::RxFifoOverflow);
                }
                Err(PopError::Closed) => break Err(SdtlError::Internal("data fifo closed")),
            };

            if rec.sub.payload_size == 0 {
                // Synthetic out-of-band record. If the condition was cleared
                // in the meantime, the wakeup is moot.
                match ch.state.active_condition() {
                    Err(e) => break Err(e),
                    Ok(()) => continue,
                }
            }

            match classify(&rec.sub, prev) {
                RecvClass::Omit => continue,

                RecvClass::Repeated => {
                    if rel {
                        if let Err(e) = ch.send_ack(rec.sub.cnt, AckCode::GotPkt) {
                            break Err(e);
                        }
                        ch.rx_stat.acks.fetch_add(1, Ordering::Relaxed);
                    }
                    log::debug!("[SDTL] ch {} repeated pkt #{}", ch.cfg.id, rec.sub.cnt);
                }

                RecvClass::Missed => {
                    log::debug!(
                        "[SDTL] ch {} missed pkt: got #{}, prev #{:?}",
                        ch.cfg.id,
                        rec.sub.cnt,
                        prev
                    );
                    if !rel {
                        // No retry is coming; wait for a fresh sequence.
                        prev = None;
                        offset = 0;
                    }
                }

                class @ (RecvClass::First | RecvClass::InOrder) => {
                    if class == RecvClass::First {
                        ch.rx_stat.sequences.fetch_add(1, Ordering::Relaxed);
                        prev = Some(0);
                    }

                    if out.len() - offset < rec.payload.len() {
                        break Err(SdtlError::RxBufferSmall);
                    }

                    if rel {
                        if let Err(e) = ch.send_ack(rec.sub.cnt, AckCode::GotPkt) {
                            break Err(e);
                        }
                        ch.rx_stat.acks.fetch_add(1, Ordering::Relaxed);
                    }

                    out[offset..offset + rec.payload.len()].copy_from_slice(&rec.payload);
                    offset += rec.payload.len();
                    ch.rx_stat.packets.fetch_add(1, Ordering::Relaxed);
                    ch.rx_stat
                        .bytes
                        .fetch_add(rec.payload.len() as u32, Ordering::Relaxed);

                    if class == RecvClass::InOrder {
                        prev = prev.map(|p| p.wrapping_add(1));
                    }
                    final_seq = rec.sub.seq_code;

                    if rec.sub.flags & data_flags::LAST_PKT != 0 {
                        break Ok(offset);
                    }
                }
            }
        };

        if rel {
            match &result {
                Ok(_) => ch.state.set_rx(RxState::SeqDone, final_seq),
                Err(_) => ch.state.set_rx(RxState::RcvCanceled, 0),
            }
        }

        result
    }
}
