// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport service lifecycle and the process-wide service registry.
//!
//! A service owns one medium and multiplexes up to `max_channels` channels
//! over it. Channels are created before `start`; `start` spawns the RX
//! dispatcher thread and publishes the service under its name; `stop` raises
//! the stop flag, closes the medium to unblock the dispatcher, joins the
//! thread and closes every channel FIFO so blocked application calls return.
//!
//! The registry is a library-scoped name table: consumers that only know a
//! service by name (the bus-replication driver) resolve it with
//! [`SdtlService::lookup`] any time after `start`. The table holds weak
//! references, so it never keeps a service alive on its own: dropping the
//! last application handle of a running service performs the same teardown
//! as an explicit `stop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::channel::{Channel, ChannelConfig, ChannelHandle};
use crate::config::SdtlConfig;
use crate::error::{Result, SdtlError};
use crate::media::Media;
use crate::rx::{self, ServiceRxStat, ServiceRxStatAtomic};
use crate::state::RxState;

fn registry() -> &'static DashMap<String, Weak<ServiceInner>> {
    static REGISTRY: OnceLock<DashMap<String, Weak<ServiceInner>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

pub(crate) struct ServiceInner {
    name: String,
    cfg: SdtlConfig,
    media: Arc<dyn Media>,
    // Shared with the RX thread as individual handles; the thread must not
    // hold the service itself alive, or drop-teardown could never run.
    channels: Arc<RwLock<Vec<Arc<Channel>>>>,
    rx_stat: Arc<ServiceRxStatAtomic>,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceInner {
    /// The teardown sequence shared by `stop` and `Drop`: raise the stop
    /// flag, close the medium to unblock the dispatcher, join it, close the
    /// channel FIFOs so blocked application calls return, deregister.
    fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.media.close();

        if let Some(handle) = self.rx_thread.lock().take() {
            if handle.join().is_err() {
                log::warn!("[SDTL] {}: rx thread panicked", self.name);
            }
        }

        for channel in self.channels.read().iter() {
            channel.close();
        }

        // Only remove our own registration; a successor service may already
        // have claimed the name.
        registry().remove_if(&self.name, |_, entry| std::ptr::eq(entry.as_ptr(), self));
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            log::debug!("[SDTL] {}: dropped while running, stopping", self.name);
            self.shutdown();
        }
    }
}

/// One transport service: a medium, its channels and the RX dispatcher.
///
/// Cheap to clone; clones share the same service. Stopping is terminal — a
/// stopped service is deregistered and cannot be restarted. Dropping the
/// last handle of a running service runs the same teardown as [`stop`].
///
/// [`stop`]: Self::stop
#[derive(Clone)]
pub struct SdtlService {
    inner: Arc<ServiceInner>,
}

impl SdtlService {
    /// Create a service over an already-opened medium.
    ///
    /// The name must be unique process-wide; it is claimed at [`start`]
    /// (checked here as a fast-fail convenience).
    ///
    /// [`start`]: Self::start
    pub fn new(name: &str, cfg: SdtlConfig, media: Arc<dyn Media>) -> Result<Self> {
        if let Some(entry) = registry().get(name) {
            // A dead entry is a leftover of a dropped service; the name is free.
            if entry.value().upgrade().is_some() {
                return Err(SdtlError::ServiceExists);
            }
        }

        Ok(Self {
            inner: Arc::new(ServiceInner {
                name: name.to_owned(),
                cfg,
                media,
                channels: Arc::new(RwLock::new(Vec::new())),
                rx_stat: Arc::new(ServiceRxStatAtomic::default()),
                stop: Arc::new(AtomicBool::new(false)),
                running: AtomicBool::new(false),
                rx_thread: Mutex::new(None),
            }),
        })
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Service-wide MTU.
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.inner.cfg.mtu
    }

    /// Aggregate receive statistics.
    #[must_use]
    pub fn rx_stat(&self) -> ServiceRxStat {
        self.inner.rx_stat.snapshot()
    }

    /// Resolve a started service by name.
    ///
    /// The registry holds weak references; a service whose last handle was
    /// dropped is gone even if its name has not been cleaned up yet.
    #[must_use]
    pub fn lookup(name: &str) -> Option<SdtlService> {
        registry()
            .get(name)
            .and_then(|entry| entry.value().upgrade())
            .map(|inner| SdtlService { inner })
    }

    /// Register a channel. Channels are created before `start`.
    pub fn create_channel(&self, cfg: ChannelConfig) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) {
            return Err(SdtlError::Internal("channels must be created before start"));
        }

        let mut channels = self.inner.channels.write();
        if channels
            .iter()
            .any(|c| c.id() == cfg.id || c.name() == cfg.name)
        {
            return Err(SdtlError::ChannelExists);
        }
        if channels.len() >= self.inner.cfg.max_channels {
            return Err(SdtlError::Internal("channel table full"));
        }

        let channel = Channel::new(
            cfg,
            self.inner.cfg.mtu,
            self.inner.cfg.fifo_depth,
            self.inner.cfg.ack_timeout.clone(),
            self.inner.cfg.max_retries,
            Arc::clone(&self.inner.media),
        )?;
        log::debug!(
            "[SDTL] {}: channel \"{}\" created (id {}, {})",
            self.inner.name,
            channel.name(),
            channel.id(),
            if channel.reliable() { "reliable" } else { "unreliable" }
        );
        channels.push(channel);
        Ok(())
    }

    /// Open an application handle to a channel by name.
    pub fn channel(&self, name: &str) -> Result<ChannelHandle> {
        self.inner
            .channels
            .read()
            .iter()
            .find(|c| c.name() == name)
            .map(|c| ChannelHandle::new(Arc::clone(c)))
            .ok_or(SdtlError::NoChannelLocal)
    }

    /// Publish the service and spawn the RX dispatcher thread.
    pub fn start(&self) -> Result<()> {
        if self.inner.stop.load(Ordering::Acquire) {
            return Err(SdtlError::Internal("service stopped"));
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(SdtlError::Internal("service already started"));
        }

        match registry().entry(self.inner.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().upgrade().is_some() {
                    self.inner.running.store(false, Ordering::Release);
                    return Err(SdtlError::ServiceExists);
                }
                // Stale registration of a dropped predecessor.
                entry.insert(Arc::downgrade(&self.inner));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(&self.inner));
            }
        }

        // Prime reliable channels into their resting state.
        for channel in self.inner.channels.read().iter() {
            if channel.reliable() {
                channel.state.set_rx(RxState::Idle, 0);
            }
        }

        // The dispatcher thread holds its own handles, never the service:
        // dropping the last service handle must be able to tear it down.
        let name = self.inner.name.clone();
        let media = Arc::clone(&self.inner.media);
        let channels = Arc::clone(&self.inner.channels);
        let rx_stat = Arc::clone(&self.inner.rx_stat);
        let stop = Arc::clone(&self.inner.stop);
        let mtu = self.inner.cfg.mtu;

        let handle = thread::Builder::new()
            .name(format!("sdtl-rx-{}", self.inner.name))
            .spawn(move || {
                rx::rx_loop(&name, &media, &channels, &rx_stat, &stop, mtu);
            })
            .map_err(|e| {
                log::warn!("[SDTL] {}: rx thread spawn failed: {}", self.inner.name, e);
                let inner = &*self.inner;
                registry()
                    .remove_if(&inner.name, |_, entry| std::ptr::eq(entry.as_ptr(), inner));
                self.inner.running.store(false, Ordering::Release);
                SdtlError::Internal("rx thread spawn failed")
            })?;

        *self.inner.rx_thread.lock() = Some(handle);
        log::info!("[SDTL] {}: started", self.inner.name);
        Ok(())
    }

    /// Stop the dispatcher, close every channel and deregister the service.
    ///
    /// Pending application calls observe their FIFOs closing and return.
    /// Safe to call once `start` has returned; terminal.
    pub fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Err(SdtlError::Internal("service not started"));
        }

        self.inner.shutdown();
        log::info!("[SDTL] {}: stopped", self.inner.name);
        Ok(())
    }
}
