//! Async FIFO capture: a double-buffered copy of an engine's output.
//!
//! The engine writes into the active half. When the half reaches the flush
//! level (or on an explicit flush) it is marked full, a flush interrupt is
//! raised and writing moves to the other half. The drain worker hands full
//! halves to the capture subscribers and to the [`CaptureTap`], normally the
//! device's software filter. If writing wraps onto a half the worker has
//! not drained yet, that half is dropped and counted as an overflow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use log::{debug, info, warn};
use meson_dvb_types::{AfifoId, DmxId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::AsyncFifoConfig;

/// Receives every drained half, in order.
pub trait CaptureTap: Send + Sync {
    fn captured(&self, fifo: AfifoId, data: &Bytes);
}

enum FifoEvent {
    Drain { half: usize, seq: u64 },
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Half {
    data: Vec<u8>,
    full: bool,
    /// Bumped whenever the half's contents are dropped.
    seq: u64,
}

struct FifoInner {
    initialized: bool,
    source: Option<DmxId>,
    halves: [Half; 2],
    active: usize,
    masked: bool,
    latched: Vec<FifoEvent>,
    sinks: Vec<mpsc::UnboundedSender<Bytes>>,
}

#[derive(Debug, Default)]
pub struct AsyncFifoStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    flushes: AtomicU64,
    overflows: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AsyncFifoSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub flushes: u64,
    pub overflows: u64,
}

impl AsyncFifoStats {
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> AsyncFifoSnapshot {
        AsyncFifoSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

pub struct AsyncFifo {
    id: AfifoId,
    half_len: usize,
    flush_size: usize,
    inner: Mutex<FifoInner>,
    tx: mpsc::UnboundedSender<FifoEvent>,
    stats: AsyncFifoStats,
}

impl AsyncFifo {
    /// Create the FIFO and spawn its drain worker.
    pub(crate) fn new(id: AfifoId, config: &AsyncFifoConfig, tap: Weak<dyn CaptureTap>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let half_len = (config.buf_len / 2).max(1);
        let fifo = Arc::new(Self {
            id,
            half_len,
            flush_size: config.flush_size.clamp(1, half_len),
            inner: Mutex::new(FifoInner {
                initialized: false,
                source: None,
                halves: Default::default(),
                active: 0,
                masked: false,
                latched: Vec::new(),
                sinks: Vec::new(),
            }),
            tx,
            stats: AsyncFifoStats::default(),
        });
        tokio::spawn(run_afifo_worker(Arc::downgrade(&fifo), rx, tap));
        fifo
    }

    fn lock(&self) -> MutexGuard<'_, FifoInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> AfifoId {
        self.id
    }

    pub fn stats(&self) -> &AsyncFifoStats {
        &self.stats
    }

    pub fn source(&self) -> Option<DmxId> {
        self.lock().source
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub(crate) fn init(&self) {
        let mut inner = self.lock();
        inner.initialized = true;
        clear_halves(&mut inner);
        info!("{}: initialized, {} bytes per half", self.id, self.half_len);
    }

    pub(crate) fn deinit(&self) {
        let mut inner = self.lock();
        inner.initialized = false;
        inner.source = None;
        clear_halves(&mut inner);
    }

    pub(crate) fn set_source(&self, source: Option<DmxId>) {
        let mut inner = self.lock();
        if inner.source != source {
            debug!("{}: source {:?}", self.id, source);
            inner.source = source;
            clear_halves(&mut inner);
        }
    }

    /// Forget buffered data after a hardware reset.
    pub(crate) fn hw_reset(&self) {
        let mut inner = self.lock();
        clear_halves(&mut inner);
        inner.latched.clear();
    }

    /// Subscribe to drained halves.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().sinks.push(tx);
        rx
    }

    /// Write engine output into the active half.
    pub(crate) fn fill(&self, mut data: &[u8]) {
        let mut inner = self.lock();
        if !inner.initialized || inner.source.is_none() {
            return;
        }
        self.stats.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
        while !data.is_empty() {
            let active = inner.active;
            let half = &mut inner.halves[active];
            if half.full {
                // The worker is a whole buffer behind: drop the older half.
                let dropped = half.data.len();
                half.data.clear();
                half.full = false;
                half.seq += 1;
                self.stats.overflows.fetch_add(1, Ordering::Relaxed);
                warn!("{}: overflow, {} bytes dropped", self.id, dropped);
            }
            let n = (self.flush_size - half.data.len()).min(data.len());
            half.data.extend_from_slice(&data[..n]);
            data = &data[n..];
            if half.data.len() >= self.flush_size {
                self.hand_off(&mut inner);
            }
        }
    }

    /// Hand the partially filled active half to the worker.
    pub fn flush(&self) {
        let mut inner = self.lock();
        let half = &inner.halves[inner.active];
        if !half.full && !half.data.is_empty() {
            self.hand_off(&mut inner);
        }
    }

    fn hand_off(&self, inner: &mut FifoInner) {
        let current = inner.active;
        inner.halves[current].full = true;
        let seq = inner.halves[current].seq;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.raise(inner, FifoEvent::Drain { half: current, seq });

        inner.active = current ^ 1;
    }

    fn raise(&self, inner: &mut FifoInner, event: FifoEvent) {
        if inner.masked {
            inner.latched.push(event);
        } else if self.tx.send(event).is_err() {
            debug!("{}: drain worker gone", self.id);
        }
    }

    pub(crate) fn mask(&self) {
        self.lock().masked = true;
    }

    pub(crate) fn unmask(&self, forward: bool) {
        let mut inner = self.lock();
        inner.masked = false;
        let latched = std::mem::take(&mut inner.latched);
        if forward {
            for event in latched {
                self.raise(&mut inner, event);
            }
        } else {
            for event in latched {
                if let FifoEvent::Barrier(done) = event {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Wait until the worker has drained everything handed off so far.
    pub async fn drained(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(FifoEvent::Barrier(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn take_half(&self, half: usize, seq: u64) -> Option<(Bytes, Vec<mpsc::UnboundedSender<Bytes>>)> {
        let mut inner = self.lock();
        let h = &mut inner.halves[half];
        if !h.full || h.seq != seq {
            return None;
        }
        let data = Bytes::from(std::mem::take(&mut h.data));
        h.full = false;
        inner.sinks.retain(|s| !s.is_closed());
        Some((data, inner.sinks.clone()))
    }
}

fn clear_halves(inner: &mut FifoInner) {
    for half in inner.halves.iter_mut() {
        half.data.clear();
        half.full = false;
        half.seq += 1;
    }
    inner.active = 0;
}

async fn run_afifo_worker(
    fifo: Weak<AsyncFifo>,
    mut rx: mpsc::UnboundedReceiver<FifoEvent>,
    tap: Weak<dyn CaptureTap>,
) {
    while let Some(event) = rx.recv().await {
        let (half, seq) = match event {
            FifoEvent::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            FifoEvent::Drain { half, seq } => (half, seq),
        };
        let Some(fifo) = fifo.upgrade() else {
            break;
        };
        let Some((data, sinks)) = fifo.take_half(half, seq) else {
            continue;
        };
        fifo.stats
            .bytes_out
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        for sink in sinks {
            let _ = sink.send(data.clone());
        }
        if let Some(tap) = tap.upgrade() {
            tap.captured(fifo.id, &data);
        }
    }
    debug!("async fifo worker exiting");
}
