//! Recyclable frame buffers shared between the producer and the writer thread
//!
//! Every buffer lives in exactly one place: the free list, the pending-write
//! queue, the writer, or the hands of whoever last called `get_buffer`. Moving
//! a `FrameBuffer` by value is the only way to hand it over, so the compiler
//! enforces the single-owner rule and only the queues need the lock.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::SampleMetadata;
use crate::pipeline::writer::{self, FramePersister};
use crate::PoolConfig;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// What `shutdown` does with buffers still waiting to be written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Writer keeps going until the pending queue is empty, then exits
    #[default]
    Drain,
    /// Pending buffers go back to the free list unwritten
    Discard,
}

/// One encoded frame plus the metadata needed to persist it
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    pool: u64,
    pub camera: u32,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    /// Tag of the ad-hoc capture request this frame answers, if any
    pub one_shot: Option<u32>,
}

impl FrameBuffer {
    fn with_capacity(bytes: usize, pool: u64) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            pool,
            camera: 0,
            timestamp: DateTime::<Utc>::default(),
            sequence: 0,
            one_shot: None,
        }
    }

    /// Replace the contents with a copy of `src`, reusing the allocation
    pub fn store(&mut self, src: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(src);
    }

    pub fn stamp(&mut self, meta: &SampleMetadata, sequence: u64, one_shot: Option<u32>) {
        self.camera = meta.camera;
        self.timestamp = meta.timestamp;
        self.sequence = sequence;
        self.one_shot = one_shot;
    }

    /// Drop the payload and metadata but keep the backing storage
    pub fn clear(&mut self) {
        self.data.clear();
        self.camera = 0;
        self.timestamp = DateTime::<Utc>::default();
        self.sequence = 0;
        self.one_shot = None;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot.is_some()
    }
}

/// Point-in-time view of where the pool's buffers are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers ever created by this pool
    pub allocated: usize,
    pub free: usize,
    pub pending: usize,
    /// 1 while the writer holds a buffer
    pub writing: usize,
    /// Held by producers between `get_buffer` and `save`
    pub checked_out: usize,
    pub on_demand_allocations: u64,
    pub saved: u64,
    pub written: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct Counters {
    on_demand_allocations: AtomicU64,
    saved: AtomicU64,
    written: AtomicU64,
    write_failures: AtomicU64,
}

struct PoolState {
    id: u64,
    free: Vec<FrameBuffer>,
    pending: VecDeque<FrameBuffer>,
    allocated: usize,
    bytes_hint: usize,
    writing: bool,
    should_quit: bool,
}

impl PoolState {
    fn take_free(&mut self, counters: &Counters) -> FrameBuffer {
        if let Some(buffer) = self.free.pop() {
            return buffer;
        }
        self.allocated += 1;
        counters.on_demand_allocations.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("grabber_buffers_allocated").set(self.allocated as f64);
        debug!(allocated = self.allocated, "free list empty, allocated frame buffer");
        FrameBuffer::with_capacity(self.bytes_hint, self.id)
    }

    /// Buffers handed out by another pool are never adopted
    fn owns(&self, buffer: &FrameBuffer) -> bool {
        if buffer.pool == self.id {
            return true;
        }
        warn!(pool = self.id, owner = buffer.pool, "foreign frame buffer ignored");
        false
    }

    fn enqueue(&mut self, buffer: FrameBuffer, counters: &Counters) {
        if !self.owns(&buffer) {
            return;
        }
        if self.should_quit {
            // writer is gone or leaving; keep the buffer but drop the frame
            warn!(sequence = buffer.sequence, "pool shut down, frame dropped");
            self.recycle(buffer);
            return;
        }
        self.pending.push_back(buffer);
        counters.saved.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("grabber_pending_writes").set(self.pending.len() as f64);
    }

    fn recycle(&mut self, mut buffer: FrameBuffer) {
        buffer.clear();
        self.free.push(buffer);
    }
}

/// State shared by the pool handle and its writer thread
pub(crate) struct Shared {
    state: Mutex<PoolState>,
    cond: Condvar,
    counters: CachePadded<Counters>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // buffers are moved whole under the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a buffer is pending or shutdown was requested.
    ///
    /// Returns `None` once quitting with nothing left to write.
    pub(crate) fn next_pending(&self) -> Option<FrameBuffer> {
        let mut state = self
            .cond
            .wait_while(self.lock(), |s| s.pending.is_empty() && !s.should_quit)
            .unwrap_or_else(PoisonError::into_inner);

        let buffer = state.pending.pop_front()?;
        state.writing = true;
        metrics::gauge!("grabber_pending_writes").set(state.pending.len() as f64);
        Some(buffer)
    }

    /// Return a buffer the writer has finished with
    pub(crate) fn finish_write(&self, buffer: FrameBuffer, ok: bool) {
        if ok {
            self.counters.written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.lock();
        state.recycle(buffer);
        state.writing = false;
        drop(state);
        self.cond.notify_all();
    }
}

/// Buffer pool with its dedicated writer thread.
///
/// Frames are persisted in the order they were saved. `get_buffer` never
/// blocks on I/O and never fails: when the free list is empty it allocates,
/// so memory grows under sustained overload instead of stalling the producer.
pub struct BufferPool {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    policy: ShutdownPolicy,
}

impl BufferPool {
    /// Start the writer thread with an empty free list
    pub fn start(
        persister: Box<dyn FramePersister>,
        policy: ShutdownPolicy,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                free: Vec::new(),
                pending: VecDeque::new(),
                allocated: 0,
                bytes_hint: 0,
                writing: false,
                should_quit: false,
            }),
            cond: Condvar::new(),
            counters: CachePadded::new(Counters::default()),
        });

        let handle = writer::spawn(Arc::clone(&shared), persister)?;
        info!(?policy, "buffer pool started");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            policy,
        })
    }

    /// Start the pool and pre-reserve the configured buffers
    pub fn from_config(
        config: &PoolConfig,
        persister: Box<dyn FramePersister>,
    ) -> std::io::Result<Self> {
        let pool = Self::start(persister, config.shutdown)?;
        pool.reserve(config.reserve_buffers, config.buffer_bytes_hint);
        Ok(pool)
    }

    /// Pre-allocate `count` buffers with `bytes_hint` bytes reserved each.
    ///
    /// The hint also sizes buffers allocated on demand later.
    #[instrument(skip(self))]
    pub fn reserve(&self, count: usize, bytes_hint: usize) {
        let mut state = self.shared.lock();
        let id = state.id;
        state
            .free
            .extend((0..count).map(|_| FrameBuffer::with_capacity(bytes_hint, id)));
        state.bytes_hint = bytes_hint;
        state.allocated += count;
        metrics::gauge!("grabber_buffers_allocated").set(state.allocated as f64);
        debug!(allocated = state.allocated, "reserved frame buffers");
    }

    /// Take a buffer off the free list, allocating one if it is empty
    pub fn get_buffer(&self) -> FrameBuffer {
        self.shared.lock().take_free(&self.shared.counters)
    }

    /// Queue `buffer` for writing
    pub fn save(&self, buffer: FrameBuffer) {
        self.shared.lock().enqueue(buffer, &self.shared.counters);
        self.shared.cond.notify_all();
    }

    /// Queue the filled buffer, then replace it with a free one, under a single lock
    pub fn save_and_get_buffer(&self, buffer: &mut FrameBuffer) {
        let mut state = self.shared.lock();
        let id = state.id;
        let filled = mem::replace(buffer, FrameBuffer::with_capacity(0, id));
        state.enqueue(filled, &self.shared.counters);
        *buffer = state.take_free(&self.shared.counters);
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Hand back a buffer without writing it
    pub fn release(&self, buffer: FrameBuffer) {
        let mut state = self.shared.lock();
        if state.owns(&buffer) {
            state.recycle(buffer);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let writing = usize::from(state.writing);
        let counters = &self.shared.counters;
        PoolStats {
            allocated: state.allocated,
            free: state.free.len(),
            pending: state.pending.len(),
            writing,
            checked_out: state
                .allocated
                .saturating_sub(state.free.len() + state.pending.len() + writing),
            on_demand_allocations: counters.on_demand_allocations.load(Ordering::Relaxed),
            saved: counters.saved.load(Ordering::Relaxed),
            written: counters.written.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Block until every saved buffer has been written and recycled
    pub fn wait_idle(&self) {
        let _state = self
            .shared
            .cond
            .wait_while(self.shared.lock(), |s| !s.pending.is_empty() || s.writing)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.policy
    }

    /// Stop the writer according to the shutdown policy and join it.
    ///
    /// A write already in progress always runs to completion. Safe to call
    /// more than once; frames saved afterwards are dropped.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        {
            let mut state = self.shared.lock();
            if self.policy == ShutdownPolicy::Discard {
                let discarded = state.pending.len();
                while let Some(buffer) = state.pending.pop_front() {
                    state.recycle(buffer);
                }
                if discarded > 0 {
                    warn!(discarded, "discarding pending frames on shutdown");
                }
            }
            state.should_quit = true;
        }
        self.shared.cond.notify_all();

        if handle.join().is_err() {
            warn!("frame writer thread panicked");
        }
        info!(stats = ?self.stats(), "buffer pool stopped");
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
