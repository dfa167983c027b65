//! Cross-context event channel.
//!
//! Moves [`StagedEvent`]s from the asynchronous arrival context into the main
//! loop. Backed by a fixed-capacity `ringbuf` SPSC ring:
//! - the producer writes a slot, then publishes it with a release store of
//!   the write index
//! - the consumer acquires the write index before reading the slot
//!
//! so an event is never observed before its payload is complete. The two
//! halves are distinct, non-cloneable types; single-producer/single-consumer
//! discipline is enforced by ownership.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use contracts::{CapacityError, StagedEvent};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};

/// Counters shared by both halves
#[derive(Debug, Default)]
pub struct ChannelStats {
    staged: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelStats {
    pub fn staged(&self) -> u64 {
        self.staged.load(Ordering::Relaxed)
    }

    /// Events rejected because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a channel holding at most `capacity` unread events
pub fn event_channel(capacity: usize) -> (StagingProducer, StagingConsumer) {
    let (prod, cons) = HeapRb::<StagedEvent>::new(capacity.max(1)).split();
    let stats = Arc::new(ChannelStats::default());
    (
        StagingProducer {
            inner: prod,
            batch_pending: false,
            stats: Arc::clone(&stats),
        },
        StagingConsumer { inner: cons, stats },
    )
}

/// Arrival-context half
pub struct StagingProducer {
    inner: HeapProd<StagedEvent>,
    batch_pending: bool,
    stats: Arc<ChannelStats>,
}

impl StagingProducer {
    /// Mark the next staged event as the start of a new macrocycle
    pub fn begin_batch_marker(&mut self) {
        self.batch_pending = true;
    }

    /// Stage an event without blocking or allocating
    ///
    /// Fails instead of overwriting unread events. A failed first event keeps
    /// the batch marker pending for the next one.
    pub fn stage(&mut self, mut event: StagedEvent) -> Result<(), CapacityError> {
        event.is_first_in_batch |= self.batch_pending;
        match self.inner.try_push(event) {
            Ok(()) => {
                self.batch_pending = false;
                self.stats.staged.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(CapacityError::full(self.inner.capacity().get()))
            }
        }
    }

    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }
}

impl fmt::Debug for StagingProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingProducer")
            .field("occupied", &self.inner.occupied_len())
            .field("batch_pending", &self.batch_pending)
            .finish()
    }
}

/// Main-loop half
pub struct StagingConsumer {
    inner: HeapCons<StagedEvent>,
    stats: Arc<ChannelStats>,
}

impl StagingConsumer {
    pub fn unstage(&mut self) -> Option<StagedEvent> {
        self.inner.try_pop()
    }

    /// Discard everything currently staged
    pub fn clear(&mut self) -> usize {
        self.inner.clear()
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }
}

impl fmt::Debug for StagingConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingConsumer")
            .field("occupied", &self.inner.occupied_len())
            .finish()
    }
}
