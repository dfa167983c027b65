//! Deferred work queue
//!
//! Operations requested from the arrival context that may block, allocate or
//! touch main-loop state are enqueued here and executed later by the main
//! loop, one item per call to [`DeferredConsumer::process_one`].

use std::fmt;

use contracts::CapacityError;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};

/// Work item routed from the arrival context to the main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredWork {
    /// Single test pulse on one finger
    HapticPulse {
        finger: u8,
        amplitude: u8,
        duration_ms: u16,
    },
    /// Two pulses separated by the pulse duration
    HapticDoublePulse {
        finger: u8,
        amplitude: u8,
        duration_ms: u16,
    },
    /// Follower saw a PING, `t1` in leader time
    PingReceived { seq: u32, t1: u64 },
    /// A PONG carrying `t4` arrived; `t1` is looked up by `seq`
    RoundTripCompleted { seq: u32, t2: u64, t3: u64, t4: u64 },
    MacrocycleAcked { seq: u32 },
    /// Peer asked to end the session
    StopSession,
    /// Traffic arrived that carries no other work (duplicates, stray acks)
    LinkActivity,
}

impl DeferredWork {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HapticPulse { .. } => "haptic_pulse",
            Self::HapticDoublePulse { .. } => "haptic_double_pulse",
            Self::PingReceived { .. } => "ping_received",
            Self::RoundTripCompleted { .. } => "round_trip_completed",
            Self::MacrocycleAcked { .. } => "macrocycle_acked",
            Self::StopSession => "stop_session",
            Self::LinkActivity => "link_activity",
        }
    }
}

/// Main-loop side executor of deferred work
pub trait DeferredExecutor {
    fn execute(&mut self, work: DeferredWork);
}

impl<F: FnMut(DeferredWork)> DeferredExecutor for F {
    fn execute(&mut self, work: DeferredWork) {
        self(work)
    }
}

pub fn deferred_queue(capacity: usize) -> (DeferredProducer, DeferredConsumer) {
    let (prod, cons) = HeapRb::<DeferredWork>::new(capacity.max(1)).split();
    (DeferredProducer { inner: prod }, DeferredConsumer { inner: cons })
}

pub struct DeferredProducer {
    inner: HeapProd<DeferredWork>,
}

impl DeferredProducer {
    /// Queue work without blocking; fails when full
    pub fn enqueue(&mut self, work: DeferredWork) -> Result<(), CapacityError> {
        self.inner
            .try_push(work)
            .map_err(|_| CapacityError::full(self.inner.capacity().get()))
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for DeferredProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredProducer")
            .field("occupied", &self.inner.occupied_len())
            .finish()
    }
}

pub struct DeferredConsumer {
    inner: HeapCons<DeferredWork>,
}

impl DeferredConsumer {
    /// Execute at most one queued item; false when the queue was empty
    pub fn process_one<E: DeferredExecutor + ?Sized>(&mut self, executor: &mut E) -> bool {
        match self.inner.try_pop() {
            Some(work) => {
                executor.execute(work);
                true
            }
            None => false,
        }
    }

    pub fn pop(&mut self) -> Option<DeferredWork> {
        self.inner.try_pop()
    }

    pub fn clear(&mut self) -> usize {
        self.inner.clear()
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for DeferredConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredConsumer")
            .field("occupied", &self.inner.occupied_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_one_executes_single_item_in_order() {
        let (mut tx, mut rx) = deferred_queue(8);
        tx.enqueue(DeferredWork::PingReceived { seq: 1, t1: 100 }).unwrap();
        tx.enqueue(DeferredWork::StopSession).unwrap();

        let mut seen = Vec::new();
        let mut exec = |w: DeferredWork| seen.push(w);

        assert!(rx.process_one(&mut exec));
        assert!(rx.process_one(&mut exec));
        assert!(!rx.process_one(&mut exec));

        assert_eq!(
            seen,
            vec![
                DeferredWork::PingReceived { seq: 1, t1: 100 },
                DeferredWork::StopSession
            ]
        );
    }

    #[test]
    fn test_enqueue_fails_when_full() {
        let (mut tx, mut rx) = deferred_queue(8);
        for _ in 0..8 {
            tx.enqueue(DeferredWork::LinkActivity).unwrap();
        }
        let err = tx.enqueue(DeferredWork::StopSession).unwrap_err();
        assert_eq!(err.capacity, 8);

        assert_eq!(rx.clear(), 8);
        assert!(tx.enqueue(DeferredWork::StopSession).is_ok());
        assert_eq!(rx.pop(), Some(DeferredWork::StopSession));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(DeferredWork::LinkActivity.kind(), "link_activity");
        assert_eq!(
            DeferredWork::HapticPulse {
                finger: 0,
                amplitude: 50,
                duration_ms: 50
            }
            .kind(),
            "haptic_pulse"
        );
    }
}
