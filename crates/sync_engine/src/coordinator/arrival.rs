//! Arrival context
//!
//! [`ArrivalHandler`] is the [`ByteSink`] a transport invokes whenever bytes
//! come in. It never blocks: it frames and parses, stamps keepalive
//! timestamps, answers what needs an immediate reply, and hands everything
//! else to the main loop through the staging channel and the deferred queue.
//! Failures become counters, never panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use contracts::{ByteSink, Clock, Transport};
use tracing::{debug, trace};

use crate::channel::StagingProducer;
use crate::deferred::{DeferredProducer, DeferredWork};
use crate::protocol::{seq_is_newer, Framer, Macrocycle, Message, RESTART_WINDOW};

use super::Role;

/// Diagnostic counters, written only by the arrival context
#[derive(Debug, Default)]
pub struct ArrivalStats {
    messages: AtomicU64,
    macrocycles: AtomicU64,
    events_staged: AtomicU64,
    events_dropped: AtomicU64,
    /// Macrocycles with at least one event not staged
    incomplete_batches: AtomicU64,
    duplicates: AtomicU64,
    restarts: AtomicU64,
    parse_errors: AtomicU64,
    deferred_dropped: AtomicU64,
    reply_failures: AtomicU64,
    unexpected: AtomicU64,
}

macro_rules! counter_getters {
    ($($name:ident),* $(,)?) => {
        impl ArrivalStats {
            $(
                pub fn $name(&self) -> u64 {
                    self.$name.load(Ordering::Relaxed)
                }
            )*
        }
    };
}

counter_getters!(
    messages,
    macrocycles,
    events_staged,
    events_dropped,
    incomplete_batches,
    duplicates,
    restarts,
    parse_errors,
    deferred_dropped,
    reply_failures,
    unexpected,
);

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct ArrivalHandler<C> {
    role: Role,
    clock: C,
    framer: Framer,
    /// Present on the follower only
    staging: Option<StagingProducer>,
    deferred: DeferredProducer,
    transport: Arc<dyn Transport>,
    last_seq: Option<u32>,
    stats: Arc<ArrivalStats>,
}

impl<C: Clock> ArrivalHandler<C> {
    pub(crate) fn new(
        role: Role,
        clock: C,
        max_frame_len: usize,
        staging: Option<StagingProducer>,
        deferred: DeferredProducer,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            role,
            clock,
            framer: Framer::new(max_frame_len),
            staging,
            deferred,
            transport,
            last_seq: None,
            stats: Arc::new(ArrivalStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<ArrivalStats> {
        &self.stats
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn defer(&mut self, work: DeferredWork) {
        if self.deferred.enqueue(work).is_err() {
            bump(&self.stats.deferred_dropped);
            debug!(role = %self.role, kind = work.kind(), "deferred queue full, work dropped");
        }
    }

    fn reply(&self, message: Message) {
        if let Err(e) = self.transport.send(&message.encode()) {
            bump(&self.stats.reply_failures);
            debug!(role = %self.role, kind = message.kind(), error = %e, "reply failed");
        }
    }

    /// New, or far enough behind to mean the leader restarted
    fn accept_sequence(&mut self, seq: u32) -> bool {
        let accept = match self.last_seq {
            None => true,
            Some(last) if seq_is_newer(seq, last) => true,
            Some(last) if last.wrapping_sub(seq) > RESTART_WINDOW => {
                bump(&self.stats.restarts);
                debug!(seq, last, "sequence jumped back, treating as leader restart");
                true
            }
            Some(_) => false,
        };
        if accept {
            self.last_seq = Some(seq);
        }
        accept
    }

    fn on_macrocycle(&mut self, mc: Macrocycle) {
        if self.staging.is_none() {
            bump(&self.stats.unexpected);
            return;
        }
        if !self.accept_sequence(mc.seq) {
            bump(&self.stats.duplicates);
            self.reply(Message::MacrocycleAck { seq: mc.seq });
            self.defer(DeferredWork::LinkActivity);
            return;
        }

        bump(&self.stats.macrocycles);
        let mut dropped = 0u64;
        if let Some(staging) = self.staging.as_mut() {
            if !mc.is_empty() {
                staging.begin_batch_marker();
            }
            for index in 0..mc.len() {
                let staged = mc.staged(index).map(|event| staging.stage(event));
                match staged {
                    Some(Ok(())) => bump(&self.stats.events_staged),
                    _ => {
                        bump(&self.stats.events_dropped);
                        dropped += 1;
                    }
                }
            }
        }

        // Only a fully staged batch is acknowledged
        if dropped > 0 {
            bump(&self.stats.incomplete_batches);
            debug!(
                seq = mc.seq,
                dropped,
                events = mc.len(),
                "macrocycle only partly staged, not acknowledged"
            );
        } else {
            trace!(seq = mc.seq, events = mc.len(), "macrocycle staged");
            self.reply(Message::MacrocycleAck { seq: mc.seq });
        }
        self.defer(DeferredWork::LinkActivity);
    }

    fn dispatch(&mut self, message: Message, arrived_at: u64) {
        match (self.role, message) {
            (_, Message::Macrocycle(mc)) => self.on_macrocycle(mc),
            (Role::Follower, Message::Ping { seq, t1 }) => {
                let t3 = self.clock.now_us();
                self.reply(Message::Pong {
                    seq,
                    t2: arrived_at,
                    t3,
                    t4: None,
                });
                self.defer(DeferredWork::PingReceived { seq, t1 });
            }
            (Role::Leader, Message::Pong { seq, t2, t3, t4: None }) => {
                self.defer(DeferredWork::RoundTripCompleted {
                    seq,
                    t2,
                    t3,
                    t4: arrived_at,
                });
            }
            (Role::Follower, Message::Pong { seq, t2, t3, t4: Some(t4) }) => {
                self.defer(DeferredWork::RoundTripCompleted { seq, t2, t3, t4 });
            }
            (Role::Leader, Message::MacrocycleAck { seq }) => {
                self.defer(DeferredWork::MacrocycleAcked { seq });
            }
            (Role::Follower, Message::Stop { .. }) => self.defer(DeferredWork::StopSession),
            (
                Role::Follower,
                Message::Pulse {
                    finger,
                    amplitude,
                    duration_ms,
                    count,
                },
            ) => {
                let work = if count >= 2 {
                    DeferredWork::HapticDoublePulse {
                        finger,
                        amplitude,
                        duration_ms,
                    }
                } else {
                    DeferredWork::HapticPulse {
                        finger,
                        amplitude,
                        duration_ms,
                    }
                };
                self.defer(work);
            }
            (role, other) => {
                bump(&self.stats.unexpected);
                trace!(%role, kind = other.kind(), "unexpected message ignored");
                self.defer(DeferredWork::LinkActivity);
            }
        }
    }
}

impl<C: Clock> ByteSink for ArrivalHandler<C> {
    fn on_bytes_received(&mut self, bytes: &[u8]) {
        let arrived_at = self.clock.now_us();
        self.framer.push(bytes);
        while let Some(result) = self.framer.next_message() {
            match result {
                Ok(message) => {
                    bump(&self.stats.messages);
                    self.dispatch(message, arrived_at);
                }
                Err(e) => {
                    bump(&self.stats.parse_errors);
                    debug!(role = %self.role, error = %e, "dropping malformed frame");
                }
            }
        }
    }
}
