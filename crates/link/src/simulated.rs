//! SimulatedLink - one direction of a lossy radio link with its delivery worker

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

use contracts::{ByteSink, LinkConfig, Transport, TransportError};

use crate::error::LinkError;
use crate::metrics::LinkMetrics;

struct InFlight {
    bytes: Bytes,
    deliver_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Shaping {
    latency: Duration,
    jitter_us: u64,
    loss_rate: f64,
}

/// Sending half of a [`SimulatedLink`]
///
/// Cheap to clone; `send` never blocks and never waits for delivery.
#[derive(Clone)]
pub struct LinkTransport {
    name: Arc<str>,
    tx: mpsc::Sender<InFlight>,
    shaping: Shaping,
    max_payload: usize,
    rng: Arc<Mutex<StdRng>>,
    metrics: Arc<LinkMetrics>,
}

impl LinkTransport {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    /// Roll loss and delay for one frame
    fn roll(&self) -> (bool, Duration) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let lost = self.shaping.loss_rate > 0.0 && rng.random_bool(self.shaping.loss_rate);
        let jitter = if self.shaping.jitter_us > 0 {
            rng.random_range(0..=self.shaping.jitter_us)
        } else {
            0
        };
        (lost, self.shaping.latency + Duration::from_micros(jitter))
    }
}

impl Transport for LinkTransport {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_payload {
            self.metrics.inc_oversize();
            return Err(TransportError::PayloadTooLarge {
                len: frame.len(),
                max: self.max_payload,
            });
        }
        if self.tx.is_closed() {
            return Err(TransportError::closed(self.name.as_ref()));
        }

        let (lost, delay) = self.roll();
        if lost {
            self.metrics.inc_sent();
            self.metrics.inc_lost();
            trace!(link = %self.name, len = frame.len(), "frame lost in flight");
            return Ok(());
        }

        let in_flight = InFlight {
            bytes: Bytes::copy_from_slice(frame),
            deliver_at: Instant::now() + delay,
        };
        match self.tx.try_send(in_flight) {
            Ok(()) => {
                self.metrics.inc_sent();
                self.metrics
                    .set_queue_len(self.tx.max_capacity() - self.tx.capacity());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.inc_dropped();
                warn!(link = %self.name, "link queue full, frame dropped");
                Err(TransportError::queue_full(self.name.as_ref()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::closed(self.name.as_ref()))
            }
        }
    }
}

/// One direction of the simulated radio
///
/// Frames sent through [`LinkTransport`] are queued until a receiver is
/// attached; the worker then hands each one to the [`ByteSink`] once its
/// simulated delay has elapsed.
pub struct SimulatedLink {
    transport: LinkTransport,
    rx: Option<mpsc::Receiver<InFlight>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl SimulatedLink {
    pub fn new(name: impl Into<String>, config: &LinkConfig) -> Result<Self, LinkError> {
        Self::build(name.into(), config, StdRng::from_os_rng())
    }

    /// Link with reproducible loss and jitter
    pub fn with_seed(
        name: impl Into<String>,
        config: &LinkConfig,
        seed: u64,
    ) -> Result<Self, LinkError> {
        Self::build(name.into(), config, StdRng::seed_from_u64(seed))
    }

    fn build(name: String, config: &LinkConfig, rng: StdRng) -> Result<Self, LinkError> {
        if !(0.0..1.0).contains(&config.loss_rate) {
            return Err(LinkError::invalid_config(
                name,
                format!("loss_rate {} outside [0, 1)", config.loss_rate),
            ));
        }
        if config.queue_capacity == 0 {
            return Err(LinkError::invalid_config(name, "queue_capacity must be > 0"));
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let transport = LinkTransport {
            name: Arc::from(name),
            tx,
            shaping: Shaping {
                latency: Duration::from_micros(config.latency_us),
                jitter_us: config.jitter_us,
                loss_rate: config.loss_rate,
            },
            max_payload: config.max_payload,
            rng: Arc::new(Mutex::new(rng)),
            metrics: Arc::new(LinkMetrics::new()),
        };
        Ok(Self {
            transport,
            rx: Some(rx),
            shutdown_tx: None,
            worker_handle: None,
        })
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn transport(&self) -> LinkTransport {
        self.transport.clone()
    }

    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        self.transport.metrics()
    }

    /// Start delivering to `sink` from a dedicated task
    pub fn attach<S: ByteSink + 'static>(&mut self, sink: S) -> Result<(), LinkError> {
        let rx = self.rx.take().ok_or_else(|| LinkError::AlreadyAttached {
            link: self.name().to_string(),
        })?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let metrics = Arc::clone(self.metrics());
        let name = self.name().to_string();

        self.worker_handle = Some(tokio::spawn(async move {
            link_worker(sink, rx, shutdown_rx, metrics, name).await;
        }));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stop delivering; frames still in flight are discarded
    #[instrument(name = "link_shutdown", skip(self), fields(link = %self.name()))]
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker_handle.take() {
            if let Err(e) = handle.await {
                error!(link = %self.name(), error = ?e, "Link worker panicked");
            }
        }
        debug!(link = %self.name(), metrics = %self.metrics().snapshot(), "Link shutdown complete");
    }
}

/// Both directions between a leader and a follower
///
/// Returns `(leader_to_follower, follower_to_leader)`.
pub fn link_pair(config: &LinkConfig) -> Result<(SimulatedLink, SimulatedLink), LinkError> {
    Ok((
        SimulatedLink::new("leader->follower", config)?,
        SimulatedLink::new("follower->leader", config)?,
    ))
}

/// Worker task that delivers frames once their delay has elapsed
#[instrument(
    name = "link_worker_loop",
    skip(sink, rx, shutdown, metrics),
    fields(link = %name)
)]
async fn link_worker<S: ByteSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<InFlight>,
    mut shutdown: oneshot::Receiver<()>,
    metrics: Arc<LinkMetrics>,
    name: String,
) {
    debug!(link = %name, "Link worker started");

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = tokio::time::sleep_until(frame.deliver_at) => {}
        }

        metrics.set_queue_len(rx.len());
        sink.on_bytes_received(&frame.bytes);
        metrics.inc_delivered();
    }

    debug!(link = %name, delivered = metrics.delivered(), "Link worker stopped");
}
