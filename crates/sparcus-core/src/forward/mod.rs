//! Forwarding of writes to downstream sinks.
//!
//! Every write is pushed to a metrics line-protocol sink ([`graphite`]) and
//! a pub/sub bus ([`mqtt`]). Forwarding is fire-and-forget: the request
//! path only enqueues through [`ForwardQueue`], which keeps a bounded queue
//! and a worker thread per sink. Sink failures are logged and counted,
//! never retried, and never reach the HTTP caller.

pub mod graphite;
pub mod mqtt;

pub use graphite::GraphiteForwarder;
pub use mqtt::{MqttForwarder, MqttSettings};

use sparcus_common::{ReadingKey, RequestPath};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::daemon::metrics::SparcusMetrics;

/// Errors from a single forwarding attempt.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("cannot resolve {sink} address {addr}: {source}")]
    Resolve {
        sink: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {sink} at {addr}: {source}")]
    Connect {
        sink: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write to {sink}: {source}")]
    Write {
        sink: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("mqtt client error: {0}")]
    Mqtt(String),
}

/// One write, as seen by the sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardUpdate {
    pub key: ReadingKey,
    pub path: RequestPath,
    /// Value sent to the metrics sink (the sentinel `1` when none was given).
    pub metric_value: String,
    /// Value exactly as submitted; the pub/sub payload.
    pub raw_value: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// A downstream sink.
pub trait Forwarder: Send + Sync {
    /// Short sink name for logs and metric labels.
    fn name(&self) -> &'static str;

    fn forward(&self, update: &ForwardUpdate) -> Result<(), ForwardError>;
}

/// One sink's bounded queue and the worker draining it.
struct SinkLane {
    name: &'static str,
    sender: SyncSender<ForwardUpdate>,
    worker: thread::JoinHandle<()>,
}

impl SinkLane {
    fn start(
        forwarder: Box<dyn Forwarder>,
        capacity: usize,
        metrics: SparcusMetrics,
    ) -> std::io::Result<Self> {
        let name = forwarder.name();
        let (sender, receiver) = mpsc::sync_channel::<ForwardUpdate>(capacity.max(1));
        let worker = thread::Builder::new()
            .name(format!("sparcus-forward-{name}"))
            .spawn(move || {
                for update in receiver {
                    match forwarder.forward(&update) {
                        Ok(()) => trace!(sink = name, key = %update.key, "forwarded"),
                        Err(e) => {
                            warn!(sink = name, key = %update.key, error = %e, "forwarding failed");
                            metrics.record_forward_error(name);
                        }
                    }
                }
                debug!(sink = name, "forward queue closed");
            })?;

        Ok(Self {
            name,
            sender,
            worker,
        })
    }
}

/// Fans each update out to one bounded queue per sink. Every sink has its
/// own worker thread, so a stalled sink only ever fills its own queue.
pub struct ForwardQueue {
    lanes: Vec<SinkLane>,
    metrics: SparcusMetrics,
}

impl ForwardQueue {
    /// Start one worker per forwarder, each with a queue of `capacity`.
    /// With no forwarders, no thread is started and [`push`](Self::push)
    /// does nothing.
    pub fn start(
        forwarders: Vec<Box<dyn Forwarder>>,
        capacity: usize,
        metrics: SparcusMetrics,
    ) -> std::io::Result<Self> {
        if forwarders.is_empty() {
            info!("no forwarders configured");
        } else {
            let names: Vec<&str> = forwarders.iter().map(|f| f.name()).collect();
            info!(sinks = ?names, capacity, "starting forward queues");
        }

        let mut queue = Self {
            lanes: Vec::with_capacity(forwarders.len()),
            metrics,
        };
        for forwarder in forwarders {
            // On failure, dropping `queue` closes the queues already started.
            let lane = SinkLane::start(forwarder, capacity, queue.metrics.clone())?;
            queue.lanes.push(lane);
        }
        Ok(queue)
    }

    /// Enqueue on every sink without blocking. Returns how many sinks
    /// accepted the update.
    pub fn push(&self, update: ForwardUpdate) -> usize {
        let mut accepted = 0;
        for lane in &self.lanes {
            match lane.sender.try_send(update.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(update)) => {
                    warn!(sink = lane.name, key = %update.key, "forward queue full, dropping update");
                    self.metrics.record_forward_dropped(lane.name);
                }
                Err(TrySendError::Disconnected(update)) => {
                    warn!(sink = lane.name, key = %update.key, "forward worker gone, dropping update");
                    self.metrics.record_forward_dropped(lane.name);
                }
            }
        }
        accepted
    }

    /// Close every queue and wait for queued updates to be sent.
    pub fn shutdown(self) {
        let workers: Vec<_> = self
            .lanes
            .into_iter()
            .map(|lane| {
                drop(lane.sender);
                (lane.name, lane.worker)
            })
            .collect();
        for (name, worker) in workers {
            if worker.join().is_err() {
                warn!(sink = name, "forward worker panicked");
            }
        }
    }
}
