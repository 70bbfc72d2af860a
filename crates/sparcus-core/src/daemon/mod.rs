//! The ingestion pipeline.
//!
//! A write (`set`) flows through:
//!
//! 1. **Store**: the value is recorded in the [`TimeSeriesStore`].
//! 2. **Forward**: the update is queued for the metrics and pub/sub sinks.
//! 3. **Resolve**: handlers whose directory is an ancestor of the request
//!    path are found.
//! 4. **Dispatch**: each handler runs in turn and its outcome is appended
//!    to the [`EventLog`].
//!
//! A read (`get`) touches the store only. The [`Daemon`] owns all shared
//! state; the HTTP layer holds it behind an `Arc`.

pub mod metrics;

use chrono::{DateTime, Utc};
use sparcus_common::{Error, ReadingKey, ReadingValue, RequestPath, Result};
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::{DispatchOutcome, TriggerContext, TriggerDispatcher};
use crate::events::{Event, EventLog};
use crate::forward::{ForwardQueue, ForwardUpdate, Forwarder, GraphiteForwarder, MqttForwarder};
use crate::handlers::{HandlerDescriptor, HandlerResolver};
use crate::logging::truncate_for_log;
use crate::persist::{PersistError, PersistenceGateway, RestoreSummary};
use crate::store::{TimeSeriesStore, UpdateKind};

use metrics::SparcusMetrics;

/// Value recorded when a write carries no value.
pub const MISSING_VALUE_SENTINEL: &str = "1";

/// Longest value echoed into log lines.
const LOG_VALUE_LIMIT: usize = 120;

/// Errors building the daemon.
#[derive(Debug, ThisError)]
pub enum DaemonError {
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("failed to start forwarding: {0}")]
    Forward(#[from] std::io::Error),
}

/// Result of one write.
#[derive(Debug, Clone)]
pub struct SetOutcome {
    pub key: ReadingKey,
    /// Value as submitted; empty when none was given.
    pub raw_value: String,
    pub kind: UpdateKind,
    /// Events appended by this write, in dispatch order.
    pub events: Vec<Event>,
}

impl SetOutcome {
    pub fn value_provided(&self) -> bool {
        !self.raw_value.is_empty()
    }

    /// Plain-text confirmation returned to the caller.
    pub fn confirmation(&self) -> String {
        if self.value_provided() {
            format!("Set: {} to '{}'", self.key, self.raw_value)
        } else {
            format!("Set: {} no value provided", self.key)
        }
    }
}

/// Shared service state and the write/read pipeline.
pub struct Daemon {
    config: Config,
    store: TimeSeriesStore,
    events: EventLog,
    resolver: HandlerResolver,
    dispatcher: TriggerDispatcher,
    forward: ForwardQueue,
    persistence: PersistenceGateway,
    metrics: SparcusMetrics,
}

impl Daemon {
    /// Build a daemon with explicit forwarders.
    pub fn new(
        config: Config,
        forwarders: Vec<Box<dyn Forwarder>>,
        metrics: SparcusMetrics,
    ) -> std::result::Result<Self, DaemonError> {
        let forward = ForwardQueue::start(forwarders, config.forward_queue_capacity, metrics.clone())?;
        Ok(Self {
            store: TimeSeriesStore::new(),
            events: EventLog::new(config.max_events),
            resolver: HandlerResolver::new(&config.handlers_path),
            dispatcher: TriggerDispatcher::new(config.dispatch_config()),
            persistence: PersistenceGateway::new(&config.data_file),
            forward,
            metrics,
            config,
        })
    }

    /// Build a daemon with the sinks the config enables.
    pub fn from_config(config: Config) -> std::result::Result<Self, DaemonError> {
        let metrics = SparcusMetrics::new()?;
        let mut forwarders: Vec<Box<dyn Forwarder>> = Vec::new();

        if config.graphite_enabled() {
            info!(host = %config.graphite_host, port = config.graphite_port, "graphite forwarding enabled");
            forwarders.push(Box::new(GraphiteForwarder::new(
                config.graphite_host.clone(),
                config.graphite_port,
                config.forward_timeout(),
            )));
        }

        if config.mqtt_enabled() {
            match MqttForwarder::connect(&config.mqtt_settings()) {
                Ok(mqtt) => forwarders.push(Box::new(mqtt)),
                Err(e) => warn!(error = %e, "mqtt forwarding disabled"),
            }
        }

        Self::new(config, forwarders, metrics)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &TimeSeriesStore {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn resolver(&self) -> &HandlerResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &SparcusMetrics {
        &self.metrics
    }

    /// Record a write and run its side effects.
    ///
    /// A missing or empty value stores the numeric sentinel
    /// [`MISSING_VALUE_SENTINEL`]; handlers and the pub/sub sink still see
    /// the empty raw value. Forwarding and dispatch failures are logged and
    /// recorded, never returned.
    pub fn set(&self, path: &RequestPath, value: Option<&str>) -> SetOutcome {
        let key = path.key();
        let raw_value = value.unwrap_or_default().to_string();
        let stored_value = if raw_value.is_empty() {
            MISSING_VALUE_SENTINEL
        } else {
            raw_value.as_str()
        };

        let kind = self.store.update(&key, stored_value);
        self.metrics.record_update(kind.as_str());
        info!(
            key = %key,
            value = %truncate_for_log(&raw_value, LOG_VALUE_LIMIT),
            kind = kind.as_str(),
            "reading stored"
        );

        self.forward.push(ForwardUpdate {
            key: key.clone(),
            path: path.clone(),
            metric_value: stored_value.to_string(),
            raw_value: raw_value.clone(),
            timestamp: Utc::now().timestamp(),
        });

        let events = match self.resolver.resolve(path) {
            Ok(handlers) if handlers.is_empty() => Vec::new(),
            Ok(handlers) => {
                let ctx = TriggerContext::build(&self.store, path, &raw_value);
                let events = self.dispatcher.dispatch(&handlers, &ctx, &self.events);
                for event in &events {
                    self.metrics.record_dispatch(
                        DispatchOutcome::of(event).as_str(),
                        event.duration_ms as f64 / 1000.0,
                    );
                }
                events
            }
            Err(e) => {
                warn!(key = %key, error = %e, "handler scan failed, skipping dispatch");
                Vec::new()
            }
        };

        self.metrics.set_sizes(self.store.len(), self.events.len());
        debug!(key = %key, handlers = events.len(), "write complete");

        SetOutcome {
            key,
            raw_value,
            kind,
            events,
        }
    }

    /// Read the latest value, or an average when `average` is given.
    ///
    /// A non-numeric `average` is [`Error::InvalidInput`].
    pub fn get(
        &self,
        path: &RequestPath,
        average: Option<&str>,
    ) -> Result<(ReadingValue, DateTime<Utc>)> {
        let key = path.key();
        let (kind, window) = match average.filter(|a| !a.is_empty()) {
            None => ("latest", None),
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(count) => ("average", Some(count)),
                Err(_) => {
                    self.metrics.record_read("average", "invalid");
                    return Err(Error::InvalidInput(format!(
                        "average must be a positive integer, got '{raw}'"
                    )));
                }
            },
        };

        let result = self.store.read(&key, window);
        let status = match &result {
            Ok(_) => "ok",
            Err(Error::NotFound { .. }) => "not_found",
            Err(_) => "invalid",
        };
        self.metrics.record_read(kind, status);
        result
    }

    /// Handler descriptors for the admin listing; empty when the root is
    /// unreadable.
    pub fn describe_handlers(&self) -> Vec<HandlerDescriptor> {
        self.resolver.describe().unwrap_or_else(|e| {
            warn!(error = %e, "cannot list handlers");
            Vec::new()
        })
    }

    /// Load saved state into the store and event log.
    pub fn restore(&self) -> RestoreSummary {
        let summary = self.persistence.restore(&self.store, &self.events);
        self.metrics.set_sizes(self.store.len(), self.events.len());
        info!(
            keys = summary.keys,
            events = summary.events,
            skipped = summary.skipped,
            "state restored"
        );
        summary
    }

    /// Write the current state to the data file.
    pub fn snapshot(&self) -> std::result::Result<(), PersistError> {
        self.persistence.save(&self.store, &self.events)
    }

    /// Drain the forward queue and stop its worker.
    pub fn close(self) {
        self.forward.shutdown();
    }
}
