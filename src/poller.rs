//! The periodic collection loop.

use crate::collectors::{Collection, MetricSource, SampleAggregator};
use crate::events::{EventBus, StreamEvent};
use crate::metrics::Metrics;
use crate::sample::Sample;
use crate::tracking::{AppendOutcome, TrackingSession};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Most recent sample, shared with the request layer.
pub type LatestSample = Arc<RwLock<Option<Arc<Sample>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published,
    Skipped,
}

pub struct Poller<S> {
    aggregator: Arc<Mutex<SampleAggregator<S>>>,
    session: TrackingSession,
    bus: EventBus,
    metrics: Arc<Metrics>,
    latest: LatestSample,
    interval: Duration,
    collect_timeout: Duration,
}

impl<S: MetricSource + 'static> Poller<S> {
    pub fn new(
        aggregator: SampleAggregator<S>,
        session: TrackingSession,
        bus: EventBus,
        metrics: Arc<Metrics>,
        latest: LatestSample,
        interval: Duration,
        collect_timeout: Duration,
    ) -> Self {
        Self {
            aggregator: Arc::new(Mutex::new(aggregator)),
            session,
            bus,
            metrics,
            latest,
            interval,
            collect_timeout,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("poller received shutdown signal");
                    break;
                }
                at = ticker.tick() => {
                    self.tick(at.into_std()).await;
                }
            }
        }
    }

    /// Collects one sample off the async runtime and fans it out. A tick is
    /// skipped when the previous collection still holds the source or this
    /// one overruns `collect_timeout`.
    pub async fn tick(&self, at: Instant) -> TickOutcome {
        let aggregator = Arc::clone(&self.aggregator);
        let job = tokio::task::spawn_blocking(move || {
            let mut guard = match aggregator.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return None,
            };
            Some(guard.collect())
        });

        match tokio::time::timeout(self.collect_timeout, job).await {
            Ok(Ok(Some(collection))) => {
                self.publish(collection, at).await;
                TickOutcome::Published
            }
            Ok(Ok(None)) => {
                debug!("previous collection still running, skipping tick");
                self.metrics.inc_tick_skipped();
                TickOutcome::Skipped
            }
            Ok(Err(err)) => {
                error!(error = %err, "collection task failed");
                self.metrics.inc_tick_skipped();
                TickOutcome::Skipped
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.collect_timeout.as_millis() as u64,
                    "collection overran its deadline, skipping tick"
                );
                self.metrics.inc_tick_skipped();
                TickOutcome::Skipped
            }
        }
    }

    async fn publish(&self, collection: Collection, at: Instant) {
        for (source, err) in &collection.failures {
            debug!(source = *source, error = %err, "metric query absorbed");
            self.metrics.inc_collect_error(source);
        }

        let sample = Arc::new(collection.sample);
        *self.latest.write().await = Some(Arc::clone(&sample));
        self.metrics.update_from_sample(&sample);

        let (outcome, tracking) = self.session.append(Arc::clone(&sample), at).await;
        self.metrics.update_tracking(&tracking);
        self.bus.publish(StreamEvent::StatsUpdate { sample, tracking });

        if let AppendOutcome::Completed { data_points } = outcome {
            info!(data_points, "tracking session reached its duration limit");
            self.metrics.inc_session_completed();
            self.bus.publish(StreamEvent::TrackingComplete { data_points });
        }
    }
}
