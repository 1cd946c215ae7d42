//! The single system-wide tracking session.
//!
//! One poller appends samples while request handlers start, stop and query
//! the session. Every operation takes the same lock, so a stop racing with an
//! in-flight append sees the sample either fully recorded or not at all.

use crate::sample::{round_to, Sample};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Recording,
    Completed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackingError {
    #[error("tracking is already in progress")]
    AlreadyTracking,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub duration_secs: u64,
    pub data_points: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackingStatus {
    pub state: SessionState,
    pub is_tracking: bool,
    pub elapsed_seconds: u64,
    pub remaining_seconds: u64,
    pub progress_percent: f64,
    pub data_points: usize,
}

/// Tracking fields attached to every streamed tick.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TickTracking {
    pub is_tracking: bool,
    pub data_points: usize,
    pub progress: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Ignored,
    Recorded,
    /// This append reached the duration limit and closed the session.
    Completed { data_points: usize },
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    samples: Vec<Arc<Sample>>,
    started_at: Option<Instant>,
    duration_limit: Duration,
}

impl Session {
    fn start(&mut self, now: Instant) -> Result<SessionInfo, TrackingError> {
        if self.state == SessionState::Recording {
            return Err(TrackingError::AlreadyTracking);
        }
        if !self.samples.is_empty() {
            warn!(
                discarded = self.samples.len(),
                "starting a new session discards the previous session's samples"
            );
        }
        self.samples.clear();
        self.state = SessionState::Recording;
        self.started_at = Some(now);
        Ok(SessionInfo {
            duration_secs: self.duration_limit.as_secs(),
            data_points: 0,
        })
    }

    fn stop(&mut self) -> SessionInfo {
        if self.state == SessionState::Recording {
            self.state = SessionState::Completed;
        }
        SessionInfo {
            duration_secs: self.duration_limit.as_secs(),
            data_points: self.samples.len(),
        }
    }

    fn append(&mut self, sample: Arc<Sample>, now: Instant) -> AppendOutcome {
        if self.state != SessionState::Recording {
            return AppendOutcome::Ignored;
        }
        // Collected before this session started.
        if self.started_at.is_some_and(|started| now < started) {
            return AppendOutcome::Ignored;
        }
        self.samples.push(sample);

        if self.elapsed(now) >= self.duration_limit {
            self.state = SessionState::Completed;
            return AppendOutcome::Completed {
                data_points: self.samples.len(),
            };
        }
        AppendOutcome::Recorded
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    fn status(&self, now: Instant) -> TrackingStatus {
        let recording = self.state == SessionState::Recording;
        let (elapsed, remaining, progress) = if recording {
            let elapsed = self.elapsed(now);
            let limit = self.duration_limit.as_secs_f64();
            let progress = if limit > 0.0 {
                (elapsed.as_secs_f64() / limit * 100.0).clamp(0.0, 100.0)
            } else {
                100.0
            };
            (
                elapsed.as_secs(),
                self.duration_limit.saturating_sub(elapsed).as_secs(),
                round_to(progress, 1),
            )
        } else {
            (0, 0, 0.0)
        };

        TrackingStatus {
            state: self.state,
            is_tracking: recording,
            elapsed_seconds: elapsed,
            remaining_seconds: remaining,
            progress_percent: progress,
            data_points: self.samples.len(),
        }
    }

    fn tick_tracking(&self) -> TickTracking {
        let recording = self.state == SessionState::Recording;
        let limit = self.duration_limit.as_secs_f64();
        let progress = if recording && limit > 0.0 {
            (self.samples.len() as f64 / limit * 100.0).min(100.0)
        } else {
            0.0
        };
        TickTracking {
            is_tracking: recording,
            data_points: self.samples.len(),
            progress: round_to(progress, 1),
        }
    }
}

/// Shared handle to the session, cloned into the poller and every handler.
#[derive(Clone)]
pub struct TrackingSession {
    inner: Arc<Mutex<Session>>,
}

impl TrackingSession {
    pub fn new(duration_limit: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Session {
                state: SessionState::Idle,
                samples: Vec::new(),
                started_at: None,
                duration_limit,
            })),
        }
    }

    pub async fn start(&self, now: Instant) -> Result<SessionInfo, TrackingError> {
        let info = self.inner.lock().await.start(now)?;
        info!(duration_secs = info.duration_secs, "tracking started");
        Ok(info)
    }

    pub async fn stop(&self) -> SessionInfo {
        let info = self.inner.lock().await.stop();
        info!(data_points = info.data_points, "tracking stopped");
        info
    }

    /// Records `sample` if a session is recording and returns the tracking
    /// fields observed right after the append.
    pub async fn append(&self, sample: Arc<Sample>, now: Instant) -> (AppendOutcome, TickTracking) {
        let mut session = self.inner.lock().await;
        let outcome = session.append(sample, now);
        (outcome, session.tick_tracking())
    }

    pub async fn status(&self, now: Instant) -> TrackingStatus {
        self.inner.lock().await.status(now)
    }

    /// Copy of the recorded samples that later starts cannot touch.
    pub async fn frozen_samples(&self) -> Vec<Arc<Sample>> {
        self.inner.lock().await.samples.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn sample() -> Arc<Sample> {
        Arc::new(Sample::empty(SystemTime::now()))
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn second_start_fails_and_keeps_samples() {
        let session = TrackingSession::new(secs(300));
        let t0 = Instant::now();
        let info = session.start(t0).await.unwrap();
        assert_eq!(info.duration_secs, 300);

        session.append(sample(), t0 + secs(1)).await;
        session.append(sample(), t0 + secs(2)).await;

        let err = session.start(t0 + secs(3)).await.unwrap_err();
        assert_eq!(err, TrackingError::AlreadyTracking);
        assert_eq!(session.frozen_samples().await.len(), 2);
        assert!(session.status(t0 + secs(3)).await.is_tracking);
    }

    #[tokio::test]
    async fn auto_completes_exactly_once_at_the_limit() {
        let session = TrackingSession::new(secs(300));
        let t0 = Instant::now();
        session.start(t0).await.unwrap();

        let mut completions = 0;
        for i in 1..=301 {
            let (outcome, _) = session.append(sample(), t0 + secs(i)).await;
            if let AppendOutcome::Completed { data_points } = outcome {
                completions += 1;
                assert_eq!(data_points, 300);
            }
        }

        assert_eq!(completions, 1);
        assert_eq!(session.frozen_samples().await.len(), 300);
        let status = session.status(t0 + secs(301)).await;
        assert_eq!(status.state, SessionState::Completed);
        assert!(!status.is_tracking);
    }

    #[tokio::test]
    async fn append_is_a_noop_unless_recording() {
        let session = TrackingSession::new(secs(300));
        let t0 = Instant::now();
        let (outcome, tracking) = session.append(sample(), t0).await;
        assert_eq!(outcome, AppendOutcome::Ignored);
        assert_eq!(tracking.data_points, 0);
        assert!(!tracking.is_tracking);

        session.start(t0).await.unwrap();
        session.append(sample(), t0 + secs(1)).await;
        session.stop().await;
        let (outcome, _) = session.append(sample(), t0 + secs(2)).await;
        assert_eq!(outcome, AppendOutcome::Ignored);
        assert_eq!(session.frozen_samples().await.len(), 1);
    }

    #[tokio::test]
    async fn samples_captured_before_start_are_ignored() {
        let session = TrackingSession::new(secs(300));
        let t0 = Instant::now();
        session.start(t0 + secs(5)).await.unwrap();

        let (outcome, tracking) = session.append(sample(), t0 + secs(4)).await;
        assert_eq!(outcome, AppendOutcome::Ignored);
        assert_eq!(tracking.data_points, 0);
        assert!(tracking.is_tracking);

        let (outcome, _) = session.append(sample(), t0 + secs(5)).await;
        assert_eq!(outcome, AppendOutcome::Recorded);
        assert_eq!(session.frozen_samples().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let session = TrackingSession::new(secs(300));
        assert_eq!(session.stop().await.data_points, 0);

        let t0 = Instant::now();
        session.start(t0).await.unwrap();
        session.append(sample(), t0 + secs(1)).await;
        assert_eq!(session.stop().await.data_points, 1);
        assert_eq!(session.stop().await.data_points, 1);
        assert_eq!(session.status(t0).await.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn status_is_clamped_past_the_limit() {
        let session = TrackingSession::new(secs(300));
        let t0 = Instant::now();
        session.start(t0).await.unwrap();

        let mut last_elapsed = 0;
        for i in [0, 30, 150, 299, 300, 450] {
            let status = session.status(t0 + secs(i)).await;
            assert!(status.elapsed_seconds >= last_elapsed);
            assert!((0.0..=100.0).contains(&status.progress_percent));
            last_elapsed = status.elapsed_seconds;
        }

        let late = session.status(t0 + secs(450)).await;
        assert_eq!(late.remaining_seconds, 0);
        assert_eq!(late.progress_percent, 100.0);
        assert!(late.is_tracking);

        let mid = session.status(t0 + secs(150)).await;
        assert_eq!(mid.elapsed_seconds, 150);
        assert_eq!(mid.remaining_seconds, 150);
        assert_eq!(mid.progress_percent, 50.0);
    }

    #[tokio::test]
    async fn idle_status_reports_zero_progress() {
        let session = TrackingSession::new(secs(300));
        let status = session.status(Instant::now()).await;
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.elapsed_seconds, 0);
        assert_eq!(status.remaining_seconds, 0);
        assert_eq!(status.progress_percent, 0.0);
    }

    #[tokio::test]
    async fn restart_after_completion_clears_samples() {
        let session = TrackingSession::new(secs(2));
        let t0 = Instant::now();
        session.start(t0).await.unwrap();
        session.append(sample(), t0 + secs(1)).await;
        session.append(sample(), t0 + secs(2)).await;
        assert_eq!(session.status(t0).await.state, SessionState::Completed);

        let frozen = session.frozen_samples().await;
        session.start(t0 + secs(10)).await.unwrap();
        assert_eq!(frozen.len(), 2);
        assert!(session.frozen_samples().await.is_empty());
    }

    #[tokio::test]
    async fn tick_progress_counts_samples() {
        let session = TrackingSession::new(secs(300));
        let t0 = Instant::now();
        session.start(t0).await.unwrap();
        let mut tracking = None;
        for i in 1..=30 {
            tracking = Some(session.append(sample(), t0 + secs(i)).await.1);
        }
        let tracking = tracking.unwrap();
        assert!(tracking.is_tracking);
        assert_eq!(tracking.data_points, 30);
        assert_eq!(tracking.progress, 10.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_append_and_stop_never_lose_or_mutate() {
        let session = TrackingSession::new(secs(10_000));
        let t0 = Instant::now();
        session.start(t0).await.unwrap();

        let appender = {
            let session = session.clone();
            tokio::spawn(async move {
                for i in 1..=2_000 {
                    session.append(sample(), t0 + Duration::from_millis(i)).await;
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let observer = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut last = 0;
                for _ in 0..500 {
                    let count = session.frozen_samples().await.len();
                    assert!(count >= last, "sample count went backwards");
                    last = count;
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::task::yield_now().await;
        let stopped = session.stop().await;

        appender.await.unwrap();
        observer.await.unwrap();

        let after = session.frozen_samples().await;
        assert_eq!(after.len(), stopped.data_points);
        assert_eq!(session.status(t0).await.state, SessionState::Completed);
    }
}
