//! The device's own position stream.
//!
//! `Stopped → Starting → Active`, back to `Stopped` on `stop()`, on a denied
//! permission, or when the watch stream fails. Every fix, whether from the
//! continuous watch or the one-shot immediate fix, goes through the sample
//! pipeline in the order it arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use circle_common::{LocationConfig, LocationError, LocationSample, RawFix};

use crate::listeners::{lock, Subscription};
use crate::permission::{PermissionGate, PermissionStatus};
use crate::pipeline::SamplePipeline;
use crate::traits::{FixOptions, FixStream, PositionProvider, WatchOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Stopped,
    Starting,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingOptions {
    pub high_accuracy: bool,
    pub background: bool,
    pub interval_ms: u64,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            background: false,
            interval_ms: 10_000,
        }
    }
}

/// Result of `start()`. None of these are errors for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Watch established; samples will flow.
    Active,
    /// Already tracking with identical options.
    AlreadyActive,
    /// Another `start()` is still acquiring.
    InProgress,
    /// Permission missing; tracker stays stopped.
    PermissionDenied,
    /// The provider refused the watch; tracker stays stopped, retry allowed.
    AcquisitionFailed,
    /// `stop()` was called while this start was acquiring.
    Cancelled,
}

struct TrackerInner {
    state: TrackerState,
    options: Option<TrackingOptions>,
    // Bumped by every start and stop; a pump whose generation is stale must
    // not touch the state or admit samples.
    generation: u64,
    stop_tx: Option<oneshot::Sender<()>>,
}

pub struct LocationTracker {
    gate: Arc<PermissionGate>,
    positions: Arc<dyn PositionProvider>,
    pipeline: Arc<SamplePipeline>,
    config: LocationConfig,
    inner: Arc<Mutex<TrackerInner>>,
}

impl LocationTracker {
    pub(crate) fn new(
        gate: Arc<PermissionGate>,
        positions: Arc<dyn PositionProvider>,
        pipeline: Arc<SamplePipeline>,
        config: LocationConfig,
    ) -> Self {
        Self {
            gate,
            positions,
            pipeline,
            config,
            inner: Arc::new(Mutex::new(TrackerInner {
                state: TrackerState::Stopped,
                options: None,
                generation: 0,
                stop_tx: None,
            })),
        }
    }

    pub fn state(&self) -> TrackerState {
        lock(&self.inner).state
    }

    pub fn options(&self) -> Option<TrackingOptions> {
        lock(&self.inner).options
    }

    pub fn last_sample(&self) -> Option<LocationSample> {
        self.pipeline.last_sample()
    }

    /// Listen for processed (annotated, evaluated, published) local samples.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LocationSample) + Send + Sync + 'static,
    {
        self.pipeline.listeners.subscribe(callback)
    }

    pub async fn start(&self, options: TrackingOptions) -> StartOutcome {
        let generation = {
            let mut inner = lock(&self.inner);
            match inner.state {
                TrackerState::Active if inner.options == Some(options) => {
                    return StartOutcome::AlreadyActive;
                }
                TrackerState::Starting => return StartOutcome::InProgress,
                TrackerState::Active => {
                    info!("Restarting location tracking with new options");
                    release(&mut inner);
                }
                TrackerState::Stopped => {}
            }
            inner.state = TrackerState::Starting;
            inner.options = Some(options);
            inner.generation += 1;
            inner.generation
        };

        if !self.gate.ensure_granted().await {
            self.abandon_start(generation);
            warn!(error = %LocationError::PermissionDenied, "Location tracking not started");
            return StartOutcome::PermissionDenied;
        }

        let watch_options = WatchOptions {
            high_accuracy: options.high_accuracy,
            background: options.background,
            interval_ms: options.interval_ms,
            min_displacement_meters: self.config.min_displacement_meters,
        };
        let stream = match self.positions.watch(watch_options).await {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon_start(generation);
                let failure = LocationError::AcquisitionFailure(e.to_string());
                warn!(error = %failure, "Location tracking not started");
                return StartOutcome::AcquisitionFailed;
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.state != TrackerState::Starting {
                debug!("Location start cancelled while acquiring");
                return StartOutcome::Cancelled;
            }
            inner.state = TrackerState::Active;
            inner.stop_tx = Some(stop_tx);
        }

        let pump = WatchPump {
            inner: self.inner.clone(),
            pipeline: self.pipeline.clone(),
            positions: self.positions.clone(),
            generation,
            immediate_fix: FixOptions {
                high_accuracy: options.high_accuracy,
                timeout: self.config.immediate_fix_timeout,
                maximum_age: Duration::from_millis(options.interval_ms),
            },
        };
        tokio::spawn(pump.run(stream, stop_rx));

        info!(
            high_accuracy = options.high_accuracy,
            background = options.background,
            interval_ms = options.interval_ms,
            "Location tracking active"
        );
        StartOutcome::Active
    }

    /// Release the watch. A sample already in the pipeline finishes; no new
    /// sample is admitted. No-op when already stopped.
    pub fn stop(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == TrackerState::Stopped {
            return;
        }
        release(&mut inner);
        info!("Location tracking stopped");
    }

    /// One fresh, highest-accuracy fix for an emergency alert.
    ///
    /// Independent of the running watch. `None` when permission is missing
    /// or the fix cannot be obtained in time.
    pub async fn emergency_snapshot(&self) -> Option<LocationSample> {
        if self.gate.current_status() != PermissionStatus::Granted {
            warn!("Emergency snapshot unavailable: location permission not granted");
            return None;
        }

        let options = FixOptions {
            high_accuracy: true,
            timeout: self.config.emergency_fix_timeout,
            maximum_age: Duration::ZERO,
        };
        let fix = tokio::time::timeout(options.timeout, self.positions.get_once(options)).await;

        match fix {
            Ok(Ok(fix)) => Some(self.pipeline.annotate(LocationSample::from_fix(&fix)).await),
            Ok(Err(e)) => {
                warn!(error = %LocationError::AcquisitionFailure(e.to_string()), "Emergency snapshot failed");
                None
            }
            Err(_) => {
                let timeout_ms = options.timeout.as_millis() as u64;
                warn!(error = %LocationError::AcquisitionTimeout(timeout_ms), "Emergency snapshot failed");
                None
            }
        }
    }

    fn abandon_start(&self, generation: u64) {
        let mut inner = lock(&self.inner);
        if inner.generation == generation {
            inner.state = TrackerState::Stopped;
            inner.options = None;
        }
    }
}

fn release(inner: &mut TrackerInner) {
    inner.generation += 1;
    inner.state = TrackerState::Stopped;
    inner.options = None;
    if let Some(stop_tx) = inner.stop_tx.take() {
        let _ = stop_tx.send(());
    }
}

/// Drives one watch session until stopped or the stream fails.
struct WatchPump {
    inner: Arc<Mutex<TrackerInner>>,
    pipeline: Arc<SamplePipeline>,
    positions: Arc<dyn PositionProvider>,
    generation: u64,
    immediate_fix: FixOptions,
}

impl WatchPump {
    async fn run(self, mut stream: FixStream, mut stop_rx: oneshot::Receiver<()>) {
        let immediate = tokio::time::timeout(
            self.immediate_fix.timeout,
            self.positions.get_once(self.immediate_fix),
        );
        tokio::pin!(immediate);
        // The immediate fix only matters until the watch delivers something.
        let mut awaiting_immediate = true;

        loop {
            tokio::select! {
                biased;

                _ = &mut stop_rx => break,

                result = &mut immediate, if awaiting_immediate => {
                    awaiting_immediate = false;
                    match result {
                        Ok(Ok(fix)) => {
                            if !self.admit(fix).await {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(error = %e, "Immediate fix failed, continuing on watch stream");
                        }
                        Err(_) => {
                            let timeout_ms = self.immediate_fix.timeout.as_millis() as u64;
                            debug!(
                                error = %LocationError::AcquisitionTimeout(timeout_ms),
                                "Continuing on watch stream"
                            );
                        }
                    }
                }

                next = stream.next() => match next {
                    Some(Ok(fix)) => {
                        awaiting_immediate = false;
                        if !self.admit(fix).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let failure = LocationError::AcquisitionFailure(e.to_string());
                        warn!(error = %failure, "Location watch failed, tracking stopped");
                        self.mark_stopped();
                        break;
                    }
                    None => {
                        let failure = LocationError::AcquisitionFailure("watch stream ended".to_string());
                        warn!(error = %failure, "Location watch ended, tracking stopped");
                        self.mark_stopped();
                        break;
                    }
                },
            }
        }
    }

    /// Run one fix through the pipeline if this session is still current.
    async fn admit(&self, fix: RawFix) -> bool {
        if !self.is_current() {
            return false;
        }
        self.pipeline.process(fix).await;
        true
    }

    fn is_current(&self) -> bool {
        let inner = lock(&self.inner);
        inner.generation == self.generation && inner.state == TrackerState::Active
    }

    fn mark_stopped(&self) {
        let mut inner = lock(&self.inner);
        if inner.generation == self.generation {
            inner.state = TrackerState::Stopped;
            inner.options = None;
            inner.stop_tx = None;
        }
    }
}
