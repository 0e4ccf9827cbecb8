//! Per-sample fan-out: annotate, evaluate, publish, notify.
//!
//! Stages are independent consumers of one sample. The ordered path only
//! waits a short window for annotation; a slow geocoder keeps running in the
//! background and later samples go through raw until it finishes. Publishing
//! happens on its own task fed by an ordered outbound queue, so a stalled
//! channel never holds up evaluation of the next sample.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use circle_common::{Annotation, LocationError, LocationSample, OutboundLocation, RawFix};

use crate::geofence::GeofenceEngine;
use crate::listeners::{lock, Listeners};
use crate::safety::SafetyZoneMonitor;
use crate::traits::{GeocodeResolver, RealtimeTransport};

pub(crate) struct SamplePipeline {
    geocoder: Arc<dyn GeocodeResolver>,
    geofences: Arc<GeofenceEngine>,
    safety_zones: Arc<SafetyZoneMonitor>,
    geocode_timeout: Duration,
    annotation_window: Duration,
    pending_geocode: Mutex<Option<JoinHandle<Option<Annotation>>>>,
    outbound: mpsc::UnboundedSender<OutboundLocation>,
    last_sample: Mutex<Option<LocationSample>>,
    pub(crate) listeners: Listeners<LocationSample>,
}

impl SamplePipeline {
    /// Spawns the publisher task, so this must run inside a Tokio runtime.
    pub(crate) fn new(
        geocoder: Arc<dyn GeocodeResolver>,
        transport: Arc<dyn RealtimeTransport>,
        geofences: Arc<GeofenceEngine>,
        safety_zones: Arc<SafetyZoneMonitor>,
        geocode_timeout: Duration,
        annotation_window: Duration,
        publish_timeout: Duration,
    ) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(publish_loop(transport, queue, publish_timeout));

        Self {
            geocoder,
            geofences,
            safety_zones,
            geocode_timeout,
            annotation_window: annotation_window.min(geocode_timeout),
            pending_geocode: Mutex::new(None),
            outbound,
            last_sample: Mutex::new(None),
            listeners: Listeners::new(),
        }
    }

    /// Best-effort reverse geocoding, waiting up to the full geocode timeout.
    /// On failure the raw sample comes back.
    pub(crate) async fn annotate(&self, sample: LocationSample) -> LocationSample {
        match resolve_bounded(
            self.geocoder.as_ref(),
            sample.latitude,
            sample.longitude,
            self.geocode_timeout,
        )
        .await
        {
            Some(annotation) => sample.with_annotation(annotation),
            None => sample,
        }
    }

    pub(crate) async fn process(&self, fix: RawFix) -> LocationSample {
        let sample = self.annotate_within_window(LocationSample::from_fix(&fix)).await;

        self.geofences.evaluate(&sample);
        self.safety_zones.evaluate(&sample);
        if self.outbound.send(OutboundLocation::from(&sample)).is_err() {
            warn!(
                error = %LocationError::TransportFailure("publisher stopped".to_string()),
                "Location publish failed"
            );
        }

        *lock(&self.last_sample) = Some(sample.clone());
        self.listeners.emit(&sample);
        debug!(
            lat = sample.latitude,
            lon = sample.longitude,
            accuracy_m = sample.accuracy_meters,
            annotated = sample.is_annotated(),
            "Sample processed"
        );
        sample
    }

    pub(crate) fn last_sample(&self) -> Option<LocationSample> {
        lock(&self.last_sample).clone()
    }

    /// At most one geocode is in flight. While it runs, new samples skip
    /// annotation instead of queueing behind it.
    async fn annotate_within_window(&self, sample: LocationSample) -> LocationSample {
        let pending = lock(&self.pending_geocode).take();
        let mut lookup = match pending {
            Some(lookup) if !lookup.is_finished() => {
                *lock(&self.pending_geocode) = Some(lookup);
                debug!("Geocoder busy, evaluating raw sample");
                return sample;
            }
            _ => {
                let geocoder = self.geocoder.clone();
                let limit = self.geocode_timeout;
                let (lat, lon) = (sample.latitude, sample.longitude);
                tokio::spawn(async move { resolve_bounded(geocoder.as_ref(), lat, lon, limit).await })
            }
        };

        match tokio::time::timeout(self.annotation_window, &mut lookup).await {
            Ok(Ok(Some(annotation))) => sample.with_annotation(annotation),
            Ok(Ok(None)) => sample,
            Ok(Err(e)) => {
                warn!(error = %LocationError::AnnotationFailure(e.to_string()), "Continuing without annotation");
                sample
            }
            Err(_) => {
                debug!(
                    window_ms = self.annotation_window.as_millis() as u64,
                    "Annotation not ready, evaluating raw sample"
                );
                *lock(&self.pending_geocode) = Some(lookup);
                sample
            }
        }
    }
}

async fn resolve_bounded(
    geocoder: &dyn GeocodeResolver,
    lat: f64,
    lon: f64,
    limit: Duration,
) -> Option<Annotation> {
    let failure = match tokio::time::timeout(limit, geocoder.resolve(lat, lon)).await {
        Ok(Ok(annotation)) => return Some(annotation),
        Ok(Err(e)) => LocationError::AnnotationFailure(e.to_string()),
        Err(_) => LocationError::AnnotationFailure(format!("timed out after {}ms", limit.as_millis())),
    };
    warn!(error = %failure, "Continuing without annotation");
    None
}

/// Drains the outbound queue in order. Ends when the pipeline is dropped.
async fn publish_loop(
    transport: Arc<dyn RealtimeTransport>,
    mut queue: mpsc::UnboundedReceiver<OutboundLocation>,
    publish_timeout: Duration,
) {
    while let Some(outbound) = queue.recv().await {
        let published =
            tokio::time::timeout(publish_timeout, transport.publish_location(&outbound)).await;

        let failure = match published {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => LocationError::TransportFailure(e.to_string()),
            Err(_) => LocationError::TransportFailure(format!(
                "publish timed out after {}ms",
                publish_timeout.as_millis()
            )),
        };
        warn!(error = %failure, "Location publish failed");
    }
    debug!("Location publisher stopped");
}
