//! One user's live session in a circle.
//!
//! `CircleSession` owns every location component and the wiring between
//! them. Collaborators come in through `SessionDeps`, so an app, a test, or
//! the replay tool each assemble a session the same way.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use circle_common::{EmergencyAlert, EmergencyKind, LocationConfig, LocationError, RosterMember};

use crate::aggregator::CircleLocationAggregator;
use crate::geofence::GeofenceEngine;
use crate::listeners::{Listeners, Subscription};
use crate::permission::PermissionGate;
use crate::pipeline::SamplePipeline;
use crate::safety::{AlertThrottle, SafetyZoneMonitor};
use crate::tracker::{LocationTracker, StartOutcome, TrackingOptions};
use crate::traits::{
    GeocodeResolver, InboundEvent, PermissionProvider, PositionProvider, RealtimeTransport,
};

const LOCATION_UNAVAILABLE: &str = "Location unavailable";

#[derive(Clone, TypedBuilder)]
pub struct SessionDeps {
    pub permissions: Arc<dyn PermissionProvider>,
    pub positions: Arc<dyn PositionProvider>,
    pub geocoder: Arc<dyn GeocodeResolver>,
    pub transport: Arc<dyn RealtimeTransport>,
    #[builder(default)]
    pub config: LocationConfig,
}

/// An emergency alert raised by another member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEmergency {
    pub user_id: String,
    pub alert: EmergencyAlert,
}

pub struct CircleSession {
    user_id: String,
    config: LocationConfig,
    gate: Arc<PermissionGate>,
    tracker: LocationTracker,
    geofences: Arc<GeofenceEngine>,
    safety_zones: Arc<SafetyZoneMonitor>,
    aggregator: Arc<CircleLocationAggregator>,
    transport: Arc<dyn RealtimeTransport>,
    emergencies: Listeners<InboundEmergency>,
    _local_feed: Subscription,
}

impl CircleSession {
    /// Must be called from inside a Tokio runtime; the sample pipeline spawns
    /// its publisher task here.
    pub fn new(deps: SessionDeps, user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let config = deps.config;

        let gate = Arc::new(PermissionGate::new(deps.permissions));
        let geofences = Arc::new(GeofenceEngine::new(user_id.clone()));
        let safety_zones = Arc::new(match config.safety_alert_min_interval {
            Some(interval) => SafetyZoneMonitor::with_throttle(AlertThrottle::new(interval)),
            None => SafetyZoneMonitor::new(),
        });
        let aggregator = Arc::new(CircleLocationAggregator::new(user_id.clone(), user_name));

        let pipeline = Arc::new(SamplePipeline::new(
            deps.geocoder,
            deps.transport.clone(),
            geofences.clone(),
            safety_zones.clone(),
            config.geocode_timeout,
            config.annotation_window,
            config.publish_timeout,
        ));
        let tracker = LocationTracker::new(gate.clone(), deps.positions, pipeline, config.clone());

        let feed = aggregator.clone();
        let local_feed = tracker.subscribe(move |sample| feed.ingest_local(sample));

        Self {
            user_id,
            config,
            gate,
            tracker,
            geofences,
            safety_zones,
            aggregator,
            transport: deps.transport,
            emergencies: Listeners::new(),
            _local_feed: local_feed,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn permissions(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn tracker(&self) -> &LocationTracker {
        &self.tracker
    }

    pub fn geofences(&self) -> &GeofenceEngine {
        &self.geofences
    }

    pub fn safety_zones(&self) -> &SafetyZoneMonitor {
        &self.safety_zones
    }

    pub fn aggregator(&self) -> &CircleLocationAggregator {
        &self.aggregator
    }

    /// Tracking options seeded from config.
    pub fn default_tracking_options(&self) -> TrackingOptions {
        TrackingOptions {
            interval_ms: self.config.default_interval_ms,
            ..TrackingOptions::default()
        }
    }

    pub async fn start_tracking(&self, options: TrackingOptions) -> StartOutcome {
        self.tracker.start(options).await
    }

    pub fn stop_tracking(&self) {
        self.tracker.stop();
    }

    pub fn set_roster(&self, members: Vec<RosterMember>) {
        info!(members = members.len(), "Circle roster updated");
        self.aggregator.set_membership_roster(members);
    }

    pub fn subscribe_emergency_alerts<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundEmergency) + Send + Sync + 'static,
    {
        self.emergencies.subscribe(callback)
    }

    pub fn handle_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::MemberLocationUpdated(update) => {
                self.aggregator.ingest_remote(update);
            }
            InboundEvent::MemberPresence { user_id, online } => {
                self.aggregator.set_presence(&user_id, online);
            }
            InboundEvent::EmergencyAlert { user_id, alert } => {
                if user_id == self.user_id {
                    debug!("Ignoring echo of own emergency alert");
                    return;
                }
                warn!(
                    user_id = user_id.as_str(),
                    kind = ?alert.kind,
                    location = alert.location_text.as_str(),
                    "Emergency alert received"
                );
                self.emergencies.emit(&InboundEmergency { user_id, alert });
            }
        }
    }

    /// Drain the realtime channel until it closes.
    ///
    /// A failed subscription only affects remote ingest; local tracking keeps
    /// running either way.
    pub async fn pump_inbound(&self) -> Result<(), LocationError> {
        let mut events = self.transport.inbound().await.map_err(|e| {
            let failure = LocationError::TransportFailure(e.to_string());
            warn!(error = %failure, "Inbound subscription failed");
            failure
        })?;

        while let Some(event) = events.next().await {
            self.handle_inbound(event);
        }
        info!("Inbound channel closed");
        Ok(())
    }

    /// Take a fresh fix and broadcast an emergency alert with it.
    ///
    /// A missing fix does not block the alert; it goes out with
    /// "Location unavailable" instead.
    pub async fn send_emergency_alert(
        &self,
        message: impl Into<String>,
        kind: EmergencyKind,
    ) -> Result<EmergencyAlert, LocationError> {
        let location_text = match self.tracker.emergency_snapshot().await {
            Some(sample) => sample.location_text(),
            None => LOCATION_UNAVAILABLE.to_string(),
        };
        let alert = EmergencyAlert {
            message: message.into(),
            location_text,
            kind,
        };

        let published = tokio::time::timeout(
            self.config.publish_timeout,
            self.transport.publish_emergency_alert(&alert),
        )
        .await;
        let failure = match published {
            Ok(Ok(())) => {
                warn!(kind = ?alert.kind, location = alert.location_text.as_str(), "Emergency alert sent");
                return Ok(alert);
            }
            Ok(Err(e)) => LocationError::TransportFailure(e.to_string()),
            Err(_) => LocationError::TransportFailure(format!(
                "emergency publish timed out after {}ms",
                self.config.publish_timeout.as_millis()
            )),
        };
        warn!(error = %failure, "Emergency alert not delivered");
        Err(failure)
    }
}
