//! Level-triggered safety-zone alerts.
//!
//! Unlike geofences, a zone alerts on every sample taken inside it. An
//! `AlertThrottle` can be layered on top to space repeated alerts out.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use circle_common::{LocationError, LocationSample, SafetyZone, ZoneKind};

use crate::listeners::{lock, Listeners, Subscription};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyAlert {
    pub zone_id: Uuid,
    pub zone_name: String,
    pub zone_kind: ZoneKind,
    pub circle_id: String,
    pub distance_meters: f64,
    pub sample: LocationSample,
}

/// Minimum spacing between alerts for the same zone, measured on sample
/// capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertThrottle {
    pub min_interval: Duration,
}

impl AlertThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    fn allows(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last else {
            return true;
        };
        // A negative gap (clock went backwards) fails `to_std` and alerts.
        match (now - last).to_std() {
            Ok(elapsed) => elapsed >= self.min_interval,
            Err(_) => true,
        }
    }
}

struct ZoneEntry {
    zone: SafetyZone,
    last_alert_at: Option<DateTime<Utc>>,
}

pub struct SafetyZoneMonitor {
    zones: Mutex<Vec<ZoneEntry>>,
    throttle: Option<AlertThrottle>,
    listeners: Listeners<SafetyAlert>,
}

impl SafetyZoneMonitor {
    pub fn new() -> Self {
        Self {
            zones: Mutex::new(Vec::new()),
            throttle: None,
            listeners: Listeners::new(),
        }
    }

    pub fn with_throttle(throttle: AlertThrottle) -> Self {
        Self {
            throttle: Some(throttle),
            ..Self::new()
        }
    }

    /// Register a zone. An existing id is replaced.
    pub fn register(&self, zone: SafetyZone) -> Result<(), LocationError> {
        zone.validate()?;

        let mut zones = lock(&self.zones);
        let id = zone.id;
        match zones.iter_mut().find(|e| e.zone.id == id) {
            Some(entry) => {
                entry.zone = zone;
                entry.last_alert_at = None;
            }
            None => zones.push(ZoneEntry {
                zone,
                last_alert_at: None,
            }),
        }
        debug!(zone_id = %id, "Registered safety zone");
        Ok(())
    }

    pub fn unregister(&self, id: Uuid) -> Result<SafetyZone, LocationError> {
        let mut zones = lock(&self.zones);
        let index = zones
            .iter()
            .position(|e| e.zone.id == id)
            .ok_or(LocationError::SafetyZoneNotFound(id))?;
        Ok(zones.remove(index).zone)
    }

    pub fn list(&self) -> Vec<SafetyZone> {
        lock(&self.zones).iter().map(|e| e.zone.clone()).collect()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SafetyAlert) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Raise an alert for every zone the sample is inside.
    pub fn evaluate(&self, sample: &LocationSample) -> Vec<SafetyAlert> {
        let alerts: Vec<SafetyAlert> = {
            let mut zones = lock(&self.zones);
            zones
                .iter_mut()
                .filter_map(|entry| {
                    let distance = entry.zone.distance_from(sample);
                    if distance > entry.zone.radius_meters {
                        return None;
                    }
                    if let Some(throttle) = &self.throttle {
                        if !throttle.allows(entry.last_alert_at, sample.captured_at) {
                            debug!(zone_id = %entry.zone.id, "Safety alert throttled");
                            return None;
                        }
                    }
                    entry.last_alert_at = Some(sample.captured_at);
                    Some(SafetyAlert {
                        zone_id: entry.zone.id,
                        zone_name: entry.zone.name.clone(),
                        zone_kind: entry.zone.kind,
                        circle_id: entry.zone.circle_id.clone(),
                        distance_meters: distance,
                        sample: sample.clone(),
                    })
                })
                .collect()
        };

        for alert in &alerts {
            match alert.zone_kind {
                ZoneKind::Danger => warn!(zone = alert.zone_name.as_str(), "Inside danger zone"),
                kind => info!(zone = alert.zone_name.as_str(), kind = %kind, "Inside safety zone"),
            }
            self.listeners.emit(alert);
        }
        alerts
    }
}

impl Default for SafetyZoneMonitor {
    fn default() -> Self {
        Self::new()
    }
}
