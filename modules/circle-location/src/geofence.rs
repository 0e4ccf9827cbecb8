//! Edge-triggered geofence evaluation.
//!
//! Each registered geofence carries a cached containment flag. A sample only
//! raises an event when it flips that flag, so a member sitting at home
//! produces one `Enter` and nothing more until they leave.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use circle_common::{Geofence, GeofenceKind, GeofenceUpdate, LocationError, LocationSample};

use crate::listeners::{lock, Listeners, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceTransition {
    Enter,
    Exit,
    /// Still inside after the geofence's stay threshold.
    Stay,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeofenceEvent {
    pub geofence_id: Uuid,
    pub geofence_name: String,
    pub kind: GeofenceKind,
    pub circle_id: String,
    pub user_id: String,
    pub transition: GeofenceTransition,
    pub distance_meters: f64,
    pub sample: LocationSample,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Containment {
    inside: bool,
    entered_at: Option<DateTime<Utc>>,
    stay_notified: bool,
}

// Containment lives beside its geofence, so removing one removes the other.
struct Entry {
    fence: Geofence,
    containment: Containment,
}

pub struct GeofenceEngine {
    subject_user_id: String,
    entries: Mutex<Vec<Entry>>,
    listeners: Listeners<GeofenceEvent>,
}

impl GeofenceEngine {
    /// `subject_user_id` is whose samples this engine evaluates; geofences
    /// scoped to other members are skipped.
    pub fn new(subject_user_id: impl Into<String>) -> Self {
        Self {
            subject_user_id: subject_user_id.into(),
            entries: Mutex::new(Vec::new()),
            listeners: Listeners::new(),
        }
    }

    pub fn subject_user_id(&self) -> &str {
        &self.subject_user_id
    }

    /// Register a geofence, starting outside. Registering an id that already
    /// exists replaces its definition and resets its containment.
    pub fn register(&self, fence: Geofence) -> Result<(), LocationError> {
        fence.validate()?;

        let mut entries = lock(&self.entries);
        let id = fence.id;
        match entries.iter_mut().find(|e| e.fence.id == id) {
            Some(entry) => {
                debug!(geofence_id = %id, "Replacing registered geofence");
                entry.fence = fence;
                entry.containment = Containment::default();
            }
            None => {
                debug!(geofence_id = %id, name = fence.name.as_str(), "Registered geofence");
                entries.push(Entry {
                    fence,
                    containment: Containment::default(),
                });
            }
        }
        Ok(())
    }

    pub fn unregister(&self, id: Uuid) -> Result<Geofence, LocationError> {
        let mut entries = lock(&self.entries);
        let index = entries
            .iter()
            .position(|e| e.fence.id == id)
            .ok_or(LocationError::GeofenceNotFound(id))?;
        debug!(geofence_id = %id, "Unregistered geofence");
        Ok(entries.remove(index).fence)
    }

    /// Apply a partial update. Moving, resizing, re-scoping or toggling a
    /// geofence resets its containment to outside.
    pub fn update(&self, id: Uuid, update: &GeofenceUpdate) -> Result<Geofence, LocationError> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .iter_mut()
            .find(|e| e.fence.id == id)
            .ok_or(LocationError::GeofenceNotFound(id))?;

        let next = update.apply_to(&entry.fence);
        next.validate()?;

        let reset = next.center_lat != entry.fence.center_lat
            || next.center_lon != entry.fence.center_lon
            || next.radius_meters != entry.fence.radius_meters
            || next.active != entry.fence.active
            || next.member_ids != entry.fence.member_ids;
        if reset {
            entry.containment = Containment::default();
        }
        if !next.notify_on_stay {
            entry.containment.stay_notified = false;
        }

        entry.fence = next.clone();
        Ok(next)
    }

    pub fn get(&self, id: Uuid) -> Option<Geofence> {
        lock(&self.entries)
            .iter()
            .find(|e| e.fence.id == id)
            .map(|e| e.fence.clone())
    }

    pub fn list(&self) -> Vec<Geofence> {
        lock(&self.entries).iter().map(|e| e.fence.clone()).collect()
    }

    pub fn list_active(&self) -> Vec<Geofence> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.fence.active)
            .map(|e| e.fence.clone())
            .collect()
    }

    /// Cached containment for a registered geofence.
    pub fn is_inside(&self, id: Uuid) -> Option<bool> {
        lock(&self.entries)
            .iter()
            .find(|e| e.fence.id == id)
            .map(|e| e.containment.inside)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&GeofenceEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Evaluate one sample against every active geofence that applies to the
    /// subject. Returns the events raised, after delivering them to listeners.
    ///
    /// Samples must arrive in capture order: transitions are computed against
    /// the state the previous sample left behind.
    pub fn evaluate(&self, sample: &LocationSample) -> Vec<GeofenceEvent> {
        let events = {
            let mut entries = lock(&self.entries);
            let mut events = Vec::new();
            for entry in entries.iter_mut() {
                if !entry.fence.active || !entry.fence.applies_to(&self.subject_user_id) {
                    continue;
                }
                self.evaluate_entry(entry, sample, &mut events);
            }
            events
        };

        for event in &events {
            info!(
                geofence_id = %event.geofence_id,
                geofence = event.geofence_name.as_str(),
                transition = ?event.transition,
                distance_m = event.distance_meters.round(),
                "Geofence transition"
            );
            self.listeners.emit(event);
        }
        events
    }

    fn evaluate_entry(&self, entry: &mut Entry, sample: &LocationSample, events: &mut Vec<GeofenceEvent>) {
        let fence = &entry.fence;
        let distance = fence.distance_from(sample);
        let inside = distance <= fence.radius_meters;
        let state = &mut entry.containment;

        let mut raise = |transition: GeofenceTransition| {
            events.push(GeofenceEvent {
                geofence_id: fence.id,
                geofence_name: fence.name.clone(),
                kind: fence.kind,
                circle_id: fence.circle_id.clone(),
                user_id: self.subject_user_id.clone(),
                transition,
                distance_meters: distance,
                sample: sample.clone(),
            });
        };

        match (state.inside, inside) {
            (false, true) => {
                *state = Containment {
                    inside: true,
                    entered_at: Some(sample.captured_at),
                    stay_notified: false,
                };
                if fence.notify_on_enter {
                    raise(GeofenceTransition::Enter);
                }
            }
            (true, false) => {
                *state = Containment::default();
                if fence.notify_on_exit {
                    raise(GeofenceTransition::Exit);
                }
            }
            _ => {}
        }

        if state.inside && fence.notify_on_stay && !state.stay_notified {
            let threshold = Duration::minutes(i64::from(fence.stay_threshold_minutes));
            if let Some(entered_at) = state.entered_at {
                if sample.captured_at - entered_at >= threshold {
                    state.stay_notified = true;
                    raise(GeofenceTransition::Stay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_at_distance;

    fn engine_with(fence: Geofence) -> GeofenceEngine {
        let engine = GeofenceEngine::new("me");
        engine.register(fence).unwrap();
        engine
    }

    fn transitions(events: &[GeofenceEvent]) -> Vec<GeofenceTransition> {
        events.iter().map(|e| e.transition).collect()
    }

    #[test]
    fn enter_and_exit_fire_once_per_crossing() {
        let fence = Geofence::new("Home", 0.0, 0.0, 100.0, GeofenceKind::Home, "c1");
        let engine = engine_with(fence);

        let mut raised = Vec::new();
        for (i, meters) in [150.0, 150.0, 50.0, 50.0, 50.0, 150.0].into_iter().enumerate() {
            let events = engine.evaluate(&sample_at_distance((0.0, 0.0), meters, i as i64));
            raised.push(transitions(&events));
        }

        assert_eq!(
            raised,
            vec![
                vec![],
                vec![],
                vec![GeofenceTransition::Enter],
                vec![],
                vec![],
                vec![GeofenceTransition::Exit],
            ]
        );
    }

    #[test]
    fn boundary_counts_as_inside() {
        let sample = sample_at_distance((0.0, 0.0), 100.0, 0);
        let radius = sample.distance_to(0.0, 0.0);
        let fence = Geofence::new("Edge", 0.0, 0.0, radius, GeofenceKind::Custom, "c1");
        let id = fence.id;
        let engine = engine_with(fence);

        let events = engine.evaluate(&sample);
        assert_eq!(transitions(&events), vec![GeofenceTransition::Enter]);
        assert_eq!(engine.is_inside(id), Some(true));
    }

    #[test]
    fn state_updates_even_without_notification() {
        let mut fence = Geofence::new("Quiet", 0.0, 0.0, 100.0, GeofenceKind::Custom, "c1");
        fence.notify_on_enter = false;
        let id = fence.id;
        let engine = engine_with(fence);

        assert!(engine.evaluate(&sample_at_distance((0.0, 0.0), 10.0, 0)).is_empty());
        assert_eq!(engine.is_inside(id), Some(true));

        let events = engine.evaluate(&sample_at_distance((0.0, 0.0), 500.0, 1));
        assert_eq!(transitions(&events), vec![GeofenceTransition::Exit]);
    }

    #[test]
    fn inactive_and_foreign_geofences_are_skipped() {
        let engine = GeofenceEngine::new("me");
        let mut inactive = Geofence::new("Off", 0.0, 0.0, 100.0, GeofenceKind::Custom, "c1");
        inactive.active = false;
        let foreign = Geofence::new("Kid school", 0.0, 0.0, 100.0, GeofenceKind::School, "c1")
            .with_members(["kid"]);
        engine.register(inactive).unwrap();
        engine.register(foreign).unwrap();

        assert!(engine.evaluate(&sample_at_distance((0.0, 0.0), 10.0, 0)).is_empty());
        assert_eq!(engine.list_active().len(), 1);
    }

    #[test]
    fn unregister_drops_containment() {
        let fence = Geofence::new("Home", 0.0, 0.0, 100.0, GeofenceKind::Home, "c1");
        let id = fence.id;
        let engine = engine_with(fence.clone());
        engine.evaluate(&sample_at_distance((0.0, 0.0), 10.0, 0));
        assert_eq!(engine.is_inside(id), Some(true));

        engine.unregister(id).unwrap();
        assert_eq!(engine.is_inside(id), None);
        assert!(matches!(engine.unregister(id), Err(LocationError::GeofenceNotFound(_))));

        // Re-registering starts from outside again.
        engine.register(fence).unwrap();
        let events = engine.evaluate(&sample_at_distance((0.0, 0.0), 10.0, 1));
        assert_eq!(transitions(&events), vec![GeofenceTransition::Enter]);
    }

    #[test]
    fn invalid_radius_is_rejected() {
        let engine = GeofenceEngine::new("me");
        let fence = Geofence::new("Bad", 0.0, 0.0, 0.0, GeofenceKind::Custom, "c1");
        assert!(matches!(engine.register(fence), Err(LocationError::InvalidRadius(_))));

        let fence = Geofence::new("Good", 0.0, 0.0, 50.0, GeofenceKind::Custom, "c1");
        let id = fence.id;
        engine.register(fence).unwrap();
        let bad = GeofenceUpdate { radius_meters: Some(-1.0), ..Default::default() };
        assert!(engine.update(id, &bad).is_err());
        assert_eq!(engine.get(id).unwrap().radius_meters, 50.0);
    }

    #[test]
    fn moving_a_geofence_resets_containment() {
        let fence = Geofence::new("Home", 0.0, 0.0, 100.0, GeofenceKind::Home, "c1");
        let id = fence.id;
        let engine = engine_with(fence);
        engine.evaluate(&sample_at_distance((0.0, 0.0), 10.0, 0));
        assert_eq!(engine.is_inside(id), Some(true));

        let rename = GeofenceUpdate { name: Some("Casa".to_string()), ..Default::default() };
        engine.update(id, &rename).unwrap();
        assert_eq!(engine.is_inside(id), Some(true));

        let grow = GeofenceUpdate { radius_meters: Some(200.0), ..Default::default() };
        engine.update(id, &grow).unwrap();
        assert_eq!(engine.is_inside(id), Some(false));
    }

    #[test]
    fn stay_fires_once_per_episode() {
        let fence = Geofence::new("School", 0.0, 0.0, 100.0, GeofenceKind::School, "c1")
            .with_stay_notification(15);
        let engine = engine_with(fence);

        // Minutes since the first sample: enter at 0, cross threshold at 15.
        let script = [(0, 10.0), (5, 10.0), (15, 10.0), (30, 10.0), (40, 500.0), (41, 10.0), (60, 10.0)];
        let mut raised = Vec::new();
        for (minute, meters) in script {
            let events = engine.evaluate(&sample_at_distance((0.0, 0.0), meters, minute * 60));
            raised.extend(transitions(&events));
        }

        assert_eq!(
            raised,
            vec![
                GeofenceTransition::Enter,
                GeofenceTransition::Stay,
                GeofenceTransition::Exit,
                GeofenceTransition::Enter,
                GeofenceTransition::Stay,
            ]
        );
    }

    #[test]
    fn listeners_receive_events() {
        use std::sync::{Arc, Mutex};

        let fence = Geofence::new("Home", 0.0, 0.0, 100.0, GeofenceKind::Home, "c1");
        let engine = engine_with(fence);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            engine.subscribe(move |e| seen.lock().unwrap().push(e.transition))
        };

        engine.evaluate(&sample_at_distance((0.0, 0.0), 10.0, 0));
        engine.evaluate(&sample_at_distance((0.0, 0.0), 1_000.0, 1));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![GeofenceTransition::Enter, GeofenceTransition::Exit]
        );
    }
}
