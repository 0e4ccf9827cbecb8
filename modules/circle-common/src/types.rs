use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LocationError;
use crate::geo::{haversine_meters, validate_coordinate};

// --- Samples ---

/// Coarse classification of where a sample was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceLabel {
    Home,
    Work,
    Neighborhood,
    Unknown,
}

impl fmt::Display for PlaceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceLabel::Home => write!(f, "home"),
            PlaceLabel::Work => write!(f, "work"),
            PlaceLabel::Neighborhood => write!(f, "neighborhood"),
            PlaceLabel::Unknown => write!(f, "unknown"),
        }
    }
}

/// Output of a reverse-geocoding call. Either half may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub address: Option<String>,
    pub place_label: Option<PlaceLabel>,
}

/// One reading straight from the device position provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    pub altitude: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub speed_mps: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            altitude: None,
            heading_degrees: None,
            speed_mps: None,
            timestamp,
        }
    }
}

/// A timestamped position, optionally annotated with an address and place.
///
/// Samples are never edited in place: annotation produces a new value that
/// supersedes the raw one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    pub altitude: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub speed_mps: Option<f64>,
    pub captured_at: DateTime<Utc>,
    pub address: Option<String>,
    pub place_label: Option<PlaceLabel>,
}

impl LocationSample {
    pub fn from_fix(fix: &RawFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_meters: fix.accuracy_meters,
            altitude: fix.altitude,
            heading_degrees: fix.heading_degrees,
            speed_mps: fix.speed_mps,
            captured_at: fix.timestamp,
            address: None,
            place_label: None,
        }
    }

    pub fn with_annotation(self, annotation: Annotation) -> Self {
        Self {
            address: annotation.address,
            place_label: annotation.place_label,
            ..self
        }
    }

    pub fn is_annotated(&self) -> bool {
        self.address.is_some() || self.place_label.is_some()
    }

    /// Great-circle distance in meters from this sample to a point.
    pub fn distance_to(&self, lat: f64, lon: f64) -> f64 {
        haversine_meters(self.latitude, self.longitude, lat, lon)
    }

    /// Human-readable position: the address when known, otherwise coordinates.
    pub fn location_text(&self) -> String {
        match &self.address {
            Some(address) if !address.trim().is_empty() => address.clone(),
            _ => format!("{:.5}, {:.5}", self.latitude, self.longitude),
        }
    }
}

// --- Geofences ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceKind {
    Home,
    School,
    Work,
    Custom,
}

impl fmt::Display for GeofenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeofenceKind::Home => write!(f, "home"),
            GeofenceKind::School => write!(f, "school"),
            GeofenceKind::Work => write!(f, "work"),
            GeofenceKind::Custom => write!(f, "custom"),
        }
    }
}

/// A named circular region with enter/exit/stay notification policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: Uuid,
    pub name: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_meters: f64,
    pub kind: GeofenceKind,
    pub active: bool,
    pub circle_id: String,
    /// Members this geofence watches. Empty means every member.
    #[serde(default)]
    pub member_ids: HashSet<String>,
    pub notify_on_enter: bool,
    pub notify_on_exit: bool,
    #[serde(default)]
    pub notify_on_stay: bool,
    #[serde(default)]
    pub stay_threshold_minutes: u32,
}

impl Geofence {
    /// Active geofence that notifies on enter and exit.
    pub fn new(
        name: impl Into<String>,
        center_lat: f64,
        center_lon: f64,
        radius_meters: f64,
        kind: GeofenceKind,
        circle_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            center_lat,
            center_lon,
            radius_meters,
            kind,
            active: true,
            circle_id: circle_id.into(),
            member_ids: HashSet::new(),
            notify_on_enter: true,
            notify_on_exit: true,
            notify_on_stay: false,
            stay_threshold_minutes: 0,
        }
    }

    pub fn with_members<I, S>(mut self, member_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.member_ids = member_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stay_notification(mut self, threshold_minutes: u32) -> Self {
        self.notify_on_stay = true;
        self.stay_threshold_minutes = threshold_minutes;
        self
    }

    pub fn validate(&self) -> Result<(), LocationError> {
        validate_radius(self.radius_meters)?;
        validate_coordinate(self.center_lat, self.center_lon)
    }

    pub fn distance_from(&self, sample: &LocationSample) -> f64 {
        sample.distance_to(self.center_lat, self.center_lon)
    }

    pub fn contains(&self, sample: &LocationSample) -> bool {
        self.distance_from(sample) <= self.radius_meters
    }

    pub fn applies_to(&self, user_id: &str) -> bool {
        self.member_ids.is_empty() || self.member_ids.contains(user_id)
    }
}

/// Partial update for a registered geofence. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeofenceUpdate {
    pub name: Option<String>,
    pub center_lat: Option<f64>,
    pub center_lon: Option<f64>,
    pub radius_meters: Option<f64>,
    pub kind: Option<GeofenceKind>,
    pub active: Option<bool>,
    pub member_ids: Option<HashSet<String>>,
    pub notify_on_enter: Option<bool>,
    pub notify_on_exit: Option<bool>,
    pub notify_on_stay: Option<bool>,
    pub stay_threshold_minutes: Option<u32>,
}

impl GeofenceUpdate {
    /// Produce the updated geofence without touching the original.
    pub fn apply_to(&self, current: &Geofence) -> Geofence {
        let mut next = current.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(lat) = self.center_lat {
            next.center_lat = lat;
        }
        if let Some(lon) = self.center_lon {
            next.center_lon = lon;
        }
        if let Some(radius) = self.radius_meters {
            next.radius_meters = radius;
        }
        if let Some(kind) = self.kind {
            next.kind = kind;
        }
        if let Some(active) = self.active {
            next.active = active;
        }
        if let Some(member_ids) = &self.member_ids {
            next.member_ids = member_ids.clone();
        }
        if let Some(v) = self.notify_on_enter {
            next.notify_on_enter = v;
        }
        if let Some(v) = self.notify_on_exit {
            next.notify_on_exit = v;
        }
        if let Some(v) = self.notify_on_stay {
            next.notify_on_stay = v;
        }
        if let Some(v) = self.stay_threshold_minutes {
            next.stay_threshold_minutes = v;
        }
        next
    }
}

// --- Safety zones ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    Safe,
    Warning,
    Danger,
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneKind::Safe => write!(f, "safe"),
            ZoneKind::Warning => write!(f, "warning"),
            ZoneKind::Danger => write!(f, "danger"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyZone {
    pub id: Uuid,
    pub name: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_meters: f64,
    pub kind: ZoneKind,
    pub description: Option<String>,
    pub circle_id: String,
}

impl SafetyZone {
    pub fn new(
        name: impl Into<String>,
        center_lat: f64,
        center_lon: f64,
        radius_meters: f64,
        kind: ZoneKind,
        circle_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            center_lat,
            center_lon,
            radius_meters,
            kind,
            description: None,
            circle_id: circle_id.into(),
        }
    }

    pub fn validate(&self) -> Result<(), LocationError> {
        validate_radius(self.radius_meters)?;
        validate_coordinate(self.center_lat, self.center_lon)
    }

    pub fn distance_from(&self, sample: &LocationSample) -> f64 {
        sample.distance_to(self.center_lat, self.center_lon)
    }
}

fn validate_radius(radius_meters: f64) -> Result<(), LocationError> {
    if radius_meters.is_finite() && radius_meters > 0.0 {
        Ok(())
    } else {
        Err(LocationError::InvalidRadius(radius_meters))
    }
}

// --- Circle members ---

/// A known member of the active circle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RosterMember {
    pub user_id: String,
    pub user_name: String,
    pub circle_id: String,
}

impl RosterMember {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        circle_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            circle_id: circle_id.into(),
        }
    }
}

/// Latest known position of one circle member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleMemberLocation {
    pub user_id: String,
    pub user_name: String,
    pub circle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub captured_at: DateTime<Utc>,
    pub address: Option<String>,
    pub place_label: Option<PlaceLabel>,
    pub is_online: bool,
}

/// A member position received over the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLocationUpdate {
    pub user_id: String,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon")]
    pub longitude: f64,
    #[serde(default, alias = "accuracy")]
    pub accuracy_meters: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(alias = "timestamp")]
    pub captured_at: DateTime<Utc>,
}

// --- Outbound payloads ---

/// What the local device broadcasts for each sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub address: Option<String>,
}

impl From<&LocationSample> for OutboundLocation {
    fn from(sample: &LocationSample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy_meters: Some(sample.accuracy_meters),
            address: sample.address.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    Sos,
    Medical,
    Accident,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub message: String,
    pub location_text: String,
    pub kind: EmergencyKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lat: f64, lon: f64) -> LocationSample {
        LocationSample::from_fix(&RawFix::new(lat, lon, 5.0, Utc::now()))
    }

    #[test]
    fn annotation_supersedes_without_touching_position() {
        let raw = sample(37.0, -122.0);
        let annotated = raw.clone().with_annotation(Annotation {
            address: Some("1 Main St".to_string()),
            place_label: Some(PlaceLabel::Home),
        });

        assert!(!raw.is_annotated());
        assert!(annotated.is_annotated());
        assert_eq!(annotated.latitude, raw.latitude);
        assert_eq!(annotated.captured_at, raw.captured_at);
        assert_eq!(annotated.location_text(), "1 Main St");
    }

    #[test]
    fn location_text_falls_back_to_coordinates() {
        let s = sample(37.123456, -122.5);
        assert_eq!(s.location_text(), "37.12346, -122.50000");
    }

    #[test]
    fn geofence_radius_must_be_positive() {
        let fence = Geofence::new("Home", 37.0, -122.0, 0.0, GeofenceKind::Home, "c1");
        assert!(matches!(fence.validate(), Err(LocationError::InvalidRadius(_))));

        let fence = Geofence::new("Home", 37.0, -122.0, -5.0, GeofenceKind::Home, "c1");
        assert!(fence.validate().is_err());

        let zone = SafetyZone::new("Lake", 37.0, -122.0, f64::NAN, ZoneKind::Danger, "c1");
        assert!(zone.validate().is_err());
    }

    #[test]
    fn empty_member_set_applies_to_everyone() {
        let fence = Geofence::new("School", 37.0, -122.0, 100.0, GeofenceKind::School, "c1");
        assert!(fence.applies_to("anyone"));

        let scoped = fence.with_members(["kid-1"]);
        assert!(scoped.applies_to("kid-1"));
        assert!(!scoped.applies_to("parent-1"));
    }

    #[test]
    fn partial_update_only_touches_set_fields() {
        let fence = Geofence::new("Work", 37.0, -122.0, 100.0, GeofenceKind::Work, "c1");
        let update = GeofenceUpdate {
            radius_meters: Some(250.0),
            notify_on_exit: Some(false),
            ..Default::default()
        };
        let next = update.apply_to(&fence);
        assert_eq!(next.radius_meters, 250.0);
        assert!(!next.notify_on_exit);
        assert_eq!(next.name, "Work");
        assert_eq!(next.id, fence.id);
        assert_eq!(fence.radius_meters, 100.0);
    }

    #[test]
    fn remote_update_accepts_wire_field_names() {
        let json = serde_json::json!({
            "user_id": "u2",
            "lat": 37.5,
            "lon": -122.1,
            "accuracy": 12.0,
            "timestamp": "2026-01-01T00:00:00Z"
        });
        let update: RemoteLocationUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(update.latitude, 37.5);
        assert_eq!(update.accuracy_meters, Some(12.0));
        assert!(update.address.is_none());
    }
}
