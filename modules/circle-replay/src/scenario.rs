//! Scenario file format.
//!
//! A scenario names the local user, the circle roster, the geofences and
//! safety zones in play, and a list of timed steps to feed through a session.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use circle_common::{
    EmergencyKind, Geofence, GeofenceKind, RawFix, RemoteLocationUpdate, RosterMember, SafetyZone,
    ZoneKind,
};

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub circle_id: String,
    pub local_user: LocalUser,
    /// Clock origin for every step's `at_secs`.
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub roster: Vec<RosterMember>,
    #[serde(default)]
    pub geofences: Vec<FenceDef>,
    #[serde(default)]
    pub safety_zones: Vec<ZoneDef>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct LocalUser {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Deserialize)]
pub struct FenceDef {
    pub name: String,
    pub center: (f64, f64),
    pub radius_meters: f64,
    pub kind: GeofenceKind,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub stay_minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ZoneDef {
    pub name: String,
    pub center: (f64, f64),
    pub radius_meters: f64,
    pub kind: ZoneKind,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// A fix from the local device's position provider.
    Fix {
        lat: f64,
        lon: f64,
        #[serde(default = "default_accuracy")]
        accuracy: f64,
        at_secs: i64,
    },
    /// Another member's position arriving over the realtime channel.
    Remote {
        user_id: String,
        lat: f64,
        lon: f64,
        #[serde(default)]
        address: Option<String>,
        at_secs: i64,
    },
    Presence {
        user_id: String,
        online: bool,
    },
    Emergency {
        message: String,
        kind: EmergencyKind,
    },
    Start {
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    Stop,
}

fn default_accuracy() -> f64 {
    10.0
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let scenario: Scenario = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid scenario {}", path.display()))?;
        Ok(scenario)
    }

    pub fn at(&self, secs: i64) -> DateTime<Utc> {
        self.start_time + Duration::seconds(secs)
    }

    pub fn fix(&self, lat: f64, lon: f64, accuracy: f64, at_secs: i64) -> RawFix {
        RawFix::new(lat, lon, accuracy, self.at(at_secs))
    }

    pub fn remote(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
        address: Option<String>,
        at_secs: i64,
    ) -> RemoteLocationUpdate {
        RemoteLocationUpdate {
            user_id: user_id.to_string(),
            latitude: lat,
            longitude: lon,
            accuracy_meters: None,
            address,
            captured_at: self.at(at_secs),
        }
    }

    pub fn geofences(&self) -> Vec<Geofence> {
        self.geofences
            .iter()
            .map(|def| {
                let mut fence = Geofence::new(
                    def.name.clone(),
                    def.center.0,
                    def.center.1,
                    def.radius_meters,
                    def.kind,
                    self.circle_id.clone(),
                )
                .with_members(def.members.iter().cloned());
                if let Some(minutes) = def.stay_minutes {
                    fence = fence.with_stay_notification(minutes);
                }
                fence
            })
            .collect()
    }

    pub fn safety_zones(&self) -> Vec<SafetyZone> {
        self.safety_zones
            .iter()
            .map(|def| SafetyZone {
                description: def.description.clone(),
                ..SafetyZone::new(
                    def.name.clone(),
                    def.center.0,
                    def.center.1,
                    def.radius_meters,
                    def.kind,
                    self.circle_id.clone(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn bundled(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("scenarios")
            .join(name)
    }

    #[test]
    fn bundled_school_run_parses() {
        let scenario = Scenario::load(&bundled("school_run.json")).unwrap();

        assert_eq!(scenario.local_user.user_id, "alex");
        assert_eq!(scenario.roster.len(), 3);
        assert!(scenario.steps.iter().any(|s| matches!(s, Step::Emergency { .. })));

        let fences = scenario.geofences();
        assert!(fences.iter().all(|f| f.circle_id == scenario.circle_id));
        assert!(fences.iter().any(|f| f.notify_on_stay));
    }

    #[test]
    fn step_times_are_offsets_from_start() {
        let scenario = Scenario::load(&bundled("school_run.json")).unwrap();
        let fix = scenario.fix(37.0, -122.0, 5.0, 90);
        assert_eq!(fix.timestamp, scenario.start_time + Duration::seconds(90));
    }
}
