//! Reverse geocoding backed by Nominatim.
//!
//! The address comes from Nominatim. The place label prefers the user's own
//! saved places (home, work) over anything OSM says, so a sample at home is
//! `Home` even when OSM calls the building `residential`.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::debug;

use circle_common::{
    haversine_meters, Annotation, Geofence, GeofenceKind, LocationConfig, PlaceLabel,
};
use nominatim_client::{NominatimClient, ReversePlace};

use crate::listeners::lock;
use crate::traits::GeocodeResolver;

/// OSM tags that read as "somewhere in a neighborhood".
const NEIGHBORHOOD_TAGS: &[&str] = &["residential", "suburb", "neighbourhood", "quarter", "house"];

/// A user-defined place that overrides the OSM classification.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedPlace {
    pub label: PlaceLabel,
    pub lat: f64,
    pub lon: f64,
    pub radius_meters: f64,
}

impl SavedPlace {
    pub fn new(label: PlaceLabel, lat: f64, lon: f64, radius_meters: f64) -> Self {
        Self {
            label,
            lat,
            lon,
            radius_meters,
        }
    }

    /// Home and work geofences double as saved places.
    pub fn from_geofence(fence: &Geofence) -> Option<Self> {
        let label = match fence.kind {
            GeofenceKind::Home => PlaceLabel::Home,
            GeofenceKind::Work => PlaceLabel::Work,
            _ => return None,
        };
        Some(Self::new(label, fence.center_lat, fence.center_lon, fence.radius_meters))
    }

    fn contains(&self, lat: f64, lon: f64) -> bool {
        haversine_meters(self.lat, self.lon, lat, lon) <= self.radius_meters
    }
}

/// Pick a place label for a coordinate.
pub fn classify_place(
    lat: f64,
    lon: f64,
    place: Option<&ReversePlace>,
    saved: &[SavedPlace],
) -> PlaceLabel {
    if let Some(hit) = saved.iter().find(|p| p.contains(lat, lon)) {
        return hit.label;
    }

    let Some(place) = place else {
        return PlaceLabel::Unknown;
    };
    let tags = [
        place.place_type.as_deref(),
        place.address_type.as_deref(),
        place.category.as_deref(),
    ];
    if tags
        .into_iter()
        .flatten()
        .any(|tag| NEIGHBORHOOD_TAGS.contains(&tag))
    {
        PlaceLabel::Neighborhood
    } else {
        PlaceLabel::Unknown
    }
}

pub struct NominatimGeocoder {
    client: NominatimClient,
    saved_places: Mutex<Vec<SavedPlace>>,
}

impl NominatimGeocoder {
    pub fn new(client: NominatimClient) -> Self {
        Self {
            client,
            saved_places: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &LocationConfig) -> Result<Self> {
        let client = NominatimClient::new(&config.nominatim_url, &config.nominatim_user_agent)?;
        Ok(Self::new(client))
    }

    pub fn set_saved_places(&self, places: Vec<SavedPlace>) {
        *lock(&self.saved_places) = places;
    }
}

#[async_trait]
impl GeocodeResolver for NominatimGeocoder {
    async fn resolve(&self, lat: f64, lon: f64) -> Result<Annotation> {
        let saved = lock(&self.saved_places).clone();

        match self.client.reverse(lat, lon).await {
            Ok(place) => Ok(Annotation {
                address: Some(place.short_address()),
                place_label: Some(classify_place(lat, lon, Some(&place), &saved)),
            }),
            Err(e) => {
                // Without an address a saved place is still worth reporting.
                let label = classify_place(lat, lon, None, &saved);
                if label == PlaceLabel::Unknown {
                    return Err(anyhow!("reverse geocode failed: {e}"));
                }
                debug!(error = %e, %label, "Reverse geocode failed, using saved place");
                Ok(Annotation {
                    address: None,
                    place_label: Some(label),
                })
            }
        }
    }
}
