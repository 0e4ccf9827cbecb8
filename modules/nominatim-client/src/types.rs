use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raw `/reverse?format=jsonv2` response body.
///
/// Nominatim answers "nothing here" with a 200 and an `error` field, so every
/// field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ReverseResponse {
    pub error: Option<String>,
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub place_type: Option<String>,
    pub addresstype: Option<String>,
    pub name: Option<String>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub address: HashMap<String, String>,
}

/// A reverse-geocoded place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversePlace {
    pub lat: f64,
    pub lon: f64,
    pub display_name: String,
    /// OSM main tag key, e.g. `building`, `place`, `highway`.
    pub category: Option<String>,
    /// OSM main tag value, e.g. `residential`, `suburb`, `office`.
    pub place_type: Option<String>,
    /// Nominatim's address rank name, e.g. `house`, `road`, `neighbourhood`.
    pub address_type: Option<String>,
    pub name: Option<String>,
    pub address: HashMap<String, String>,
}

impl ReversePlace {
    /// Short street-level address ("12 Elm Street, Springfield") when the
    /// components are present, falling back to the full display name.
    pub fn short_address(&self) -> String {
        let street = match (self.address.get("house_number"), self.address.get("road")) {
            (Some(number), Some(road)) => Some(format!("{number} {road}")),
            (None, Some(road)) => Some(road.clone()),
            _ => None,
        };
        let locality = ["city", "town", "village", "suburb"]
            .iter()
            .find_map(|key| self.address.get(*key));

        match (street, locality) {
            (Some(street), Some(locality)) => format!("{street}, {locality}"),
            (Some(street), None) => street,
            _ => self.display_name.clone(),
        }
    }
}

impl TryFrom<ReverseResponse> for ReversePlace {
    type Error = crate::NominatimError;

    fn try_from(resp: ReverseResponse) -> Result<Self, Self::Error> {
        if let Some(error) = resp.error {
            return Err(crate::NominatimError::NoResult(error));
        }
        let parse = |field: &str, raw: Option<String>| -> Result<f64, Self::Error> {
            raw.as_deref()
                .unwrap_or_default()
                .parse()
                .map_err(|_| crate::NominatimError::Parse(format!("bad {field}: {raw:?}")))
        };
        Ok(Self {
            lat: parse("lat", resp.lat)?,
            lon: parse("lon", resp.lon)?,
            display_name: resp.display_name.unwrap_or_default(),
            category: resp.category,
            place_type: resp.place_type,
            address_type: resp.addresstype,
            name: resp.name,
            address: resp.address,
        })
    }
}
