pub mod error;
pub mod types;

pub use error::{NominatimError, Result};
pub use types::ReversePlace;

use std::time::Duration;

use types::ReverseResponse;

pub struct NominatimClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl NominatimClient {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
        })
    }

    /// Reverse-geocode a coordinate to the nearest addressable place.
    pub async fn reverse(&self, lat: f64, lon: f64) -> Result<ReversePlace> {
        let endpoint = format!("{}/reverse", self.base_url);
        let lat_param = lat.to_string();
        let lon_param = lon.to_string();

        let resp = self
            .client
            .get(&endpoint)
            .query(&[
                ("lat", lat_param.as_str()),
                ("lon", lon_param.as_str()),
                ("format", "jsonv2"),
                ("addressdetails", "1"),
            ])
            .header("User-Agent", &self.user_agent)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(NominatimError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ReverseResponse = resp.json().await?;
        let place = ReversePlace::try_from(body)?;
        tracing::debug!(lat, lon, place_type = ?place.place_type, "Reverse geocoded");
        Ok(place)
    }
}
