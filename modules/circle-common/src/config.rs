use std::env;
use std::time::Duration;

use crate::error::LocationError;

/// Tuning for the location core, loaded from environment variables.
/// Every key has a default; only malformed values are errors.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationConfig {
    // Acquisition
    pub immediate_fix_timeout: Duration,
    pub emergency_fix_timeout: Duration,
    pub default_interval_ms: u64,
    pub min_displacement_meters: f64,

    // Annotation
    pub geocode_timeout: Duration,
    /// How long the ordered sample path waits for annotation before
    /// evaluating the raw sample. Capped at `geocode_timeout`.
    pub annotation_window: Duration,
    pub nominatim_url: String,
    pub nominatim_user_agent: String,

    // Realtime channel
    pub publish_timeout: Duration,

    // Safety zones
    pub safety_alert_min_interval: Option<Duration>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            immediate_fix_timeout: Duration::from_millis(5_000),
            emergency_fix_timeout: Duration::from_millis(15_000),
            default_interval_ms: 10_000,
            min_displacement_meters: 10.0,
            geocode_timeout: Duration::from_millis(4_000),
            annotation_window: Duration::from_millis(500),
            nominatim_url: "https://nominatim.openstreetmap.org".to_string(),
            nominatim_user_agent: format!("circle-location/{}", env!("CARGO_PKG_VERSION")),
            publish_timeout: Duration::from_millis(5_000),
            safety_alert_min_interval: None,
        }
    }
}

impl LocationConfig {
    pub fn from_env() -> Result<Self, LocationError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            immediate_fix_timeout: env_millis("CIRCLE_IMMEDIATE_FIX_TIMEOUT_MS")?
                .unwrap_or(defaults.immediate_fix_timeout),
            emergency_fix_timeout: env_millis("CIRCLE_EMERGENCY_FIX_TIMEOUT_MS")?
                .unwrap_or(defaults.emergency_fix_timeout),
            default_interval_ms: env_parse("CIRCLE_DEFAULT_INTERVAL_MS")?
                .unwrap_or(defaults.default_interval_ms),
            min_displacement_meters: env_parse("CIRCLE_MIN_DISPLACEMENT_M")?
                .unwrap_or(defaults.min_displacement_meters),
            geocode_timeout: env_millis("CIRCLE_GEOCODE_TIMEOUT_MS")?
                .unwrap_or(defaults.geocode_timeout),
            annotation_window: env_millis("CIRCLE_ANNOTATION_WINDOW_MS")?
                .unwrap_or(defaults.annotation_window),
            nominatim_url: env::var("NOMINATIM_URL").unwrap_or(defaults.nominatim_url),
            nominatim_user_agent: env::var("NOMINATIM_USER_AGENT")
                .unwrap_or(defaults.nominatim_user_agent),
            publish_timeout: env_millis("CIRCLE_PUBLISH_TIMEOUT_MS")?
                .unwrap_or(defaults.publish_timeout),
            safety_alert_min_interval: env_parse::<u64>("CIRCLE_SAFETY_ALERT_MIN_INTERVAL_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        tracing::info!("Location config loaded:");
        tracing::info!("  immediate fix timeout: {:?}", self.immediate_fix_timeout);
        tracing::info!("  emergency fix timeout: {:?}", self.emergency_fix_timeout);
        tracing::info!("  default interval: {}ms", self.default_interval_ms);
        tracing::info!("  min displacement: {}m", self.min_displacement_meters);
        tracing::info!("  geocode timeout: {:?}", self.geocode_timeout);
        tracing::info!("  annotation window: {:?}", self.annotation_window);
        tracing::info!("  NOMINATIM_URL: {}", self.nominatim_url);
        tracing::info!("  publish timeout: {:?}", self.publish_timeout);
        match self.safety_alert_min_interval {
            Some(interval) => tracing::info!("  safety alert min interval: {:?}", interval),
            None => tracing::info!("  safety alert min interval: none (every sample)"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, LocationError> {
    match env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LocationError::Config(format!("{key} has invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, LocationError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}
