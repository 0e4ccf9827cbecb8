pub mod types;
pub mod geo;
pub mod config;
pub mod error;

pub use types::*;
pub use geo::{haversine_meters, offset_meters, validate_coordinate, EARTH_RADIUS_M};
pub use config::LocationConfig;
pub use error::LocationError;
