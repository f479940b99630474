//! Coordinate parsing, range validation and great-circle distance.

use crate::types::{GeoPoint, SourceCoordinates};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two points, in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Checks WGS84 ranges: latitude in [-90, 90], longitude in [-180, 180].
pub fn validate(latitude: f64, longitude: f64) -> Result<GeoPoint, String> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(format!("latitude {latitude} out of range"));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(format!("longitude {longitude} out of range"));
    }
    Ok(GeoPoint {
        latitude,
        longitude,
    })
}

impl SourceCoordinates {
    /// Parses raw latitude/longitude cells. Both blank means absent; one
    /// blank, unparsable or out of range means malformed.
    pub fn parse(latitude: &str, longitude: &str) -> Self {
        let (lat, lon) = (latitude.trim(), longitude.trim());
        if lat.is_empty() && lon.is_empty() {
            return SourceCoordinates::Absent;
        }
        let parsed = lat
            .parse::<f64>()
            .map_err(|_| format!("latitude {lat:?} is not a number"))
            .and_then(|la| {
                lon.parse::<f64>()
                    .map_err(|_| format!("longitude {lon:?} is not a number"))
                    .map(|lo| (la, lo))
            })
            .and_then(|(la, lo)| validate(la, lo));
        match parsed {
            Ok(point) => SourceCoordinates::Point(point),
            Err(message) => SourceCoordinates::Malformed(message),
        }
    }

    /// Coordinates from already-numeric values.
    pub fn from_optional(latitude: Option<f64>, longitude: Option<f64>) -> Self {
        match (latitude, longitude) {
            (None, None) => SourceCoordinates::Absent,
            (Some(la), Some(lo)) => match validate(la, lo) {
                Ok(point) => SourceCoordinates::Point(point),
                Err(message) => SourceCoordinates::Malformed(message),
            },
            _ => SourceCoordinates::Malformed("latitude and longitude must both be given".into()),
        }
    }

    pub fn point(&self) -> Option<GeoPoint> {
        match self {
            SourceCoordinates::Point(p) => Some(*p),
            _ => None,
        }
    }
}
