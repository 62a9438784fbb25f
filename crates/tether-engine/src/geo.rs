//! Great-circle geometry on a spherical Earth.

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in metres between two points given in decimal degrees.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Point `distance_m` metres due north of `lat`. Used to build test tracks
/// and simulated drift.
pub fn offset_north(lat: f64, distance_m: f64) -> f64 {
    lat + (distance_m / EARTH_RADIUS_M).to_degrees()
}

/// Whether a coordinate pair is inside the valid WGS84 range.
pub fn in_bounds(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}
