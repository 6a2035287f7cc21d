//! Geographic utilities: great-circle distance and route framing.

use geo::{BoundingRect, MultiPoint, Point};

use crate::Coordinate;

/// Earth's radius in meters used for every distance in this crate.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two coordinates in meters.
///
/// Inputs are not validated; callers pass sane degrees.
///
/// # Example
/// ```
/// use puzzle_walk::{distance_meters, Coordinate};
///
/// let a = Coordinate::new(51.5074, -0.1278);
/// let b = Coordinate::new(51.5080, -0.1278);
/// let d = distance_meters(&a, &b);
/// assert!((d - 66.7).abs() < 0.5);
/// ```
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    // Rounding can push h a hair above 1 for antipodal points
    let c = 2.0 * h.sqrt().min(1.0).asin();

    EARTH_RADIUS_M * c
}

/// Latitude span in degrees covered by `meters` along a meridian.
pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    (meters / EARTH_RADIUS_M).to_degrees()
}

/// Longitude half-width in degrees that contains every point within
/// `meters` of a point at `lat`.
///
/// Returns `None` when no finite longitude band is conservative (near the
/// poles, or when the radius wraps around the globe); callers fall back to
/// scanning everything.
pub fn meters_to_lng_degrees(meters: f64, lat: f64) -> Option<f64> {
    let angle = meters / EARTH_RADIUS_M;
    let max_lat = (lat.abs().to_radians() + angle).min(std::f64::consts::FRAC_PI_2);
    let cos_lat = max_lat.cos();
    if cos_lat < 1e-6 {
        return None;
    }
    let ratio = (angle / 2.0).sin() / cos_lat;
    if ratio >= 1.0 {
        return None;
    }
    Some((2.0 * ratio.asin()).to_degrees())
}

/// Center of the bounding box around a set of coordinates.
pub fn bounding_center(coords: &[Coordinate]) -> Option<Coordinate> {
    let points: MultiPoint<f64> = coords
        .iter()
        .map(|c| Point::new(c.lng, c.lat))
        .collect::<Vec<_>>()
        .into();
    let rect = points.bounding_rect()?;
    let center = rect.center();
    Some(Coordinate::new(center.y, center.x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = Coordinate::new(51.5074, -0.1278);
        assert_eq!(distance_meters(&a, &a), 0.0);
    }

    #[test]
    fn test_distance_symmetric_and_non_negative() {
        let pairs = [
            (Coordinate::new(51.5074, -0.1278), Coordinate::new(48.8566, 2.3522)),
            (Coordinate::new(-33.8688, 151.2093), Coordinate::new(40.7128, -74.0060)),
            (Coordinate::new(0.0, 179.9), Coordinate::new(0.0, -179.9)),
        ];
        for (a, b) in pairs {
            let ab = distance_meters(&a, &b);
            let ba = distance_meters(&b, &a);
            assert!(ab >= 0.0);
            assert!((ab - ba).abs() < 1e-6);
        }
    }

    #[test]
    fn test_distance_known_value() {
        // London to Paris is ~343.5km
        let london = Coordinate::new(51.5074, -0.1278);
        let paris = Coordinate::new(48.8566, 2.3522);
        let d = distance_meters(&london, &paris);
        assert!((d - 343_500.0).abs() < 1_000.0, "got {}", d);
    }

    #[test]
    fn test_distance_antipodal_is_finite() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(0.0, 180.0);
        let d = distance_meters(&a, &b);
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn test_lng_band_contains_radius() {
        let origin = Coordinate::new(60.0, 10.0);
        let band = meters_to_lng_degrees(50.0, origin.lat).unwrap();
        // A point exactly at the band edge on the same latitude is farther than 50m
        let edge = Coordinate::new(60.0, 10.0 + band);
        assert!(distance_meters(&origin, &edge) >= 50.0);
    }

    #[test]
    fn test_lng_band_near_pole() {
        assert!(meters_to_lng_degrees(50.0, 90.0).is_none());
    }

    #[test]
    fn test_bounding_center() {
        let coords = [Coordinate::new(10.0, 20.0), Coordinate::new(12.0, 24.0)];
        let center = bounding_center(&coords).unwrap();
        assert_eq!(center, Coordinate::new(11.0, 22.0));
        assert!(bounding_center(&[]).is_none());
    }
}
