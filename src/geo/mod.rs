//! Location resolution for approved requests.
//!
//! Precision order: citizen GPS unmodified, otherwise the district centroid
//! (or the island-wide default) displaced by a small random jitter so that
//! unrelated markers do not stack on one point.

use std::{collections::HashMap, sync::Mutex};

use once_cell::sync::Lazy;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;

use crate::request::{Coordinates, Request};

/// Maximum jitter applied independently to latitude and longitude, in degrees.
pub const JITTER_RADIUS: f64 = 0.025;

/// Centroid used when the district is not recognized.
pub const DEFAULT_CENTROID: Coordinates = Coordinates {
    lat: 7.8731,
    lng: 80.7718,
};

static DISTRICT_CENTROIDS: Lazy<HashMap<&'static str, Coordinates>> = Lazy::new(|| {
    [
        ("colombo", 6.9271, 79.8612),
        ("gampaha", 7.0840, 79.9939),
        ("kalutara", 6.5854, 79.9607),
        ("kandy", 7.2906, 80.6337),
        ("matale", 7.4675, 80.6234),
        ("nuwara eliya", 6.9497, 80.7891),
        ("galle", 6.0535, 80.2210),
        ("matara", 5.9549, 80.5550),
        ("hambantota", 6.1429, 81.1212),
        ("jaffna", 9.6615, 80.0255),
        ("kilinochchi", 9.3803, 80.4121),
        ("mannar", 8.9766, 79.9043),
        ("vavuniya", 8.7514, 80.4971),
        ("mullaitivu", 9.2671, 80.8142),
        ("batticaloa", 7.7310, 81.6747),
        ("ampara", 7.2817, 81.6747),
        ("trincomalee", 8.5874, 81.2152),
        ("kurunegala", 7.4863, 80.3649),
        ("puttalam", 8.0408, 79.8394),
        ("anuradhapura", 8.3114, 80.4037),
        ("polonnaruwa", 7.9403, 81.0188),
        ("badulla", 6.9934, 81.0550),
        ("monaragala", 6.8714, 81.3487),
        ("ratnapura", 6.6828, 80.3992),
        ("kegalle", 7.2513, 80.3464),
    ]
    .into_iter()
    .map(|(name, lat, lng)| (name, Coordinates::new(lat, lng)))
    .collect()
});

/// Trimmed, case-folded district key.
pub fn normalize_district(district: &str) -> String {
    district.trim().to_lowercase()
}

/// Centroid for a district, if it is one of the known names.
pub fn district_centroid(district: &str) -> Option<Coordinates> {
    DISTRICT_CENTROIDS
        .get(normalize_district(district).as_str())
        .copied()
}

/// Known district names in display order.
pub fn known_districts() -> Vec<&'static str> {
    let mut names: Vec<_> = DISTRICT_CENTROIDS.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Source of the random offsets used in the approximate path.
pub trait Jitter: Send + Sync {
    /// Offsets for latitude and longitude, each within `[-radius, radius]`.
    fn offsets(&self, radius: f64) -> (f64, f64);
}

/// Jitter drawn from the thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl Jitter for ThreadRngJitter {
    fn offsets(&self, radius: f64) -> (f64, f64) {
        let mut rng = rand::thread_rng();
        (
            rng.gen_range(-radius..=radius),
            rng.gen_range(-radius..=radius),
        )
    }
}

/// Reproducible jitter from a seeded generator.
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Jitter for SeededJitter {
    fn offsets(&self, radius: f64) -> (f64, f64) {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (
            rng.gen_range(-radius..=radius),
            rng.gen_range(-radius..=radius),
        )
    }
}

/// How trustworthy a resolved location is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Citizen GPS, used as-is.
    Exact,
    /// Known district centroid plus jitter.
    District,
    /// Coverage-wide default centroid plus jitter.
    Region,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Exact => "exact",
            Precision::District => "district",
            Precision::Region => "region",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub coordinates: Coordinates,
    pub precision: Precision,
    /// Reference point the jitter was applied to; equals `coordinates` for exact fixes.
    pub anchor: Coordinates,
}

/// Turns a request's self-reported location into public map coordinates.
///
/// Never fails; every path ends at the default centroid at worst.
pub struct GeoResolver {
    jitter: Box<dyn Jitter>,
}

impl Default for GeoResolver {
    fn default() -> Self {
        Self::new(Box::new(ThreadRngJitter))
    }
}

impl GeoResolver {
    pub fn new(jitter: Box<dyn Jitter>) -> Self {
        Self { jitter }
    }

    /// Resolve a request. The approximate path draws fresh jitter on every
    /// call, so the result must be persisted immediately.
    pub fn resolve(&self, request: &Request) -> Resolution {
        if let Some(gps) = request.gps() {
            return Resolution {
                coordinates: gps,
                precision: Precision::Exact,
                anchor: gps,
            };
        }

        let (anchor, precision) = match district_centroid(&request.district) {
            Some(centroid) => (centroid, Precision::District),
            None => {
                log::debug!(
                    "District '{}' not recognized, using default centroid",
                    request.district
                );
                (DEFAULT_CENTROID, Precision::Region)
            }
        };

        let (dlat, dlng) = self.jitter.offsets(JITTER_RADIUS);
        Resolution {
            coordinates: Coordinates::new(
                anchor.lat + dlat.clamp(-JITTER_RADIUS, JITTER_RADIUS),
                anchor.lng + dlng.clamp(-JITTER_RADIUS, JITTER_RADIUS),
            ),
            precision,
            anchor,
        }
    }
}
