//! Aid request data model.
//!
//! A `Request` is the only entity. Citizens create it through a `Submission`,
//! operators move it forward through `RequestPatch`es applied by the store.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use validator::{Validate, ValidationError};

use crate::core::{ReliefError, ReliefResult};

/// Document collection holding every request.
pub const COLLECTION: &str = "requests";

static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9+()\- ]+$").unwrap());

/// Lifecycle state of a request.
///
/// States only move forward. `Dispatched` is understood by the tracking view
/// but no operation currently produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Approved,
    Dispatched,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Approved => "approved",
            Status::Dispatched => "dispatched",
        }
    }

    /// Legal single-step transitions.
    pub fn can_advance_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Approved) | (Status::Approved, Status::Dispatched)
        )
    }

    /// Text shown to a citizen tracking this request.
    pub fn citizen_message(&self) -> &'static str {
        match self {
            Status::Pending => "Your request is in the queue waiting for verification.",
            Status::Approved => "Verified. We are currently locating a relief truck for your area.",
            Status::Dispatched => "Relief is on the way to your pinned location.",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical urgency levels.
///
/// Intake accepts the names case-insensitively, plus the long form
/// `Critical (Life Threatening)` as an alias of `Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub const ALL: [Urgency; 4] = [
        Urgency::Low,
        Urgency::Medium,
        Urgency::High,
        Urgency::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "Low",
            Urgency::Medium => "Medium",
            Urgency::High => "High",
            Urgency::Critical => "Critical",
        }
    }

    pub fn is_critical(&self) -> bool {
        *self == Urgency::Critical
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = ReliefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Urgency::Low),
            "medium" => Ok(Urgency::Medium),
            "high" => Ok(Urgency::High),
            "critical" | "critical (life threatening)" => Ok(Urgency::Critical),
            other => Err(ReliefError::Validation(format!(
                "unrecognized urgency level '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for Urgency {
    type Error = ReliefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Urgency> for String {
    fn from(value: Urgency) -> Self {
        value.as_str().to_string()
    }
}

/// A point on the map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Device-reported position, only present when the citizen granted geolocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "GpsFix::validate_finite"))]
pub struct GpsFix {
    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub lng: f64,
}

impl GpsFix {
    fn validate_finite(&self) -> Result<(), ValidationError> {
        if self.lat.is_finite() && self.lng.is_finite() {
            Ok(())
        } else {
            Err(ValidationError::new("gps_not_finite"))
        }
    }
}

impl From<GpsFix> for Coordinates {
    fn from(fix: GpsFix) -> Self {
        Coordinates::new(fix.lat, fix.lng)
    }
}

/// Outcome of asking the citizen's device for its position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "consent", rename_all = "snake_case")]
pub enum LocationConsent {
    Granted {
        lat: f64,
        lng: f64,
    },
    Denied,
    Unsupported,
    #[default]
    NotRequested,
}

impl LocationConsent {
    /// Resolve the consent into an optional fix.
    ///
    /// Denied and unsupported geolocation are `Permission` errors; the caller
    /// decides whether to continue without a fix.
    pub fn into_fix(self) -> ReliefResult<Option<GpsFix>> {
        match self {
            LocationConsent::Granted { lat, lng } => {
                let fix = GpsFix { lat, lng };
                fix.validate()?;
                Ok(Some(fix))
            }
            LocationConsent::Denied => Err(ReliefError::Permission(
                "device geolocation was denied".to_string(),
            )),
            LocationConsent::Unsupported => Err(ReliefError::Permission(
                "device geolocation is not supported".to_string(),
            )),
            LocationConsent::NotRequested => Ok(None),
        }
    }
}

/// Citizen intake form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Submission {
    #[validate(length(min = 1, max = 128))]
    pub district: String,
    #[validate(length(min = 1, max = 512))]
    pub item: String,
    #[validate(length(min = 1, max = 32), regex(path = *PHONE_PATTERN))]
    #[serde(default)]
    pub phone: Option<String>,
    pub urgency: String,
    #[serde(default)]
    pub location: LocationConsent,
}

impl Submission {
    /// Trim free-text fields; a blank phone counts as absent.
    pub fn normalized(mut self) -> Self {
        self.district = self.district.trim().to_string();
        self.item = self.item.trim().to_string();
        self.urgency = self.urgency.trim().to_string();
        self.phone = self
            .phone
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self
    }
}

/// Fields handed to the store on creation. The store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRequest {
    pub district: String,
    pub item: String,
    pub phone: Option<String>,
    pub urgency: Urgency,
    pub gps: Option<GpsFix>,
    pub timestamp: DateTime<Utc>,
}

/// A stored aid request.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    pub id: String,
    pub district: String,
    pub item: String,
    pub phone: Option<String>,
    pub urgency: Urgency,
    pub gps_lat: Option<f64>,
    pub gps_lng: Option<f64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

impl Request {
    /// Materialize a freshly created request under `id`.
    pub fn from_new(id: String, new: NewRequest) -> Self {
        Self {
            id,
            district: new.district,
            item: new.item,
            phone: new.phone,
            urgency: new.urgency,
            gps_lat: new.gps.map(|g| g.lat),
            gps_lng: new.gps.map(|g| g.lng),
            lat: None,
            lng: None,
            status: Status::Pending,
            timestamp: new.timestamp,
        }
    }

    /// Citizen-supplied exact position, if both halves are present.
    pub fn gps(&self) -> Option<Coordinates> {
        match (self.gps_lat, self.gps_lng) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }

    pub fn has_exact_gps(&self) -> bool {
        self.gps().is_some()
    }

    /// Resolved public map position, set at approval.
    pub fn location(&self) -> Option<Coordinates> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == Status::Pending
    }
}

/// Partial update applied atomically by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPatch {
    /// Write only if the stored status still equals this value.
    pub expect_status: Option<Status>,
    pub status: Option<Status>,
    pub location: Option<Coordinates>,
}

impl RequestPatch {
    /// Approval sets status and coordinates in the same write.
    pub fn approve(location: Coordinates) -> Self {
        Self {
            expect_status: Some(Status::Pending),
            status: Some(Status::Approved),
            location: Some(location),
        }
    }

    /// Produce the updated document, or `Conflict` if the precondition fails.
    pub fn apply(&self, current: &Request) -> ReliefResult<Request> {
        if let Some(expected) = self.expect_status {
            if current.status != expected {
                return Err(ReliefError::Conflict(format!(
                    "request {} is {}, expected {}",
                    current.id, current.status, expected
                )));
            }
        }

        let mut updated = current.clone();
        if let Some(status) = self.status {
            updated.status = status;
        }
        if let Some(location) = self.location {
            updated.lat = Some(location.lat);
            updated.lng = Some(location.lng);
        }
        Ok(updated)
    }
}
