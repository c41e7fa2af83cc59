//! Request lifecycle: the only code allowed to move a request between states.
//!
//! Citizens create requests, operators approve or delete them. Every write
//! goes through the store in a single call so a failure leaves the request
//! exactly as it was.


use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use validator::Validate;

use crate::{
    core::{ReliefError, ReliefResult},
    geo::{GeoResolver, Precision},
    metrics,
    request::{NewRequest, Request, RequestPatch, Status, Submission, Urgency},
    store::RequestStore,
    validation_error,
};

/// What the citizen gets back after a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    /// Tracking id; the citizen's only way back to this request.
    pub id: String,
    /// Whether device GPS was attached.
    pub exact_location: bool,
    /// Set when geolocation was refused and the request went in without it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApproveOutcome {
    /// The request moved to approved with freshly resolved coordinates.
    Approved {
        request: Request,
        precision: Precision,
    },
    /// The request was already past pending; nothing was written.
    AlreadyApproved { request: Request },
}

impl ApproveOutcome {
    pub fn request(&self) -> &Request {
        match self {
            ApproveOutcome::Approved { request, .. } => request,
            ApproveOutcome::AlreadyApproved { request } => request,
        }
    }
}

/// Public tracking view of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingView {
    pub id: String,
    pub district: String,
    pub item: String,
    pub urgency: Urgency,
    pub status: Status,
    pub message: &'static str,
    pub on_map: bool,
    pub submitted_at: DateTime<Utc>,
}

impl From<&Request> for TrackingView {
    fn from(request: &Request) -> Self {
        Self {
            id: request.id.clone(),
            district: request.district.clone(),
            item: request.item.clone(),
            urgency: request.urgency,
            status: request.status,
            message: request.status.citizen_message(),
            on_map: request.location().is_some(),
            submitted_at: request.timestamp,
        }
    }
}

pub struct RequestLifecycle {
    store: Arc<dyn RequestStore>,
    resolver: GeoResolver,
}

impl RequestLifecycle {
    pub fn new(store: Arc<dyn RequestStore>, resolver: GeoResolver) -> Self {
        Self { store, resolver }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Validate a citizen submission and create a pending request.
    ///
    /// Refused geolocation does not block the submission; the receipt
    /// carries a notice and the request is later placed by district.
    pub async fn submit(&self, submission: Submission) -> ReliefResult<SubmitReceipt> {
        let submission = submission.normalized();
        submission.validate()?;
        let urgency: Urgency = submission.urgency.parse()?;

        let (gps, notice) = match submission.location.into_fix() {
            Ok(fix) => (fix, None),
            Err(ReliefError::Permission(reason)) => {
                warn!(
                    "Submission for district '{}' continues without GPS: {reason}",
                    submission.district
                );
                (
                    None,
                    Some(format!(
                        "Location unavailable ({reason}). Your request will be placed near the centre of {}.",
                        submission.district
                    )),
                )
            }
            Err(err) => return Err(err),
        };

        let new = NewRequest {
            district: submission.district,
            item: submission.item,
            phone: submission.phone,
            urgency,
            gps,
            timestamp: Utc::now(),
        };
        let district = new.district.clone();

        let id = self.store.create(new).await?;
        metrics::REQUESTS_SUBMITTED.inc();
        info!(
            "Request {id} submitted: district='{district}' urgency={urgency} exact_location={}",
            gps.is_some()
        );

        Ok(SubmitReceipt {
            id,
            exact_location: gps.is_some(),
            notice,
        })
    }

    /// Approve a pending request, resolving and storing its map position
    /// together with the new status.
    pub async fn approve(&self, id: &str) -> ReliefResult<ApproveOutcome> {
        let current = self.store.read(id).await?;
        if !current.is_pending() {
            info!("Request {id} is already {}, approval skipped", current.status);
            return Ok(ApproveOutcome::AlreadyApproved { request: current });
        }

        let resolution = self.resolver.resolve(&current);
        match self
            .store
            .update(id, RequestPatch::approve(resolution.coordinates))
            .await
        {
            Ok(request) => {
                metrics::REQUESTS_APPROVED
                    .with_label_values(&[resolution.precision.as_str()])
                    .inc();
                info!(
                    "Request {id} approved with {} precision",
                    resolution.precision.as_str()
                );
                Ok(ApproveOutcome::Approved {
                    request,
                    precision: resolution.precision,
                })
            }
            // another operator got there first
            Err(ReliefError::Conflict(reason)) => {
                let request = self.store.read(id).await?;
                if request.is_pending() {
                    return Err(ReliefError::Conflict(reason));
                }
                info!("Request {id} was approved concurrently, keeping stored location");
                Ok(ApproveOutcome::AlreadyApproved { request })
            }
            Err(err) => {
                log::error!("Failed to approve request {id}: {err}");
                Err(err)
            }
        }
    }

    /// Permanently remove a request, whatever its status.
    pub async fn delete(&self, id: &str) -> ReliefResult<()> {
        if let Err(err) = self.store.delete(id).await {
            if err.is_retryable() {
                log::error!("Failed to delete request {id}: {err}");
            }
            return Err(err);
        }
        metrics::REQUESTS_DELETED.inc();
        info!("Request {id} deleted");
        Ok(())
    }

    /// Unauthenticated read by tracking id.
    pub async fn lookup(&self, id: &str) -> ReliefResult<Request> {
        let id = id.trim();
        if id.is_empty() {
            return Err(validation_error!("tracking id is required"));
        }
        self.store.read(id).await
    }

    pub async fn track(&self, id: &str) -> ReliefResult<TrackingView> {
        let request = self.lookup(id).await?;
        Ok(TrackingView::from(&request))
    }
}
