//! Operator dashboard: derived views over the live request set.
//!
//! `DashboardView::derive` is a pure function of one snapshot. `Dashboard`
//! keeps the most recent snapshot pushed by the store and nothing else.

pub mod export;
pub mod sync;

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::{
    metrics,
    request::{Request, Urgency},
    store::Snapshot,
};

pub use export::{export_csv, export_filename};
pub use sync::DashboardSync;

/// Operator-selected view over approved requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterMode {
    #[default]
    All,
    Critical,
    Water,
    Medical,
}

impl FilterMode {
    /// Parse a mode name; anything unrecognized behaves like `ALL`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_uppercase().as_str() {
            "CRITICAL" => FilterMode::Critical,
            "WATER" => FilterMode::Water,
            "MEDICAL" | "MED" => FilterMode::Medical,
            _ => FilterMode::All,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::All => "ALL",
            FilterMode::Critical => "CRITICAL",
            FilterMode::Water => "WATER",
            FilterMode::Medical => "MEDICAL",
        }
    }

    pub fn matches(&self, request: &Request) -> bool {
        match self {
            FilterMode::All => true,
            FilterMode::Critical => request.urgency.is_critical(),
            FilterMode::Water => item_contains(request, &["water"]),
            FilterMode::Medical => item_contains(request, &["medicine", "health"]),
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn item_contains(request: &Request, needles: &[&str]) -> bool {
    let item = request.item.to_lowercase();
    needles.iter().any(|needle| item.contains(needle))
}

/// Kind of aid, used by map clients to pick a marker glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemCategory {
    Water,
    Medical,
    Food,
    Clothing,
    General,
}

impl ItemCategory {
    pub fn of(request: &Request) -> Self {
        if item_contains(request, &["water"]) {
            ItemCategory::Water
        } else if item_contains(request, &["medicine", "health"]) {
            ItemCategory::Medical
        } else if item_contains(request, &["food", "rice"]) {
            ItemCategory::Food
        } else if item_contains(request, &["cloth"]) {
            ItemCategory::Clothing
        } else {
            ItemCategory::General
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MarkerStyle {
    pub category: ItemCategory,
    pub urgency: Urgency,
    /// Critical markers are drawn animated.
    pub pulse: bool,
}

impl MarkerStyle {
    pub fn of(request: &Request) -> Self {
        Self {
            category: ItemCategory::of(request),
            urgency: request.urgency,
            pulse: request.urgency.is_critical(),
        }
    }
}

/// An approved request as placed on the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapEntry {
    #[serde(flatten)]
    pub request: Request,
    pub marker: MarkerStyle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub critical_count: usize,
    pub active_count: usize,
    pub pending_count: usize,
}

impl Metrics {
    pub fn of(requests: &[Request]) -> Self {
        let mut metrics = Metrics::default();
        for request in requests {
            if request.is_pending() {
                metrics.pending_count += 1;
            } else {
                metrics.active_count += 1;
                if request.urgency.is_critical() {
                    metrics.critical_count += 1;
                }
            }
        }
        metrics
    }

    pub fn total(&self) -> usize {
        self.pending_count + self.active_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub filter: FilterMode,
    pub metrics: Metrics,
    /// Verification queue, oldest first.
    pub pending: Vec<Request>,
    /// Approved-or-later requests passing the filter.
    pub visible: Vec<MapEntry>,
}

impl DashboardView {
    pub fn derive(requests: &[Request], filter: FilterMode) -> Self {
        let (pending, approved): (Vec<&Request>, Vec<&Request>) =
            requests.iter().partition(|r| r.is_pending());

        let visible = approved
            .into_iter()
            .filter(|r| filter.matches(r))
            .map(|r| MapEntry {
                request: r.clone(),
                marker: MarkerStyle::of(r),
            })
            .collect();

        Self {
            filter,
            metrics: Metrics::of(requests),
            pending: pending.into_iter().cloned().collect(),
            visible,
        }
    }

    pub fn visible_requests(&self) -> impl Iterator<Item = &Request> {
        self.visible.iter().map(|entry| &entry.request)
    }
}

/// Holder of the last snapshot pushed by the store.
pub struct Dashboard {
    snapshot: ArcSwap<Vec<Request>>,
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Dashboard {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replace the current snapshot; the last push wins.
    pub fn update(&self, snapshot: Snapshot) {
        let metrics = Metrics::of(&snapshot);
        self.snapshot.store(snapshot);
        metrics::set_dashboard_gauges(
            metrics.pending_count,
            metrics.active_count,
            metrics.critical_count,
        );
        log::debug!(
            "Dashboard snapshot updated: pending={} active={} critical={}",
            metrics.pending_count,
            metrics.active_count,
            metrics.critical_count
        );
    }

    pub fn snapshot(&self) -> Arc<Vec<Request>> {
        self.snapshot.load_full()
    }

    pub fn metrics(&self) -> Metrics {
        Metrics::of(&self.snapshot.load())
    }

    pub fn view(&self, filter: FilterMode) -> DashboardView {
        DashboardView::derive(&self.snapshot.load(), filter)
    }
}
