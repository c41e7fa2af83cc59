//! reliefops: disaster relief request intake and operator dispatch service.
//!
//! Citizens submit relief requests, operators review and approve them from a
//! live dashboard, and approved requests are placed on the map with a
//! location precision that depends on what the citizen shared.

pub mod auth;
pub mod config;
pub mod core;
pub mod dashboard;
pub mod geo;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod request;
pub mod service;
pub mod store;
pub(crate) mod utils;
