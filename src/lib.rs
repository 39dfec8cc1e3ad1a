//! Caravel backend core: observes container and pod state from Docker or
//! Kubernetes, reconciles it into a shared in-memory cache and fans accepted
//! updates out to the dashboard consumers.

pub mod cache;
pub mod command;
pub mod config;
pub mod docker;
pub mod error;
pub mod events;
pub mod health;
pub mod kubernetes;
pub mod model;
pub mod reconcile;
pub mod telemetry;

pub use cache::StatusCache;
pub use error::CaravelError;
