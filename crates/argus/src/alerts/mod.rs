//! Alert records and the in-memory alerts vector.

pub mod types;
pub mod vector;

pub use types::{Alert, AlertStatus};
pub use vector::{AlertsVector, VectorCounters};
