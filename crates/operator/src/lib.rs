//! AMP operator: the backend component reconciler and the control loop that
//! drives it.
//!
//! A pass converges every backend resource of one `APIManager` in a fixed
//! order and stops at the first error. Passes for the same `APIManager` never
//! overlap; see [`PassLocks`].

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod controller;
pub mod locks;
pub mod report;

pub use backend::BackendReconciler;
pub use config::OperatorConfig;
pub use locks::{PassGuard, PassLocks};
pub use report::{PassReport, Step};
