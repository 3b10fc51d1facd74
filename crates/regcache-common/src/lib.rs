//! Common building blocks for the registry-cache monitoring reconciler:
//! errors, Kubernetes object helpers, and telemetry.

#![warn(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on objects written by the reconciler
pub const FIELD_MANAGER: &str = "registry-cache-monitoring";

/// Namespace of the shoot's system components (scrape targets live here)
pub const NAMESPACE_SYSTEM: &str = "kube-system";
