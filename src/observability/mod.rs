//! Logs and metrics.
//!
//! ```text
//! transport span (connection #n, peer)
//!     └→ worker span (request_id, method, path, generation)
//!          └→ filter / session / handler events
//!
//! dispatch, pool, session sweeper
//!     └→ metrics.rs recorders → Prometheus exporter (optional)
//! ```
//!
//! Nothing here is required for the engine to run: without an installed
//! subscriber or recorder the calls are no-ops.

pub mod logging;
pub mod metrics;
