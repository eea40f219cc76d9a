//! Health reporting for the components of a service.
//!
//! [`ReadinessState`] holds three independent probe axes (started, ready, live) plus
//! free-form annotations. Any component may flip them; the orchestrator only reads them
//! through the routes built by [`router`].
//!
//! Liveness and readiness are independent: a draining process is alive (do not restart
//! it) but not ready (do not route traffic to it).
//!
//! [`start_probes`] pings external dependencies in the background; an axis affected by
//! several probes is healthy only when all of them are.

mod endpoint;
mod probe;
mod readiness;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub use endpoint::{router, ProbeResponse};
pub use probe::{
    checker_fn, start_probes, CheckerFn, DependencyCheck, DependencyProbe, ProbeStopper,
};
pub use readiness::{ReadinessState, ReadinessStatus, StatusKey};

/// Current UTC time formatted for health annotations.
pub fn timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339).unwrap_or_else(|_| now.to_string())
}
