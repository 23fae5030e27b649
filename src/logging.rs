//! Tracing setup for the write path.
//!
//! Builder events are emitted per mutation inside an `intention` span
//! carrying the transaction id and the base snapshot position, so events
//! from interleaved transactions stay distinguishable in one stream.

use tracing::{info_span, Span};
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, TreeLogError};

/// Filter directive scoped to this crate's events; `TREELOG_LOG`
/// overrides it when set.
fn crate_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_env("TREELOG_LOG") {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("treelog={level}"))
        .map_err(|e| TreeLogError::InvalidArgument(format!("invalid log level: {e}")))
}

/// Installs a process-wide subscriber showing this crate's mutation and
/// serialization events at `level`. The span context already names the
/// emitting module, so targets are suppressed.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(crate_filter(level)?)
        .with_target(false)
        .try_init()
        .map_err(|_| TreeLogError::InvalidArgument("logging already initialized".into()))
}

/// The span every builder operation runs under. One span per builder:
/// `rid` identifies the transaction, `snapshot` the position it reads
/// from.
pub(crate) fn intention_span(rid: u64, snapshot: u64) -> Span {
    info_span!("intention", rid, snapshot)
}
