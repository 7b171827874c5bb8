//! Draining the journal through the authenticated pipeline
//!
//! Entries are replayed one at a time in journal order. A mutation that stays
//! journaled stops the drain, so nothing queued behind it is applied first.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::AuthenticatedRequester;
use crate::error::{RequestError, Result};

/// What one pass over the journal did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Confirmed by the server and removed
    pub replayed: usize,
    /// Read-only entries that failed and were dropped
    pub discarded: usize,
    /// Mutations the server refused for good, removed
    pub rejected: usize,
    /// Entries left in the journal
    pub retained: usize,
    /// Mutation that stopped the drain
    pub halted_at: Option<String>,
    /// Why it stopped
    #[serde(skip)]
    pub halted_by: Option<RequestError>,
}

impl ReplayReport {
    /// Whether the journal was fully drained
    pub fn is_complete(&self) -> bool {
        self.halted_at.is_none()
    }
}

impl AuthenticatedRequester {
    /// Replay every journaled request in timestamp order.
    ///
    /// Fails without replaying anything if a record is malformed.
    pub async fn resume(&self) -> Result<ReplayReport> {
        let pending = self.journal().list().await?;
        let total = pending.len();
        let mut report = ReplayReport::default();

        if total == 0 {
            debug!("Journal is empty; nothing to replay");
            return Ok(report);
        }
        info!("Replaying {} journaled request(s)", total);

        for (index, request) in pending.into_iter().enumerate() {
            let id = request.id().to_string();
            let route = request.route().to_string();
            let read_only = request.is_read_only();

            let error = match self.submit(request).await {
                Ok(_) => {
                    debug!("Replayed request {} ({})", id, route);
                    report.replayed += 1;
                    continue;
                }
                Err(error) => error,
            };

            if read_only {
                debug!("Discarded read-only request {} ({}): {}", id, route, error);
                report.discarded += 1;
                continue;
            }

            if self.journal().get(&id).await?.is_none() {
                warn!("Request {} ({}) was rejected: {}", id, route, error);
                report.rejected += 1;
                continue;
            }

            warn!("Replay halted at request {} ({}): {}", id, route, error);
            report.retained = total - index;
            report.halted_at = Some(id);
            report.halted_by = Some(error);
            break;
        }

        info!(
            "Replay finished: {} replayed, {} discarded, {} rejected, {} retained",
            report.replayed, report.discarded, report.rejected, report.retained
        );
        Ok(report)
    }
}
