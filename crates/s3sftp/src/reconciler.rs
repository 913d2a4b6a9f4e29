//! Reaping of administratively closed sessions
//!
//! NIST 800-53: AC-12 (Session Termination), AC-2(13) (Disable Accounts for High-Risk Individuals)
//! Implementation: A fixed-period task asks the audit collaborator which live
//! sessions an operator has flagged and force-closes them. Ticks never stack:
//! a tick that overruns its period causes the missed ticks to be skipped.

use chrono::Utc;
use s3sftp_core::CloseReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AuditEvent;
use crate::session::{CloseOutcome, SessionRegistry};
use crate::Result;

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Live sessions considered
    pub candidates: usize,
    /// Sessions the audit collaborator flagged
    pub flagged: usize,
    /// Flagged sessions this tick removed from the registry
    pub closed: usize,
    /// Flagged sessions whose force-close request failed
    pub failures: usize,
}

pub struct ReconciliationScheduler {
    registry: Arc<SessionRegistry>,
    period: Duration,
}

impl ReconciliationScheduler {
    pub fn new(registry: Arc<SessionRegistry>, period: Duration) -> Self {
        Self { registry, period }
    }

    /// One reconciliation pass.
    ///
    /// An unreachable audit collaborator aborts the pass. A failure to close
    /// one session is logged and does not stop the others.
    pub async fn tick(&self) -> Result<TickReport> {
        let live = self.registry.live_ids();
        if live.is_empty() {
            return Ok(TickReport::default());
        }

        let flagged = self
            .registry
            .audit()
            .list_administratively_closed(&live)
            .await?;

        let mut report = TickReport {
            candidates: live.len(),
            flagged: flagged.len(),
            ..TickReport::default()
        };

        for persistence_id in flagged {
            // Closed by the client since the snapshot was taken.
            let Some(transport) = self.registry.transport(persistence_id) else {
                continue;
            };
            let username = self
                .registry
                .snapshot(persistence_id)
                .and_then(|s| s.username);

            transport.mark_administratively_closed();
            if let Err(e) = transport.force_close() {
                report.failures += 1;
                warn!(%persistence_id, error = %e, "Force close request failed");
            }

            AuditEvent::AdministrativeClose {
                persistence_id,
                username,
                timestamp: Utc::now(),
            }
            .log();

            if self
                .registry
                .on_session_closed(persistence_id, CloseReason::Administrative)
                .await
                == CloseOutcome::Closed
            {
                report.closed += 1;
            }
        }

        Ok(report)
    }

    /// Run `tick` every period until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                period_secs = self.period.as_secs(),
                "Reconciliation scheduler started"
            );

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match self.tick().await {
                    Ok(report) if report.flagged > 0 => {
                        info!(
                            event = "reconciliation",
                            candidates = report.candidates,
                            flagged = report.flagged,
                            closed = report.closed,
                            failures = report.failures,
                            "Administratively closed sessions reaped"
                        );
                    }
                    Ok(report) => {
                        debug!(candidates = report.candidates, "Reconciliation found nothing");
                    }
                    Err(e) => {
                        error!(error = %e, "Reconciliation tick aborted");
                    }
                }
            }

            info!("Reconciliation scheduler stopped");
        })
    }
}
