//! Periodic reclamation of reservations whose TTL has passed.
//!
//! Several sweepers may run against the same ledger. Each release re-checks the row
//! under lock, so the worst a race can do is turn one sweeper's release into a no-op.

use shared::clock::Clock;
use shared::store::Ledger;
use shared::{DomainError, ReleaseReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reservations::{ReleaseOutcome, ReservationLedger};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub skipped: usize,
    pub released_quantity: i64,
}

pub struct ExpirySweeper {
    ledger: Arc<dyn Ledger>,
    reservations: ReservationLedger,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: i64,
}

impl ExpirySweeper {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        reservations: ReservationLedger,
        clock: Arc<dyn Clock>,
        interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            ledger,
            reservations,
            clock,
            interval,
            batch_size,
        }
    }

    /// Releases everything due at the time of the call, in batches of `batch_size`.
    /// Stops early when a whole batch is skipped, since those rows are held elsewhere.
    pub async fn sweep_once(&self) -> Result<SweepReport, DomainError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        loop {
            let due = self
                .ledger
                .expired_reservation_ids(now, self.batch_size)
                .await?;
            let fetched = due.len();
            report.examined += fetched;

            let mut released_in_batch = 0;
            for reservation_id in due {
                match self
                    .reservations
                    .release_reservation(reservation_id, ReleaseReason::Expired)
                    .await
                {
                    Ok(ReleaseOutcome::Released(r)) => {
                        released_in_batch += 1;
                        report.released_quantity += i64::from(r.quantity);
                    }
                    Ok(outcome) => {
                        debug!(%reservation_id, ?outcome, "Skipped reservation during sweep");
                        report.skipped += 1;
                    }
                    Err(e) => {
                        warn!(%reservation_id, error = %e, "Failed to expire reservation");
                        report.skipped += 1;
                    }
                }
            }
            report.expired += released_in_batch;

            if (fetched as i64) < self.batch_size || released_in_batch == 0 {
                break;
            }
        }

        Ok(report)
    }

    /// Sweeps on every tick until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Reservation expiry sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reservation expiry sweeper stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.sweep_once().await {
                Ok(report) if report.examined > 0 => {
                    info!(
                        examined = report.examined,
                        expired = report.expired,
                        skipped = report.skipped,
                        released_quantity = report.released_quantity,
                        "Swept expired reservations"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Reservation sweep failed"),
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
