use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use warroom_core::events::BroadcastEvent;
use warroom_core::session::SessionStatus;

use crate::coordinator::SessionCoordinator;
use crate::error::CoordinatorError;

/// Outcome of one ticker cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    /// Listed as active but ended before the re-read.
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically announces the running duration of every active session.
pub struct DurationTicker {
    coordinator: Arc<SessionCoordinator>,
    period: Duration,
}

impl DurationTicker {
    pub fn new(coordinator: Arc<SessionCoordinator>, period: Duration) -> Self {
        Self {
            coordinator,
            period,
        }
    }

    /// Run one cycle. A failing session never aborts the rest of the cycle.
    pub fn tick_once(&self) -> TickReport {
        let mut report = TickReport::default();
        let active = match self
            .coordinator
            .storage()
            .list_sessions_by_status(SessionStatus::Active)
        {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list active sessions");
                return report;
            }
        };

        for listed in active {
            let session = match self.coordinator.session(&listed.id) {
                Ok(session) => session,
                Err(CoordinatorError::NotFound(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(session_id = %listed.id, error = %e, "duration tick failed");
                    report.failed += 1;
                    continue;
                }
            };
            if !session.is_active() {
                report.skipped += 1;
                continue;
            }
            let seconds = self.coordinator.current_duration(&session);
            self.coordinator.broadcast(&BroadcastEvent::DurationTick {
                session_id: session.id,
                seconds,
            });
            report.published += 1;
        }

        tracing::debug!(
            published = report.published,
            skipped = report.skipped,
            failed = report.failed,
            "duration tick cycle"
        );
        report
    }

    /// Spawn the periodic task. The first cycle runs one period after start.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        let ticker = Arc::new(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ticker.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::info!("duration ticker stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let cycle = Arc::clone(&ticker);
                        if let Err(e) = tokio::task::spawn_blocking(move || cycle.tick_once()).await {
                            tracing::error!(error = %e, "duration tick cycle panicked");
                        }
                    }
                }
            }
        })
    }
}
