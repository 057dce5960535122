use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use super::manager::{WorkflowError, WorkflowManager};
use super::types::{TransitionRequest, STATE_EXPIRED, SYSTEM_ACTOR};
use crate::observability::OperationTimer;
use crate::telemetry::{create_workflow_span, generate_correlation_id};

/// Outcome of one expiry pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    /// Records that moved on (new version, terminal, or gone) before we got to them
    pub skipped: usize,
    pub failed: usize,
}

/// Turns elapsed deadlines into `EXPIRED` transitions.
///
/// This is the periodic external caller the manager expects; the manager
/// itself never runs timers.
#[derive(Debug, Clone)]
pub struct ExpirySweeper {
    manager: WorkflowManager,
    actor: String,
    reason: String,
}

impl ExpirySweeper {
    pub fn new(manager: WorkflowManager) -> Self {
        Self {
            manager,
            actor: SYSTEM_ACTOR.to_string(),
            reason: "expired".to_string(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, WorkflowError> {
        self.sweep_at(Utc::now()).await
    }

    /// Expire everything whose deadline is before `now`. A failure on one
    /// record never stops the pass; only the initial query can fail it.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, WorkflowError> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("expiry_sweep", None, None, Some(&correlation_id));
        self.expire_overdue(now).instrument(span).await
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<SweepReport, WorkflowError> {
        let timer = OperationTimer::new("expiry_sweep");
        let candidates = self.manager.find_expired_at(now).await?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for workflow in candidates {
            let request = TransitionRequest::to(STATE_EXPIRED)
                .reason(self.reason.clone())
                .by(self.actor.clone());

            match self
                .manager
                .transition(workflow.id, workflow.version, request)
                .await
            {
                Ok(_) => report.expired += 1,
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(workflow_id = %workflow.id, error = %e, "Skipping workflow that changed during sweep");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(workflow_id = %workflow.id, error = %e, "Failed to expire workflow");
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "Expiry sweep finished"
            );
            timer.finish();
        }

        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting expiry sweeper");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Expiry sweep could not query expired workflows");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::memory::MemoryWorkflowStore;
    use crate::workflows::terminal::TerminalStates;
    use crate::workflows::types::{Payload, StartOptions};
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn manager() -> WorkflowManager {
        WorkflowManager::new(
            Arc::new(MemoryWorkflowStore::new()),
            TerminalStates::default(),
        )
    }

    #[tokio::test]
    async fn sweep_expires_only_overdue_workflows() {
        let manager = manager();
        let overdue = manager
            .start("MODAL", "V1", "OPEN", Payload::new(), StartOptions::new().expires_in_seconds(60))
            .await
            .unwrap();
        let fresh = manager
            .start("MODAL", "V2", "OPEN", Payload::new(), StartOptions::new().expires_in_seconds(3600))
            .await
            .unwrap();
        manager
            .start("MODAL", "V3", "OPEN", Payload::new(), StartOptions::new())
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(manager.clone());
        let report = sweeper
            .sweep_at(overdue.created_at + ChronoDuration::seconds(61))
            .await
            .unwrap();

        assert_eq!(
            report,
            SweepReport { examined: 1, expired: 1, skipped: 0, failed: 0 }
        );
        let expired = manager.get(overdue.id).await.unwrap().unwrap();
        assert_eq!(expired.current_state, STATE_EXPIRED);
        assert_eq!(expired.last_modified_by.as_deref(), Some(SYSTEM_ACTOR));
        assert_eq!(expired.transition_reason.as_deref(), Some("expired"));
        assert_eq!(manager.get(fresh.id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn second_sweep_finds_nothing() {
        let manager = manager();
        let wf = manager
            .start("MODAL", "V1", "OPEN", Payload::new(), StartOptions::new().expires_in_seconds(0))
            .await
            .unwrap();
        let sweeper = ExpirySweeper::new(manager).with_actor("cron");
        let at = wf.created_at + ChronoDuration::seconds(1);

        assert_eq!(sweeper.sweep_at(at).await.unwrap().expired, 1);
        assert_eq!(sweeper.sweep_at(at).await.unwrap(), SweepReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_signal() {
        let sweeper = ExpirySweeper::new(manager());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            sweeper.run(Duration::from_secs(30), rx).await;
        });
        tokio::time::sleep(Duration::from_secs(95)).await;
        tx.send(true).unwrap();

        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_stop_lets_the_running_pass_finish() {
        use crate::shutdown::ShutdownCoordinator;
        use crate::workflows::store::WorkflowStore;
        use crate::workflows::types::NewWorkflow;

        let store = Arc::new(MemoryWorkflowStore::new());
        let overdue = store
            .insert(NewWorkflow {
                workflow_type: "MODAL".to_string(),
                workflow_reference_id: "V1".to_string(),
                initial_state: "OPEN".to_string(),
                payload: Payload::new(),
                is_active: true,
                context_key: None,
                correlation_id: None,
                last_modified_by: None,
                expires_at: Some(Utc::now() - ChronoDuration::minutes(5)),
                created_at: Utc::now() - ChronoDuration::minutes(10),
            })
            .await
            .unwrap();
        let manager = WorkflowManager::new(store, TerminalStates::default());
        let sweeper = ExpirySweeper::new(manager.clone());

        let shutdown = ShutdownCoordinator::new();
        let receiver = shutdown.subscribe();
        let handle = tokio::spawn(async move {
            sweeper.run(Duration::from_secs(30), receiver).await;
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();
        handle.await.unwrap();

        assert!(shutdown.is_triggered());
        let swept = manager.get(overdue.id).await.unwrap().unwrap();
        assert_eq!(swept.current_state, STATE_EXPIRED);
    }
}
