//! Host-facing control surface: one harvest run at a time.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::config::HarvestConfig;
use super::registry::{CompletionRegistry, RegistrySummary};
use super::runtime::{RunContext, spawn_periodic};
use super::sink::NotificationSink;
use super::{admission, drain, supervisor};
use crate::input::TagSource;
use crate::output::ResultSinkFactory;
use crate::session::{SubscriptionSession, bounded};
use crate::types::RunId;

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum RunOutcome {
    /// Every tag was recorded or declared unreachable.
    Completed,
    /// `stop`/`shutdown` was called.
    Stopped,
    /// The server could not be reached at start, or the connection dropped
    /// and the reconnect policy ends the run.
    Reconnecting,
    /// The run could not start or a loop hit an unexpected error.
    Failed(String),
    /// `start` was called while another run was active; nothing was done.
    AlreadyRunning,
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub outcome: RunOutcome,
    pub summary: RegistrySummary,
    pub elapsed: Duration,
    pub result_file: Option<PathBuf>,
}

impl RunReport {
    fn without_work(run_id: RunId, outcome: RunOutcome, started: Instant) -> Self {
        Self {
            run_id,
            outcome,
            summary: RegistrySummary::default(),
            elapsed: started.elapsed(),
            result_file: None,
        }
    }
}

struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Clears the active-run slot however `start` exits, including when its
/// future is dropped.
struct ActiveRunGuard<'a> {
    slot: &'a Mutex<Option<ActiveRun>>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.slot.lock().take();
        self.done.send_replace(true);
    }
}

/// Resolves a tag list against one server, a batch at a time.
///
/// `start` drives a whole run and returns its [`RunReport`]; `stop` and
/// `shutdown` may be called from any other task and wait until the active
/// run has unwound.
pub struct HarvestProcessor {
    config: HarvestConfig,
    session: Arc<dyn SubscriptionSession>,
    tags: Arc<dyn TagSource>,
    output: Arc<dyn ResultSinkFactory>,
    active: Mutex<Option<ActiveRun>>,
}

impl fmt::Debug for HarvestProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self
            .active
            .try_lock()
            .map(|guard| guard.as_ref().map(|run| run.run_id))
            .unwrap_or_default();
        f.debug_struct("HarvestProcessor")
            .field("endpoint_url", &self.config.endpoint_url)
            .field("active_run", &active)
            .finish()
    }
}

impl HarvestProcessor {
    pub fn new(
        config: HarvestConfig,
        session: Arc<dyn SubscriptionSession>,
        tags: Arc<dyn TagSource>,
        output: Arc<dyn ResultSinkFactory>,
    ) -> Self {
        Self {
            config,
            session,
            tags,
            output,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Run one harvest to its end. Returns immediately with
    /// [`RunOutcome::AlreadyRunning`] when a run is already active.
    pub async fn start(&self) -> RunReport {
        let started = Instant::now();
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut active = self.active.lock();
            if let Some(run) = active.as_ref() {
                tracing::info!(
                    target: "harvest::runtime",
                    active_run = %run.run_id,
                    "start ignored, a run is already active"
                );
                return RunReport::without_work(run.run_id, RunOutcome::AlreadyRunning, started);
            }
            *active = Some(ActiveRun {
                run_id,
                cancel: cancel.clone(),
                done: done_rx,
            });
        }
        let _guard = ActiveRunGuard {
            slot: &self.active,
            cancel: cancel.clone(),
            done: done_tx,
        };

        let report = self.execute(run_id, cancel, started).await;
        tracing::info!(
            target: "harvest::summary",
            run_id = %report.run_id,
            outcome = ?report.outcome,
            total = report.summary.total,
            recorded = report.summary.recorded,
            unreachable = report.summary.unreachable,
            pending = report.summary.pending,
            elapsed = %super::progress::format_elapsed(report.elapsed),
            "harvest run finished"
        );
        report
    }

    /// Cancel the active run and wait for it to unwind. Calling it with no
    /// active run, or more than once, is a no-op.
    pub async fn stop(&self) {
        let active = self
            .active
            .lock()
            .as_ref()
            .map(|run| (run.run_id, run.cancel.clone(), run.done.clone()));
        let Some((run_id, cancel, mut done)) = active else {
            tracing::debug!(target: "harvest::runtime", "stop requested with no active run");
            return;
        };
        tracing::info!(target: "harvest::runtime", run_id = %run_id, "stopping run");
        cancel.cancel();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Stop used at process exit.
    pub async fn shutdown(&self) {
        tracing::info!(target: "harvest::runtime", "shutdown requested");
        self.stop().await;
    }

    async fn execute(&self, run_id: RunId, cancel: CancellationToken, started: Instant) -> RunReport {
        tracing::info!(
            target: "harvest::runtime",
            run_id = %run_id,
            endpoint = %self.config.endpoint_url,
            max_batch_size = self.config.schedule.max_batch_size,
            "starting harvest run"
        );

        if let Err(err) = self.config.validate() {
            return RunReport::without_work(run_id, RunOutcome::Failed(err.to_string()), started);
        }

        let tags = match self.tags.load().await {
            Ok(tags) => tags,
            Err(err) => {
                tracing::error!(target: "harvest::runtime", run_id = %run_id, error = %err, "failed to load tag list");
                return RunReport::without_work(
                    run_id,
                    RunOutcome::Failed(format!("tag list: {err}")),
                    started,
                );
            }
        };
        let mut registry = CompletionRegistry::new();
        let registered = registry.register(tags);
        if registered == 0 {
            tracing::warn!(target: "harvest::runtime", run_id = %run_id, "tag list is empty, nothing to do");
            return RunReport::without_work(run_id, RunOutcome::Completed, started);
        }

        let timeout = self.config.session.operation_timeout();
        let notifications = Arc::new(NotificationSink::new());
        if let Err(err) = bounded(
            timeout,
            "connect",
            self.session.connect(Arc::clone(&notifications)),
        )
        .await
        {
            let _ = bounded(timeout, "teardown", self.session.teardown()).await;
            // An unreachable server is retried by the host after its restart delay.
            let outcome = if err.is_transient() {
                tracing::warn!(target: "harvest::runtime", run_id = %run_id, error = %err, "initial connect failed, server unreachable");
                RunOutcome::Reconnecting
            } else {
                tracing::error!(target: "harvest::runtime", run_id = %run_id, error = %err, "initial connect failed");
                RunOutcome::Failed(format!("connect: {err}"))
            };
            let mut report = RunReport::without_work(run_id, outcome, started);
            report.summary = registry.summary();
            return report;
        }

        let output = self.output.open(Utc::now());
        let ctx = Arc::new(RunContext::new(
            run_id,
            self.config.clone(),
            Arc::clone(&self.session),
            notifications,
            Arc::clone(&output),
            registry,
            cancel.child_token(),
            started,
        ));

        let schedule = &self.config.schedule;
        let loops = vec![
            spawn_periodic(
                Arc::clone(&ctx),
                "admission",
                schedule.batch_interval(),
                admission::run_cycle,
            ),
            spawn_periodic(
                Arc::clone(&ctx),
                "drain",
                schedule.publish_interval(),
                drain::run_cycle,
            ),
            spawn_periodic(
                Arc::clone(&ctx),
                "supervisor",
                schedule.health_check_interval(),
                supervisor::run_cycle,
            ),
        ];

        ctx.cancel.cancelled().await;
        for handle in loops {
            if let Err(err) = handle.await {
                tracing::error!(target: "harvest::runtime", run_id = %run_id, error = %err, "loop task aborted");
            }
        }

        let outcome = ctx.outcome().unwrap_or(RunOutcome::Stopped);
        let summary = unwind(&ctx).await;

        RunReport {
            run_id,
            outcome,
            summary,
            elapsed: started.elapsed(),
            result_file: output.location(),
        }
    }
}

/// Release whatever the run still holds on the server and close the session.
async fn unwind(ctx: &RunContext) -> RegistrySummary {
    let timeout = ctx.operation_timeout();
    let mut state = ctx.state.lock().await;

    let live_epoch = ctx.connection_status().epoch == state.observed_epoch;
    let mut outstanding: Vec<_> = std::mem::take(&mut state.retire_backlog)
        .into_iter()
        .map(|(_, handle)| handle)
        .collect();
    outstanding.extend(state.registry.admitted_pending().filter_map(|entry| entry.handle));

    if live_epoch && ctx.session.is_connected() && !outstanding.is_empty() {
        match bounded(timeout, "unsubscribe", ctx.session.unsubscribe(&outstanding)).await {
            Ok(()) => tracing::debug!(
                target: "harvest::runtime",
                handles = outstanding.len(),
                "released outstanding handles"
            ),
            Err(err) => tracing::warn!(
                target: "harvest::runtime",
                error = %err,
                "failed to release outstanding handles"
            ),
        }
    }
    state.registry.release_all_handles();
    state.subscribed = 0;

    if let Err(err) = bounded(timeout, "teardown", ctx.session.teardown()).await {
        tracing::warn!(target: "harvest::runtime", error = %err, "session teardown failed");
    }
    ctx.notifications.clear();
    state.registry.summary()
}
