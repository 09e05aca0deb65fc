//! Shared run context and the periodic loop driver used by the admission,
//! drain, and supervisor loops.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::budget::AdmissionBudget;
use super::config::HarvestConfig;
use super::processor::RunOutcome;
use super::registry::CompletionRegistry;
use super::sink::NotificationSink;
use super::supervisor::{ConnectionState, ConnectionStatus};
use crate::error::Result;
use crate::output::ResultSink;
use crate::session::SubscriptionSession;
use crate::types::{MonitoredHandle, RunId, TagId};

/// What a loop does after one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopFlow {
    Continue,
    Finished(RunOutcome),
}

/// Scheduler state shared by the admission and drain loops. Each cycle holds
/// the lock from its first read to its last write.
#[derive(Debug)]
pub(crate) struct HarvestState {
    pub(crate) registry: CompletionRegistry,
    pub(crate) budget: AdmissionBudget,
    /// Tags currently bound to the live subscription, including ones
    /// waiting in `retire_backlog`.
    pub(crate) subscribed: usize,
    /// Retired handles whose unsubscribe failed; retried on the next drain.
    pub(crate) retire_backlog: Vec<(TagId, MonitoredHandle)>,
    /// Slots an admission took but did not fill. Granted back on the next
    /// drain.
    pub(crate) slot_credits: usize,
    pub(crate) observed_epoch: u64,
    /// Set when a new session was observed; cleared by the next drain.
    pub(crate) reconnected: bool,
    pub(crate) last_admitted: usize,
    pub(crate) last_admission: Option<Instant>,
}

impl HarvestState {
    pub(crate) fn new(registry: CompletionRegistry, max_batch_size: usize, epoch: u64) -> Self {
        Self {
            registry,
            budget: AdmissionBudget::new(max_batch_size),
            subscribed: 0,
            retire_backlog: Vec::new(),
            slot_credits: 0,
            observed_epoch: epoch,
            reconnected: false,
            last_admitted: 0,
            last_admission: None,
        }
    }

    /// Forget every binding to a session that no longer exists.
    /// Returns `true` when `epoch` is new.
    pub(crate) fn sync_epoch(&mut self, epoch: u64) -> bool {
        if epoch == self.observed_epoch {
            return false;
        }
        let released = self.registry.release_all_handles();
        self.observed_epoch = epoch;
        self.subscribed = 0;
        self.retire_backlog.clear();
        self.slot_credits = 0;
        self.budget.fill(0);
        self.reconnected = true;
        tracing::info!(
            target: "harvest::runtime",
            epoch,
            released,
            pending = self.registry.summary().pending,
            "new session observed, handles from the previous session released"
        );
        true
    }
}

/// Everything one run's loops share.
pub(crate) struct RunContext {
    pub(crate) run_id: RunId,
    pub(crate) config: HarvestConfig,
    pub(crate) session: Arc<dyn SubscriptionSession>,
    pub(crate) notifications: Arc<NotificationSink>,
    pub(crate) output: Arc<dyn ResultSink>,
    pub(crate) state: Mutex<HarvestState>,
    pub(crate) connection: watch::Sender<ConnectionStatus>,
    pub(crate) cancel: CancellationToken,
    pub(crate) started: Instant,
    outcome: parking_lot::Mutex<Option<RunOutcome>>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self
            .state
            .try_lock()
            .map(|state| state.registry.summary())
            .ok();
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("connection", &*self.connection.borrow())
            .field("summary", &summary)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: RunId,
        config: HarvestConfig,
        session: Arc<dyn SubscriptionSession>,
        notifications: Arc<NotificationSink>,
        output: Arc<dyn ResultSink>,
        registry: CompletionRegistry,
        cancel: CancellationToken,
        started: Instant,
    ) -> Self {
        let initial = ConnectionStatus::connected(1);
        let max_batch_size = config.schedule.max_batch_size;
        Self {
            run_id,
            config,
            session,
            notifications,
            output,
            state: Mutex::new(HarvestState::new(registry, max_batch_size, initial.epoch)),
            connection: watch::Sender::new(initial),
            cancel,
            started,
            outcome: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn connection_status(&self) -> ConnectionStatus {
        *self.connection.borrow()
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        self.config.session.operation_timeout()
    }

    /// Record how the run ended and stop every loop. The first outcome wins.
    pub(crate) fn finish(&self, outcome: RunOutcome) {
        {
            let mut slot = self.outcome.lock();
            if slot.is_none() {
                *slot = Some(outcome);
            }
        }
        self.cancel.cancel();
    }

    pub(crate) fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.lock().clone()
    }

    /// Common preamble for the admission and drain cycles. Returns the flow
    /// to report when the cycle must not touch the session.
    pub(crate) fn gate(&self, state: &mut HarvestState, loop_name: &'static str) -> Option<LoopFlow> {
        if state.registry.is_all_completed() {
            return Some(LoopFlow::Finished(RunOutcome::Completed));
        }
        let status = self.connection_status();
        match status.state {
            ConnectionState::Connected => {
                state.sync_epoch(status.epoch);
                None
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                tracing::debug!(
                    target: "harvest::runtime",
                    loop_name,
                    state = ?status.state,
                    "session unavailable, skipping cycle"
                );
                Some(LoopFlow::Continue)
            }
        }
    }
}

/// Drive `cycle` every `period` until the run is cancelled or a cycle ends
/// the run. Errors and panics inside a cycle end the run as failed.
pub(crate) fn spawn_periodic<F, Fut>(
    ctx: Arc<RunContext>,
    loop_name: &'static str,
    period: Duration,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut(Arc<RunContext>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<LoopFlow>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if ctx.cancel.is_cancelled() {
                break;
            }

            let result = AssertUnwindSafe(cycle(Arc::clone(&ctx))).catch_unwind().await;
            match result {
                Ok(Ok(LoopFlow::Continue)) => {}
                Ok(Ok(LoopFlow::Finished(outcome))) => {
                    tracing::debug!(
                        target: "harvest::runtime",
                        run_id = %ctx.run_id,
                        loop_name,
                        outcome = ?outcome,
                        "loop finished the run"
                    );
                    ctx.finish(outcome);
                    break;
                }
                Ok(Err(err)) => {
                    tracing::error!(
                        target: "harvest::runtime",
                        run_id = %ctx.run_id,
                        loop_name,
                        error = %err,
                        "cycle failed, stopping run"
                    );
                    ctx.finish(RunOutcome::Failed(format!("{loop_name}: {err}")));
                    break;
                }
                Err(_) => {
                    tracing::error!(
                        target: "harvest::runtime",
                        run_id = %ctx.run_id,
                        loop_name,
                        "cycle panicked, stopping run"
                    );
                    ctx.finish(RunOutcome::Failed(format!("{loop_name}: cycle panicked")));
                    break;
                }
            }
        }
        tracing::debug!(target: "harvest::runtime", run_id = %ctx.run_id, loop_name, "loop stopped");
    })
}
