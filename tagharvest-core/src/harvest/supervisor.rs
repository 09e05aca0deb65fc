//! Connection health checks and session re-establishment.
//!
//! The supervisor runs on its own timer and never takes the scheduler lock.
//! It tears down a dead session, publishes the new [`ConnectionStatus`], and
//! retries `connect` on every tick until it succeeds or the run is stopped.
//! The admission and drain loops pick the change up at the start of their
//! next cycle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::config::ReconnectPolicy;
use super::processor::RunOutcome;
use super::runtime::{LoopFlow, RunContext};
use crate::error::Result;
use crate::session::bounded;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Connection state plus the session generation it refers to. `epoch`
/// increases by one on every successful (re)connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub epoch: u64,
}

impl ConnectionStatus {
    pub fn connected(epoch: u64) -> Self {
        Self {
            state: ConnectionState::Connected,
            epoch,
        }
    }

    fn with_state(self, state: ConnectionState) -> Self {
        Self { state, ..self }
    }
}

pub(crate) async fn run_cycle(ctx: Arc<RunContext>) -> Result<LoopFlow> {
    let current = ctx.connection_status();
    if ctx.session.is_connected() {
        return Ok(LoopFlow::Continue);
    }

    if current.state == ConnectionState::Connected {
        tracing::warn!(
            target: "harvest::supervisor",
            run_id = %ctx.run_id,
            epoch = current.epoch,
            "health check failed, tearing down session"
        );
        teardown(&ctx).await;
        ctx.connection
            .send_replace(current.with_state(ConnectionState::Disconnected));
    }

    if ctx.config.schedule.reconnect_policy == ReconnectPolicy::EndRun {
        tracing::info!(
            target: "harvest::supervisor",
            run_id = %ctx.run_id,
            "connection lost, ending run so a fresh one can start"
        );
        return Ok(LoopFlow::Finished(RunOutcome::Reconnecting));
    }

    ctx.connection
        .send_replace(current.with_state(ConnectionState::Reconnecting));

    let connect = bounded(
        ctx.operation_timeout(),
        "connect",
        ctx.session.connect(Arc::clone(&ctx.notifications)),
    )
    .await;
    match connect {
        Ok(()) => {
            let next = ConnectionStatus::connected(current.epoch + 1);
            ctx.connection.send_replace(next);
            tracing::info!(
                target: "harvest::supervisor",
                run_id = %ctx.run_id,
                epoch = next.epoch,
                "session re-established"
            );
        }
        Err(err) => {
            tracing::warn!(
                target: "harvest::supervisor",
                run_id = %ctx.run_id,
                error = %err,
                "reconnect attempt failed, retrying on next health check"
            );
            teardown(&ctx).await;
            ctx.connection
                .send_replace(current.with_state(ConnectionState::Disconnected));
        }
    }
    Ok(LoopFlow::Continue)
}

/// Drop the dead session and anything it buffered.
async fn teardown(ctx: &RunContext) {
    if let Err(err) = bounded(ctx.operation_timeout(), "teardown", ctx.session.teardown()).await {
        tracing::warn!(target: "harvest::supervisor", error = %err, "session teardown failed");
    }
    let discarded = ctx.notifications.clear();
    if discarded > 0 {
        tracing::debug!(
            target: "harvest::supervisor",
            discarded,
            "dropped notifications from the torn-down session"
        );
    }
}
