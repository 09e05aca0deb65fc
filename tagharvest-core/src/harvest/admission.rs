//! Admission loop: moves Pending tags onto the subscription in bounded
//! batches.

use std::sync::Arc;
use std::time::Instant;

use super::processor::RunOutcome;
use super::registry::Completion;
use super::runtime::{LoopFlow, RunContext};
use super::stuck;
use crate::error::Result;
use crate::output::UnresolvedRecord;
use crate::session::bounded;
use crate::types::MonitoredHandle;

pub(crate) async fn run_cycle(ctx: Arc<RunContext>) -> Result<LoopFlow> {
    let mut state = ctx.state.lock().await;
    if let Some(flow) = ctx.gate(&mut state, "admission") {
        return Ok(flow);
    }
    if !ctx.session.is_connected() {
        tracing::debug!(target: "harvest::admission", "session reports disconnected, skipping admission");
        return Ok(LoopFlow::Continue);
    }

    let requested = state.budget.take();
    if requested == 0 {
        tracing::trace!(target: "harvest::admission", subscribed = state.subscribed, "no admission budget");
        return Ok(LoopFlow::Continue);
    }
    let batch = state.registry.pending_entries(requested);
    if batch.is_empty() {
        state.slot_credits += requested;
        return Ok(LoopFlow::Continue);
    }
    let epoch = state.observed_epoch;
    let timeout = ctx.operation_timeout();

    let created = match bounded(timeout, "create_monitored", ctx.session.create_monitored(&batch)).await {
        Ok(created) => created,
        Err(err) if err.is_transient() => {
            tracing::warn!(
                target: "harvest::admission",
                error = %err,
                batch = batch.len(),
                "creating monitored items failed, retrying next cycle"
            );
            state.slot_credits += requested;
            return Ok(LoopFlow::Continue);
        }
        Err(err) => return Err(err),
    };

    let mut unresolved = Vec::new();
    for rejected in &created.rejected {
        let reason = if rejected.reason.is_unresolvable() {
            Some(rejected.reason.to_string())
        } else {
            let refusals = state.registry.record_rejection(&rejected.tag);
            tracing::warn!(
                target: "harvest::admission",
                tag = %rejected.tag,
                reason = %rejected.reason,
                refusals,
                "monitored item rejected, tag stays pending"
            );
            if refusals >= ctx.config.stuck.stale_cycles {
                stuck::assess(&ctx, &mut state, &rejected.tag, Some(rejected.reason)).await?
            } else {
                None
            }
        };

        if let Some(reason) = reason
            && state.registry.mark_completed(&rejected.tag, Completion::Unreachable)
        {
            tracing::info!(
                target: "harvest::admission",
                tag = %rejected.tag,
                reason = %reason,
                "tag not located on server"
            );
            unresolved.push(UnresolvedRecord::new(rejected.tag.clone(), reason));
        }
    }

    let handles = created.handles();
    let mut attached = 0;
    if !handles.is_empty() {
        let subscribed = bounded(timeout, "subscribe", ctx.session.subscribe(&handles)).await;
        let epoch_moved = ctx.connection_status().epoch != epoch;
        match subscribed {
            Ok(()) if !epoch_moved => {
                for (tag, handle) in &created.accepted {
                    state.subscribed += 1;
                    if state.registry.attach_handle(tag, *handle) {
                        attached += 1;
                    } else {
                        state.retire_backlog.push((tag.clone(), *handle));
                    }
                }
            }
            Ok(()) => {
                tracing::info!(
                    target: "harvest::admission",
                    "session replaced during admission, discarding batch"
                );
                release_quietly(&ctx, &handles).await;
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    target: "harvest::admission",
                    error = %err,
                    batch = handles.len(),
                    "subscribe failed, tags stay pending"
                );
                release_quietly(&ctx, &handles).await;
            }
            Err(err) => {
                release_quietly(&ctx, &handles).await;
                return Err(err);
            }
        }
    }

    state.slot_credits += requested - attached;
    state.last_admitted = attached;
    state.last_admission = Some(Instant::now());

    if !unresolved.is_empty() {
        ctx.output.append_unresolved(&unresolved).await?;
    }

    let summary = state.registry.summary();
    tracing::info!(
        target: "harvest::admission",
        run_id = %ctx.run_id,
        admitted = attached,
        rejected = created.rejected.len(),
        subscribed = state.subscribed,
        pending = summary.pending,
        "admitted batch"
    );

    if state.registry.is_all_completed() {
        return Ok(LoopFlow::Finished(RunOutcome::Completed));
    }
    Ok(LoopFlow::Continue)
}

/// Best-effort removal of handles that never made it into the registry.
async fn release_quietly(ctx: &RunContext, handles: &[MonitoredHandle]) {
    if let Err(err) = bounded(ctx.operation_timeout(), "unsubscribe", ctx.session.unsubscribe(handles)).await {
        tracing::debug!(target: "harvest::admission", error = %err, "releasing unbound handles failed");
    }
}
