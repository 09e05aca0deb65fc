//! Drain loop: turns buffered notifications into result rows, retires
//! finished tags, and re-grants admission budget.

use std::collections::HashSet;
use std::sync::Arc;

use super::processor::RunOutcome;
use super::progress::format_elapsed;
use super::registry::Completion;
use super::runtime::{HarvestState, LoopFlow, RunContext};
use super::stuck;
use crate::error::Result;
use crate::output::{ResultRecord, UnresolvedRecord};
use crate::session::bounded;
use crate::types::{MonitoredHandle, TagId};

pub(crate) async fn run_cycle(ctx: Arc<RunContext>) -> Result<LoopFlow> {
    let mut state = ctx.state.lock().await;
    if let Some(flow) = ctx.gate(&mut state, "drain") {
        return Ok(flow);
    }
    let epoch = state.observed_epoch;

    let mut records = Vec::new();
    for notification in ctx.notifications.drain() {
        if !state.registry.is_pending(&notification.tag) {
            tracing::trace!(
                target: "harvest::drain",
                tag = %notification.tag,
                "notification for completed tag ignored"
            );
            continue;
        }
        if notification.status.is_good() {
            records.push(ResultRecord::from_notification(&notification));
        } else {
            tracing::debug!(
                target: "harvest::drain",
                tag = %notification.tag,
                status = %notification.status,
                "bad status, tag stays pending"
            );
        }
    }

    if !records.is_empty() {
        ctx.output.append_records(&records).await?;
    }

    let mut retiring = Vec::new();
    let recorded: HashSet<TagId> = records.iter().map(|record| record.tag.clone()).collect();
    for tag in &recorded {
        state.registry.mark_completed(tag, Completion::Recorded);
        if let Some(handle) = state.registry.detach_handle(tag) {
            retiring.push((tag.clone(), handle));
        }
    }

    let unresolved = check_stale_tags(&ctx, &mut state, &mut retiring).await?;
    if !unresolved.is_empty() {
        ctx.output.append_unresolved(&unresolved).await?;
    }

    let retired = retire(&ctx, &mut state, retiring, epoch).await?;

    let credits = std::mem::take(&mut state.slot_credits);
    let subscribed = state.subscribed;
    state.budget.grant(retired + credits, subscribed);
    if state.reconnected {
        if retired == 0 {
            state.budget.fill(subscribed);
        }
        state.reconnected = false;
    }

    log_progress(&ctx, &state, records.len() + unresolved.len(), retired);

    if state.registry.is_all_completed() {
        return Ok(LoopFlow::Finished(RunOutcome::Completed));
    }
    Ok(LoopFlow::Continue)
}

/// Advance the stale counter of every admitted tag that produced no good
/// value this cycle, and ask the server about the ones past the threshold.
/// Tags given up on are detached and pushed onto `retiring`.
async fn check_stale_tags(
    ctx: &RunContext,
    state: &mut HarvestState,
    retiring: &mut Vec<(TagId, MonitoredHandle)>,
) -> Result<Vec<UnresolvedRecord>> {
    let policy = ctx.config.stuck;
    let admitted: Vec<TagId> = state
        .registry
        .admitted_pending()
        .map(|entry| entry.tag.clone())
        .collect();

    let mut suspects = Vec::new();
    for tag in admitted {
        if state.registry.record_stale_cycle(&tag) >= policy.stale_cycles {
            suspects.push(tag);
        }
    }

    let mut unresolved = Vec::new();
    for tag in suspects {
        let reason = stuck::assess(ctx, state, &tag, None).await?;
        if let Some(reason) = reason
            && state.registry.mark_completed(&tag, Completion::Unreachable)
        {
            tracing::info!(target: "harvest::drain", tag = %tag, reason = %reason, "tag marked unreachable");
            if let Some(handle) = state.registry.detach_handle(&tag) {
                retiring.push((tag.clone(), handle));
            }
            unresolved.push(UnresolvedRecord::new(tag, reason));
        }
    }
    Ok(unresolved)
}

/// Unsubscribe `retiring` plus anything left over from earlier cycles.
/// Returns how many slots were actually freed.
async fn retire(
    ctx: &RunContext,
    state: &mut HarvestState,
    retiring: Vec<(TagId, MonitoredHandle)>,
    epoch: u64,
) -> Result<usize> {
    let mut outgoing = std::mem::take(&mut state.retire_backlog);
    outgoing.extend(retiring);
    if outgoing.is_empty() {
        return Ok(0);
    }

    // Handles from a replaced session died with it; the next cycle resets
    // the subscribed count when it observes the new epoch.
    if ctx.connection_status().epoch != epoch {
        return Ok(0);
    }

    let handles: Vec<_> = outgoing.iter().map(|(_, handle)| *handle).collect();
    match bounded(ctx.operation_timeout(), "unsubscribe", ctx.session.unsubscribe(&handles)).await {
        Ok(()) => {
            state.subscribed = state.subscribed.saturating_sub(outgoing.len());
            Ok(outgoing.len())
        }
        Err(err) if err.is_transient() => {
            tracing::warn!(
                target: "harvest::drain",
                error = %err,
                handles = outgoing.len(),
                "unsubscribe failed, retrying next cycle"
            );
            state.retire_backlog = outgoing;
            Ok(0)
        }
        Err(err) => {
            state.retire_backlog = outgoing;
            Err(err)
        }
    }
}

fn log_progress(ctx: &RunContext, state: &HarvestState, completed_now: usize, retired: usize) {
    let summary = state.registry.summary();
    let elapsed = format_elapsed(ctx.started.elapsed());
    let next_admission = state
        .last_admission
        .map(|at| {
            ctx.config
                .schedule
                .batch_interval()
                .saturating_sub(at.elapsed())
        })
        .unwrap_or_default();

    if completed_now > 0 || retired > 0 {
        tracing::info!(
            target: "harvest::summary",
            run_id = %ctx.run_id,
            added_last_admission = state.last_admitted,
            retired,
            processed = summary.completed(),
            total = summary.total,
            subscribed = state.subscribed,
            available = state.budget.available(),
            elapsed = %elapsed,
            next_admission_in = %format_elapsed(next_admission),
            "{}/{} tags processed",
            summary.completed(),
            summary.total
        );
    } else {
        tracing::debug!(
            target: "harvest::summary",
            run_id = %ctx.run_id,
            processed = summary.completed(),
            total = summary.total,
            subscribed = state.subscribed,
            elapsed = %elapsed,
            "no progress this cycle"
        );
    }
}
