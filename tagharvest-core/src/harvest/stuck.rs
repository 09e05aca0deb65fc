//! Existence checks for tags that stay Pending without making progress:
//! admitted tags that never publish a good value, and tags the server keeps
//! refusing to monitor.

use super::runtime::{HarvestState, RunContext};
use crate::error::Result;
use crate::session::bounded;
use crate::types::{StatusCode, TagId};

/// Ask the server whether `tag` exists and apply the stuck-tag policy.
///
/// Returns the reason to record when the tag should be declared unreachable.
/// `refused` carries the status of the latest refusal to monitor the tag,
/// `None` when the tag is subscribed but silent.
pub(crate) async fn assess(
    ctx: &RunContext,
    state: &mut HarvestState,
    tag: &TagId,
    refused: Option<StatusCode>,
) -> Result<Option<String>> {
    let verdict = bounded(
        ctx.operation_timeout(),
        "verify_exists",
        ctx.session.verify_exists(tag),
    )
    .await;

    match verdict {
        Ok(false) => Ok(Some(StatusCode::BAD_NODE_ID_UNKNOWN.to_string())),
        Ok(true) => {
            let confirmations = state.registry.record_verification(tag);
            match ctx.config.stuck.abandon_after_verifications {
                Some(limit) if confirmations >= limit => Ok(Some(match refused {
                    Some(status) => format!("{status} after {confirmations} verifications"),
                    None => format!("no good value after {confirmations} verifications"),
                })),
                _ => {
                    tracing::debug!(
                        target: "harvest::runtime",
                        tag = %tag,
                        confirmations,
                        refused = ?refused,
                        "tag exists but has not produced a good value"
                    );
                    Ok(None)
                }
            }
        }
        Err(err) if err.is_transient() => {
            tracing::warn!(
                target: "harvest::runtime",
                tag = %tag,
                error = %err,
                "existence check failed, will retry"
            );
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
