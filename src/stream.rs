use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::batch::{
    BatchError, GenerationInput, RequestFailure, RollingBatch, StepOutput, TokenSource,
};

/// Drive `batch` until every request has finished, sending outputs to `tx`.
///
/// A non-terminal output is only sent when the channel has a free slot;
/// otherwise it stays in the request's buffer and the next step is appended
/// to it. Terminal outputs wait for a slot. If the receiver goes away the
/// batch is reset and the driver returns.
///
/// Returns the requests whose own formatter failed along the way; the rest
/// of the batch keeps streaming past them.
pub async fn stream_batch<S: TokenSource>(
    batch: &mut RollingBatch<S>,
    inputs: Vec<GenerationInput>,
    tx: mpsc::Sender<StepOutput>,
    step_interval: Duration,
) -> Result<Vec<RequestFailure>, BatchError> {
    for input in inputs {
        batch.admit(input)?;
    }
    info!(requests = batch.len(), "streaming batch");
    let mut failures = Vec::new();

    while !batch.is_empty() {
        failures.extend(batch.step());
        for id in batch.request_ids() {
            let Some(req) = batch.get(id) else { continue };
            if !req.has_pending_output() {
                continue;
            }
            let permit = if req.is_last_token() {
                match tx.reserve().await {
                    Ok(permit) => permit,
                    Err(_) => return Ok(receiver_gone(batch, failures)),
                }
            } else {
                match tx.try_reserve() {
                    Ok(permit) => permit,
                    Err(TrySendError::Full(())) => {
                        debug!(request_id = id, "channel full; coalescing");
                        continue;
                    }
                    Err(TrySendError::Closed(())) => return Ok(receiver_gone(batch, failures)),
                }
            };
            if let Some(output) = batch.take_output(id)? {
                permit.send(output);
            }
        }
        if step_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(step_interval).await;
        }
    }
    info!(failed = failures.len(), "batch finished");
    Ok(failures)
}

fn receiver_gone<S: TokenSource>(
    batch: &mut RollingBatch<S>,
    failures: Vec<RequestFailure>,
) -> Vec<RequestFailure> {
    warn!(dropped = batch.len(), "output receiver closed; abandoning batch");
    batch.reset();
    failures
}
