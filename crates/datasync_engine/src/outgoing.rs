//! Submits outbox entries to the backend.
//!
//! Entries are taken from the outbox worker and submitted concurrently, one
//! per model instance at a time. Each submission ends in exactly one
//! acknowledgment: success, retry after backoff, or discard.

use std::sync::Arc;
use std::time::Duration;

use datasync_graphql::{
    decode_mutation_sync, AppSyncErrorType, GraphQLError, GraphQLRequest, GraphQLResponseError,
};
use datasync_model::{MutationEvent, MutationSync, MutationType};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConflictData, ConflictResolution};
use crate::engine::{cancelled, EngineContext};
use crate::error::{SyncError, SyncResult};
use crate::hub::HubEvent;
use crate::outbox::{AckOutcome, OutboxHandle, PendingMutation};

const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Terminal state of one submission.
#[derive(Debug)]
enum Submitted {
    /// Accepted; `resent` is true when a conflict policy replaced the model.
    Synced { sync: MutationSync, resent: bool },
    /// Nothing more to send. A server copy to apply may come with it.
    Dropped { remote: Option<MutationSync> },
}

/// Runs until cancelled. Terminal errors are reported on `fatal`.
#[instrument(name = "outgoing_mutations", skip_all)]
pub(crate) async fn run(
    context: Arc<EngineContext>,
    worker: OutboxHandle,
    mut cancel: watch::Receiver<bool>,
    fatal: mpsc::UnboundedSender<SyncError>,
) {
    let mut tasks = JoinSet::new();
    loop {
        loop {
            match worker.next_ready().await {
                Ok(Some(record)) => {
                    tasks.spawn(process(context.clone(), worker.clone(), record, fatal.clone()));
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = fatal.send(e);
                    return;
                }
            }
        }

        let wait = worker.outbox().next_retry_delay().unwrap_or(IDLE_WAIT);
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            _ = worker.outbox().changed() => {}
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tasks.abort_all();
    debug!("outgoing processor stopped");
}

async fn process(
    context: Arc<EngineContext>,
    worker: OutboxHandle,
    record: PendingMutation,
    fatal: mpsc::UnboundedSender<SyncError>,
) {
    let sequence = record.sequence;
    let event = record.event.clone();
    let result = match submit(&context, event.clone()).await {
        Ok(Submitted::Synced { sync, resent }) => {
            acknowledge_success(&context, &worker, sequence, sync, resent).await
        }
        Ok(Submitted::Dropped { remote }) => {
            acknowledge_dropped(&context, &worker, sequence, &event, remote).await
        }
        Err(e) if e.is_retryable() => {
            debug!(sequence, error = %e, "mutation submission failed, will retry");
            worker.acknowledge(sequence, AckOutcome::Retry).await.map(|_| ())
        }
        Err(e) if e.is_fatal() => {
            error!(sequence, error = %e, "mutation submission failed terminally");
            let ack = worker.acknowledge(sequence, AckOutcome::Retry).await.map(|_| ());
            let _ = fatal.send(e);
            ack
        }
        Err(e) => {
            warn!(sequence, error = %e, "mutation rejected, dropping it");
            context.hub.dispatch(HubEvent::OutboxMutationFailed {
                event: event.clone(),
                reason: e.to_string(),
            });
            acknowledge_dropped(&context, &worker, sequence, &event, None).await
        }
    };
    if let Err(e) = result {
        if !matches!(e, SyncError::Cancelled) {
            let _ = fatal.send(e);
        }
    }
}

async fn acknowledge_success(
    context: &EngineContext,
    worker: &OutboxHandle,
    sequence: u64,
    sync: MutationSync,
    resent: bool,
) -> SyncResult<()> {
    let metadata = sync.sync_metadata.clone();
    let remaining = worker
        .acknowledge(sequence, AckOutcome::Success(Some(metadata.clone())))
        .await?;
    context.reconciler.adopt(&sync, resent)?;
    info!(
        model = %metadata.model_name,
        model_id = %metadata.model_id,
        version = metadata.version,
        remaining,
        "mutation synced"
    );
    context.hub.dispatch(HubEvent::OutboxMutationProcessed {
        model: sync.model,
        metadata: metadata.clone(),
    });
    context.hub.dispatch(HubEvent::OutboxStatus {
        is_empty: remaining == 0,
    });
    context.reconciler.release(&metadata.model_name, &metadata.model_id)?;
    Ok(())
}

async fn acknowledge_dropped(
    context: &EngineContext,
    worker: &OutboxHandle,
    sequence: u64,
    event: &MutationEvent,
    remote: Option<MutationSync>,
) -> SyncResult<()> {
    let remaining = worker.acknowledge(sequence, AckOutcome::Discard).await?;
    if let Some(remote) = remote {
        context.reconciler.reconcile(remote)?;
    }
    context.hub.dispatch(HubEvent::OutboxStatus {
        is_empty: remaining == 0,
    });
    context.reconciler.release(&event.model_name, &event.model_id)?;
    Ok(())
}

/// Sends `event`, following the conflict policy while the backend reports
/// version conflicts.
async fn submit(context: &EngineContext, mut event: MutationEvent) -> SyncResult<Submitted> {
    let schema = context.registry.schema(&event.model_name)?.clone();
    let mut conflicts = 0u32;
    let mut resent = false;
    loop {
        let request = GraphQLRequest::from_mutation_event(&context.registry, &event)?;
        let headers = context.headers().await?;
        debug!(
            model = %event.model_name,
            model_id = %event.model_id,
            mutation = %event.mutation_type,
            version = ?event.version,
            "submitting mutation"
        );
        let response = context.transport.execute(&request, &headers).await?;
        let errors = match response.into_result(&request.decode_path) {
            Ok(value) => {
                let sync = decode_mutation_sync(&context.registry, &schema, &value)?;
                return Ok(Submitted::Synced { sync, resent });
            }
            Err(GraphQLError::Response(errors)) => errors,
            Err(e) => return Err(e.into()),
        };

        let Some(error) = errors.into_iter().next() else {
            return Err(SyncError::Decoding("empty error list".into()));
        };
        match error.error_type() {
            AppSyncErrorType::ConditionalCheck => {
                warn!(model_id = %event.model_id, "conditional save failed on the backend");
                context.hub.dispatch(HubEvent::ConditionalSaveFailed(event));
                return Ok(Submitted::Dropped { remote: None });
            }
            AppSyncErrorType::ConflictUnhandled => {
                conflicts += 1;
                if conflicts > context.config.retry.max_attempts {
                    return Err(conflict_error(&event, &error));
                }
                match resolve_conflict(context, &event, &error).await? {
                    Resolved::Apply(remote) => return Ok(Submitted::Dropped { remote }),
                    Resolved::Resend(next) => {
                        resent = true;
                        event = next;
                    }
                }
            }
            other => {
                warn!(
                    model_id = %event.model_id,
                    error_type = %other.as_str(),
                    message = %error.message,
                    "backend rejected mutation"
                );
                context.hub.dispatch(HubEvent::OutboxMutationFailed {
                    event,
                    reason: error.message,
                });
                return Ok(Submitted::Dropped { remote: None });
            }
        }
    }
}

enum Resolved {
    Apply(Option<MutationSync>),
    Resend(MutationEvent),
}

async fn resolve_conflict(
    context: &EngineContext,
    event: &MutationEvent,
    error: &GraphQLResponseError,
) -> SyncResult<Resolved> {
    let schema = context.registry.schema(&event.model_name)?;
    let remote_json = error
        .remote_data()
        .ok_or_else(|| SyncError::Decoding("conflict without the server's copy".into()))?;
    let remote = decode_mutation_sync(&context.registry, schema, remote_json)?;
    let remote_version = remote.sync_metadata.version;
    let remote_deleted = remote.sync_metadata.deleted;
    debug!(
        model_id = %event.model_id,
        mutation = %event.mutation_type,
        remote_version,
        remote_deleted,
        "resolving conflict"
    );

    match event.mutation_type {
        MutationType::Create => Err(conflict_error(event, error)),
        MutationType::Delete if remote_deleted => Ok(Resolved::Apply(None)),
        MutationType::Delete => Ok(Resolved::Apply(Some(remote))),
        MutationType::Update if remote_deleted => Ok(Resolved::Apply(Some(remote))),
        MutationType::Update => {
            let local = event.decode_model(&context.registry)?;
            let data = ConflictData {
                local,
                remote: remote.model.clone(),
            };
            match context.config.conflict_handler.resolve(data).await {
                ConflictResolution::ApplyRemote => Ok(Resolved::Apply(Some(remote))),
                ConflictResolution::RetryLocal => Ok(Resolved::Resend(
                    event.clone().with_version(Some(remote_version)),
                )),
                ConflictResolution::Retry(model) => Ok(Resolved::Resend(
                    MutationEvent::new(&model, MutationType::Update)
                        .with_version(Some(remote_version))
                        .with_graphql_filter(event.graphql_filter.clone()),
                )),
            }
        }
    }
}

fn conflict_error(event: &MutationEvent, error: &GraphQLResponseError) -> SyncError {
    SyncError::Conflict {
        model: event.model_name.clone(),
        model_id: event.model_id.clone(),
        remote_version: error
            .remote_data()
            .and_then(|d| d.get("_version"))
            .and_then(serde_json::Value::as_i64),
    }
}
