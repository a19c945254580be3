//! Paged catch-up of every registered model.
//!
//! Models are synced parents first. Each page is reconciled before the next
//! one is requested, and the cursor is saved after every page so an
//! interrupted sync resumes where it stopped.

use std::sync::Arc;

use datasync_graphql::{decode_paginated_list, GraphQLRequest};
use datasync_model::{now_millis, ModelSchema, ModelSyncMetadata, MutationType};
use tracing::{debug, info, instrument};

use crate::engine::EngineContext;
use crate::error::SyncResult;
use crate::hub::HubEvent;
use crate::reconciler::Disposition;

/// Local effect of one model's initial sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ModelSyncCounts {
    /// Rows created.
    pub created: usize,
    /// Rows updated.
    pub updated: usize,
    /// Rows deleted.
    pub deleted: usize,
}

impl ModelSyncCounts {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Applied(MutationType::Create) => self.created += 1,
            Disposition::Applied(MutationType::Update) => self.updated += 1,
            Disposition::Applied(MutationType::Delete) => self.deleted += 1,
            Disposition::Dropped | Disposition::Deferred | Disposition::NotApplicable => {}
        }
    }
}

/// Syncs every model in dependency order.
#[instrument(name = "initial_sync", skip_all)]
pub(crate) async fn run(context: &EngineContext) -> SyncResult<()> {
    let models = context.registry.sync_order();
    context.hub.dispatch(HubEvent::SyncQueriesStarted {
        models: models.iter().map(|s| s.name().to_string()).collect(),
    });
    for schema in &models {
        let (counts, is_full_sync) = sync_model(context, schema).await?;
        context.hub.dispatch(HubEvent::ModelSynced {
            model: schema.name().to_string(),
            is_full_sync,
            created: counts.created,
            updated: counts.updated,
            deleted: counts.deleted,
        });
    }
    context.hub.dispatch(HubEvent::SyncQueriesReady);
    Ok(())
}

async fn sync_model(context: &EngineContext, schema: &Arc<ModelSchema>) -> SyncResult<(ModelSyncCounts, bool)> {
    let name = schema.name();
    let config = &context.config;
    let now = now_millis();
    let interval = i64::try_from(config.full_sync_interval.as_millis()).unwrap_or(i64::MAX);

    let mut cursor = context
        .store
        .sync_state(name)
        .unwrap_or_else(|| ModelSyncMetadata::new(name));
    if cursor.last_sync.is_some_and(|last| now.saturating_sub(last) > interval) {
        debug!(model = %name, "sync cursor expired, running a full sync");
        cursor.last_sync = None;
        cursor.next_token = None;
    }
    let last_sync = cursor.last_sync;
    let is_full_sync = last_sync.is_none();
    let expression = config.sync_expression(name);

    let mut counts = ModelSyncCounts::default();
    let mut next_token = cursor.next_token.clone();
    let mut started_at = None;
    let mut pages = 0usize;
    loop {
        let request = GraphQLRequest::sync_query(
            &context.registry,
            schema,
            expression,
            config.sync_page_size,
            next_token.clone(),
            last_sync,
        )?;
        let response = context.execute_with_retry(&request).await?;
        let value = response.into_result(&request.decode_path)?;
        let page = decode_paginated_list(&context.registry, schema, &value)?;
        pages += 1;
        started_at = started_at.or(page.started_at);

        let rows = page.items.len();
        for item in page.items {
            counts.record(context.reconciler.reconcile(item)?);
        }
        debug!(model = %name, page = pages, rows, "sync page reconciled");

        // Filtered pages may be short or empty and still carry a token.
        next_token = page.next_token;
        if next_token.is_none() {
            break;
        }
        context.store.save_sync_state(ModelSyncMetadata {
            model_name: name.to_string(),
            last_sync,
            next_token: next_token.clone(),
        })?;
    }

    context.store.save_sync_state(ModelSyncMetadata {
        model_name: name.to_string(),
        last_sync: Some(started_at.unwrap_or(now)),
        next_token: None,
    })?;
    info!(
        model = %name,
        full = is_full_sync,
        pages,
        created = counts.created,
        updated = counts.updated,
        deleted = counts.deleted,
        "model synced"
    );
    Ok((counts, is_full_sync))
}
