//! The remote sync engine.
//!
//! A driver task walks the lifecycle: reset the outbox, run the initial
//! sync, open subscriptions, then reconcile subscription events while the
//! outgoing processor drains the outbox. Transient failures restart the
//! cycle after a backoff; terminal failures tear the engine down and
//! complete the change publisher with the error.
//!
//! Shutdown boundary: `stop` raises the cancel signal before `stopping` is
//! published. A subscription event already handed to the reconciler is
//! applied; events received after that are not reconciled.

use std::sync::Arc;

use datasync_graphql::{decode_mutation_sync, GraphQLError, GraphQLRequest, GraphQLResponse};
use datasync_model::{ModelRegistry, MutationEvent};
use datasync_storage::LocalStore;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::hub::{HubEvent, HubSink};
use crate::initial_sync;
use crate::lifecycle::{reduce, EngineAction, EngineState};
use crate::outbox::MutationOutbox;
use crate::outgoing;
use crate::publisher::{Completion, EventPublisher, Subscription};
use crate::reconciler::{Disposition, Reconciler};
use crate::state_machine::StateMachine;
use crate::subscriptions::{Incoming, SubscriptionSet};
use crate::transport::{AuthProvider, GraphQLTransport, Headers};

/// Everything the engine's tasks share.
pub(crate) struct EngineContext {
    pub(crate) registry: ModelRegistry,
    pub(crate) store: Arc<LocalStore>,
    pub(crate) transport: Arc<dyn GraphQLTransport>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) config: SyncConfig,
    pub(crate) outbox: MutationOutbox,
    pub(crate) reconciler: Reconciler,
    pub(crate) hub: Arc<dyn HubSink>,
}

impl EngineContext {
    pub(crate) async fn headers(&self) -> SyncResult<Headers> {
        self.auth.headers().await
    }

    /// Executes `request`, retrying transient failures with backoff.
    pub(crate) async fn execute_with_retry(&self, request: &GraphQLRequest) -> SyncResult<GraphQLResponse> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            let headers = self.headers().await?;
            match self.transport.execute(request, &headers).await {
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.backoff(attempt);
                    warn!(
                        request = %request.decode_path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

/// Resolves once the cancel signal is raised or its sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

struct Running {
    cancel: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

/// Drives initial sync, subscriptions and outbox processing.
///
/// Must be created inside a Tokio runtime.
pub struct RemoteSyncEngine {
    context: Arc<EngineContext>,
    machine: Arc<StateMachine<EngineState, EngineAction>>,
    changes: EventPublisher<MutationEvent>,
    running: Mutex<Option<Running>>,
}

impl RemoteSyncEngine {
    /// Creates a stopped engine.
    ///
    /// Applied remote changes are published to `changes`; the same outbox
    /// instance must be used for local writes.
    pub fn new(
        store: Arc<LocalStore>,
        outbox: MutationOutbox,
        transport: Arc<dyn GraphQLTransport>,
        auth: Arc<dyn AuthProvider>,
        config: SyncConfig,
        changes: EventPublisher<MutationEvent>,
        hub: Arc<dyn HubSink>,
    ) -> Self {
        let registry = store.registry().clone();
        let reconciler = Reconciler::new(
            store.clone(),
            changes.clone(),
            hub.clone(),
            config.sync_expressions.clone(),
        );
        let context = Arc::new(EngineContext {
            registry,
            store,
            transport,
            auth,
            config,
            outbox,
            reconciler,
            hub,
        });
        Self {
            context,
            machine: Arc::new(StateMachine::new(EngineState::Stopped, reduce)),
            changes,
            running: Mutex::new(None),
        }
    }

    /// The latest lifecycle state.
    pub fn state(&self) -> EngineState {
        self.machine.current()
    }

    /// Subscribes to lifecycle states, starting with the current one.
    pub fn states(&self) -> Subscription<EngineState> {
        self.machine.subscribe()
    }

    /// Waits until a state matching `predicate` is reached.
    pub async fn wait_for_state(&self, predicate: impl Fn(&EngineState) -> bool) -> EngineState {
        self.machine.wait_for(predicate).await
    }

    /// Starts syncing.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidStateTransition`] if the engine is already
    /// running.
    pub fn start(&self) -> SyncResult<()> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if !current.driver.is_finished() {
                return Err(SyncError::InvalidStateTransition {
                    from: self.machine.current().to_string(),
                    action: "start".to_string(),
                });
            }
        }

        info!("sync engine starting");
        self.changes.reopen();
        let (cancel, cancel_rx) = watch::channel(false);
        self.machine.notify(EngineAction::Start);
        let driver = tokio::spawn(drive(
            self.context.clone(),
            self.machine.clone(),
            self.changes.clone(),
            cancel_rx,
        ));
        *running = Some(Running { cancel, driver });
        Ok(())
    }

    /// Number of remote changes held behind pending local writes.
    pub fn deferred_count(&self) -> usize {
        self.context.reconciler.deferred_count()
    }

    /// Drops every remote change held behind a pending local write.
    pub fn forget_deferred(&self) {
        self.context.reconciler.clear();
    }

    /// Stops syncing and waits for the engine to come to rest.
    ///
    /// Outstanding network operations are cancelled and subscriptions are
    /// closed. Local writes already accepted stay queued in the outbox.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        info!("sync engine stopping");
        let _ = running.cancel.send(true);
        self.machine.notify(EngineAction::Stop);
        if let Err(e) = running.driver.await {
            if e.is_panic() {
                error!("sync driver panicked");
            }
        }
        self.machine.notify(EngineAction::Stopped);
        let state = self.machine.wait_for(EngineState::is_terminal).await;
        info!(state = %state, "sync engine stopped");
    }
}

#[instrument(name = "sync_driver", skip_all)]
async fn drive(
    context: Arc<EngineContext>,
    machine: Arc<StateMachine<EngineState, EngineAction>>,
    changes: EventPublisher<MutationEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;
    loop {
        let result = run_cycle(&context, &machine, &mut cancel).await;
        if *cancel.borrow() {
            debug!("sync driver cancelled");
            return;
        }
        match result {
            Ok(()) | Err(SyncError::Cancelled) => return,
            Err(e) if e.is_retryable() => {
                attempt += 1;
                let delay = context.config.retry.backoff(attempt);
                warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "sync interrupted, restarting");
                context.hub.dispatch(HubEvent::NetworkStatus { active: false });
                machine.notify(EngineAction::Retry);
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(error = %e, "sync engine torn down");
                context.hub.dispatch(HubEvent::NetworkStatus { active: false });
                machine.notify(EngineAction::Fail(e.to_string()));
                changes.complete(Completion::Failed(e.to_string()));
                return;
            }
        }
    }
}

async fn run_cycle(
    context: &Arc<EngineContext>,
    machine: &StateMachine<EngineState, EngineAction>,
    cancel: &mut watch::Receiver<bool>,
) -> SyncResult<()> {
    context.outbox.reset_in_flight()?;
    machine.notify(EngineAction::Configured);

    tokio::select! {
        biased;
        _ = cancelled(cancel) => return Err(SyncError::Cancelled),
        result = initial_sync::run(context) => { result?; }
    }
    machine.notify(EngineAction::InitialSyncCompleted);

    let mut subscriptions = tokio::select! {
        biased;
        _ = cancelled(cancel) => return Err(SyncError::Cancelled),
        result = SubscriptionSet::establish(context) => result?,
    };
    context.hub.dispatch(HubEvent::SubscriptionsEstablished);
    context.hub.dispatch(HubEvent::NetworkStatus { active: true });
    context.hub.dispatch(HubEvent::Ready);
    machine.notify(EngineAction::SubscriptionsEstablished);
    info!("sync engine ready");

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let worker = context.outbox.spawn_worker();
    let processor = tokio::spawn(outgoing::run(context.clone(), worker, cancel.clone(), fatal_tx));

    let result = loop {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => break Ok(()),
            Some(e) = fatal_rx.recv() => break Err(e),
            incoming = subscriptions.next() => match incoming {
                Some(Incoming::Data { model_name, decode_path, response }) => {
                    if let Err(e) = reconcile_subscription(context, &model_name, &decode_path, response) {
                        break Err(e);
                    }
                }
                Some(Incoming::Disconnected { error }) => {
                    break Err(SyncError::network_retryable(
                        error.unwrap_or_else(|| "subscription disconnected".to_string()),
                    ));
                }
                None => break Err(SyncError::network_retryable("subscriptions closed")),
            },
        }
    };

    processor.abort();
    let _ = processor.await;
    drop(subscriptions);
    result
}

fn reconcile_subscription(
    context: &EngineContext,
    model_name: &str,
    decode_path: &str,
    response: GraphQLResponse,
) -> SyncResult<Option<Disposition>> {
    let value = match response.into_result(decode_path) {
        Ok(value) => value,
        Err(GraphQLError::Response(errors)) => {
            warn!(
                model = %model_name,
                errors = errors.len(),
                first = %errors.first().map(|e| e.message.as_str()).unwrap_or_default(),
                "subscription delivered errors"
            );
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let schema = context.registry.schema(model_name)?;
    let remote = decode_mutation_sync(&context.registry, schema, &value)?;
    context.reconciler.reconcile(remote).map(Some)
}
