//! Transport and authorization capabilities consumed by the engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use datasync_graphql::{GraphQLRequest, GraphQLResponse};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};

/// Connection state reported by a subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// The subscription is being set up.
    Connecting,
    /// The subscription is receiving events.
    Connected,
    /// The subscription was lost.
    Disconnected {
        /// Why the connection dropped, if known.
        error: Option<String>,
    },
}

/// One item of a subscription stream.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// Connection state changed.
    Connection(ConnectionState),
    /// A payload arrived.
    Data(GraphQLResponse),
}

/// Request headers, as name/value pairs.
pub type Headers = Vec<(String, String)>;

/// Executes GraphQL operations against the backend.
///
/// Implementations map transient failures to
/// [`SyncError::network_retryable`] and permanent ones to
/// [`SyncError::network_fatal`] or [`SyncError::Unauthorized`].
#[async_trait]
pub trait GraphQLTransport: Send + Sync {
    /// Executes a query or mutation.
    async fn execute(&self, request: &GraphQLRequest, headers: &Headers) -> SyncResult<GraphQLResponse>;

    /// Opens a subscription.
    ///
    /// The stream ends when the subscription is closed. Dropping the
    /// receiver unsubscribes.
    async fn subscribe(
        &self,
        request: &GraphQLRequest,
        headers: &Headers,
    ) -> SyncResult<mpsc::UnboundedReceiver<SubscriptionEvent>>;
}

/// Supplies request authorization.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Headers to attach to a request.
    async fn headers(&self) -> SyncResult<Headers>;
}

/// Sends no authorization.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn headers(&self) -> SyncResult<Headers> {
        Ok(Vec::new())
    }
}

/// Static API key authorization.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    key: String,
}

impl ApiKeyAuth {
    /// Creates a provider sending `key` as `x-api-key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl AuthProvider for ApiKeyAuth {
    async fn headers(&self) -> SyncResult<Headers> {
        Ok(vec![("x-api-key".to_string(), self.key.clone())])
    }
}

/// A scripted transport for testing.
///
/// `execute` pops scripted responses in order and records every request.
/// Subscriptions connect immediately and receive whatever is pushed with
/// [`MockTransport::emit`].
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    responses: Mutex<VecDeque<SyncResult<GraphQLResponse>>>,
    requests: Mutex<Vec<GraphQLRequest>>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<SubscriptionEvent>)>>,
}

impl MockTransport {
    /// Creates a connected mock with no scripted responses.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Queues the next `execute` result.
    pub fn push_response(&self, response: SyncResult<GraphQLResponse>) {
        self.responses.lock().push_back(response);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Requests executed so far.
    pub fn requests(&self) -> Vec<GraphQLRequest> {
        self.requests.lock().clone()
    }

    /// Sends `event` to every subscription whose document name starts with
    /// `decode_path`.
    pub fn emit(&self, decode_path: &str, event: SubscriptionEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers
            .iter()
            .filter(|(path, _)| path == decode_path)
            .filter(|(_, tx)| tx.send(event.clone()).is_ok())
            .count()
    }

    /// Number of open subscriptions.
    pub fn subscription_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers.len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphQLTransport for MockTransport {
    async fn execute(&self, request: &GraphQLRequest, _headers: &Headers) -> SyncResult<GraphQLResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::network_retryable("not connected"));
        }
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::network_retryable("no scripted response")))
    }

    async fn subscribe(
        &self,
        request: &GraphQLRequest,
        _headers: &Headers,
    ) -> SyncResult<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::network_retryable("not connected"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SubscriptionEvent::Connection(ConnectionState::Connecting));
        let _ = tx.send(SubscriptionEvent::Connection(ConnectionState::Connected));
        self.subscribers.lock().push((request.decode_path.clone(), tx));
        Ok(rx)
    }
}
