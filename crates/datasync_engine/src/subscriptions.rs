//! The engine's live subscriptions, merged into one stream.
//!
//! One subscription is opened per model per mutation kind. Dropping the set
//! drops every receiver, which closes the subscriptions.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::task::Poll;

use datasync_graphql::{GraphQLRequest, GraphQLResponse};
use datasync_model::MutationType;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::engine::EngineContext;
use crate::error::{SyncError, SyncResult};
use crate::transport::{ConnectionState, SubscriptionEvent};

/// An event for the engine's reconciliation loop.
#[derive(Debug)]
pub(crate) enum Incoming {
    Data {
        model_name: String,
        decode_path: String,
        response: GraphQLResponse,
    },
    Disconnected {
        error: Option<String>,
    },
}

struct Stream {
    model_name: String,
    decode_path: String,
    receiver: mpsc::UnboundedReceiver<SubscriptionEvent>,
    connected: bool,
    closed: bool,
}

pub(crate) struct SubscriptionSet {
    streams: Vec<Stream>,
    buffered: VecDeque<Incoming>,
    cursor: usize,
}

impl SubscriptionSet {
    /// Opens every subscription and waits until all report connected.
    ///
    /// Data arriving before that is buffered and delivered first by
    /// [`SubscriptionSet::next`].
    #[instrument(name = "establish_subscriptions", skip_all)]
    pub(crate) async fn establish(context: &EngineContext) -> SyncResult<Self> {
        let mut streams = Vec::new();
        for schema in context.registry.sync_order() {
            for kind in [MutationType::Create, MutationType::Update, MutationType::Delete] {
                let request = GraphQLRequest::subscription(&context.registry, &schema, kind)?;
                let headers = context.headers().await?;
                let receiver = context.transport.subscribe(&request, &headers).await?;
                debug!(subscription = %request.decode_path, "subscription opened");
                streams.push(Stream {
                    model_name: schema.name().to_string(),
                    decode_path: request.decode_path,
                    receiver,
                    connected: false,
                    closed: false,
                });
            }
        }

        let mut set = Self {
            streams,
            buffered: VecDeque::new(),
            cursor: 0,
        };
        let deadline = Instant::now() + context.config.subscription_connect_timeout;
        while set.streams.iter().any(|s| !s.connected) {
            let Ok(next) = tokio::time::timeout_at(deadline, set.recv_raw()).await else {
                return Err(SyncError::network_retryable(
                    "timed out waiting for subscriptions to connect",
                ));
            };
            match next {
                Some((index, SubscriptionEvent::Connection(ConnectionState::Connected))) => {
                    set.streams[index].connected = true;
                }
                Some((_, SubscriptionEvent::Connection(ConnectionState::Connecting))) => {}
                Some((_, SubscriptionEvent::Connection(ConnectionState::Disconnected { error }))) => {
                    return Err(SyncError::network_retryable(
                        error.unwrap_or_else(|| "subscription disconnected while connecting".into()),
                    ));
                }
                Some((index, SubscriptionEvent::Data(response))) => {
                    let incoming = set.data(index, response);
                    set.buffered.push_back(incoming);
                }
                None => return Err(SyncError::network_retryable("subscriptions closed while connecting")),
            }
        }
        info!(subscriptions = set.streams.len(), buffered = set.buffered.len(), "subscriptions established");
        Ok(set)
    }

    /// Next data event or disconnection. `None` once every stream is closed.
    pub(crate) async fn next(&mut self) -> Option<Incoming> {
        if let Some(buffered) = self.buffered.pop_front() {
            return Some(buffered);
        }
        loop {
            match self.recv_raw().await? {
                (index, SubscriptionEvent::Data(response)) => return Some(self.data(index, response)),
                (_, SubscriptionEvent::Connection(ConnectionState::Disconnected { error })) => {
                    return Some(Incoming::Disconnected { error })
                }
                (_, SubscriptionEvent::Connection(_)) => {}
            }
        }
    }

    fn data(&self, index: usize, response: GraphQLResponse) -> Incoming {
        let stream = &self.streams[index];
        Incoming::Data {
            model_name: stream.model_name.clone(),
            decode_path: stream.decode_path.clone(),
            response,
        }
    }

    /// Polls the streams round-robin. A stream that ends is reported as a
    /// disconnection.
    async fn recv_raw(&mut self) -> Option<(usize, SubscriptionEvent)> {
        poll_fn(|cx| {
            let count = self.streams.len();
            let mut open = 0;
            for offset in 0..count {
                let index = (self.cursor + offset) % count;
                let stream = &mut self.streams[index];
                if stream.closed {
                    continue;
                }
                open += 1;
                match stream.receiver.poll_recv(cx) {
                    Poll::Ready(Some(event)) => {
                        self.cursor = (index + 1) % count;
                        return Poll::Ready(Some((index, event)));
                    }
                    Poll::Ready(None) => {
                        stream.closed = true;
                        return Poll::Ready(Some((
                            index,
                            SubscriptionEvent::Connection(ConnectionState::Disconnected { error: None }),
                        )));
                    }
                    Poll::Pending => {}
                }
            }
            if open == 0 {
                Poll::Ready(None)
            } else {
                Poll::Pending
            }
        })
        .await
    }
}
