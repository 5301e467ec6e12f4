//! The sync engine: one explicit context object composing the connection,
//! registry, dispatcher, cascade resolver and mirror.
//!
//! ```text
//! socket ──► reader task ──► TransportEvent channel ──► SyncEngine::run
//!                                                          │
//!                                          dispatcher ◄────┘
//!                                              │ HandlerContext
//!                                              ▼
//!                               handler ──► mirror / cascade / registry
//! ```
//!
//! All mutable state sits behind one async mutex and every frame is fully
//! applied before the next one is looked at. Several engines can coexist.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::cascade::CascadeResolver;
use crate::config::SyncConfig;
use crate::dispatcher::{Dispatch, DispatchStats, Dispatcher, HandlerContext, SubscriptionHandler};
use crate::error::SyncError;
use crate::handlers::{
    batch_fields, current_batch_filter, current_batch_handler, BATCHES, CURRENT_BATCH_UID,
};
use crate::mirror::MirrorStore;
use crate::model::{BatchId, RaftId, TileRef};
use crate::persist::TokenStore;
use crate::registry::SubscriptionRegistry;
use crate::session::SessionProvider;
use crate::transport::{AttachedPeer, Connection, ConnectionState, TransportError, TransportEvent};

/// Notifications for whoever renders the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    BatchLoaded(BatchId),
    BatchClosed(BatchId),
    TileChanged(TileRef),
    TileCleared(TileRef),
    RaftChanged { slot: TileRef, raft_id: RaftId },
    RaftRemoved(RaftId),
}

#[derive(Default)]
struct EngineState {
    registry: SubscriptionRegistry,
    cascade: CascadeResolver,
    mirror: MirrorStore,
    dispatcher: Dispatcher,
}

impl EngineState {
    fn reset(&mut self) {
        self.registry.clear();
        self.cascade.clear();
        self.mirror.clear();
        self.dispatcher.reset();
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    connection: Connection,
    state: Arc<Mutex<EngineState>>,
    transport_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    listeners: parking_lot::Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
    tokens: Arc<dyn TokenStore>,
    /// Highest connection generation announced as connected.
    announced: AtomicU64,
    /// Highest connection generation whose close has been handled.
    closed: AtomicU64,
}

impl SyncEngine {
    /// Engine for `config.ws_url`. Call [`connect`](Self::connect) next.
    pub fn new(config: SyncConfig, tokens: Arc<dyn TokenStore>) -> Self {
        let connection = Connection::new(config.ws_url.clone(), config.connect_timeout);
        Self::with_connection(config, connection, tokens)
    }

    /// Engine over an in-process peer, already connected.
    pub fn attached(config: SyncConfig, tokens: Arc<dyn TokenStore>) -> (Self, AttachedPeer) {
        let (connection, peer) = Connection::attached();
        let engine = Self::with_connection(config, connection, tokens);
        engine.announce_connected();
        (engine, peer)
    }

    fn with_connection(
        config: SyncConfig,
        mut connection: Connection,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        let transport_rx = connection.take_event_rx();
        Self {
            config,
            connection,
            state: Arc::new(Mutex::new(EngineState::default())),
            transport_rx: Mutex::new(transport_rx),
            listeners: parking_lot::Mutex::new(Vec::new()),
            tokens,
            announced: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// New receiver for [`SyncEvent`]s.
    pub fn events(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    fn emit(&self, events: Vec<SyncEvent>) {
        if events.is_empty() {
            return;
        }
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| events.iter().all(|event| listener.send(event.clone()).is_ok()));
    }

    fn announce_connected(&self) {
        let generation = self.connection.generation();
        if self.announced.fetch_max(generation, Ordering::SeqCst) < generation {
            self.emit(vec![SyncEvent::Connected]);
        }
    }

    /// Open the connection (idempotent).
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.connection.connect().await?;
        self.announce_connected();
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Register a subscription. Returns `false` when `uid` was taken.
    pub async fn subscribe(
        &self,
        uid: &str,
        collection: &str,
        filter: Option<Value>,
        fields: Option<Vec<String>>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<bool, SyncError> {
        if !self.connection.is_connected() {
            return Err(TransportError::ConnectionClosed.into());
        }
        let mut state = self.state.lock().await;
        Ok(state
            .registry
            .subscribe_collection(&self.connection, uid, collection, filter, fields, handler))
    }

    /// Drop a subscription. Returns `false` when `uid` was unknown.
    pub async fn unsubscribe(&self, uid: &str) -> bool {
        let mut state = self.state.lock().await;
        state.registry.unsubscribe(&self.connection, uid)
    }

    /// Start watching the current batch. Returns the watcher's uid.
    pub async fn watch_current_batch(&self) -> Result<String, SyncError> {
        self.subscribe(
            CURRENT_BATCH_UID,
            BATCHES,
            Some(current_batch_filter()),
            Some(batch_fields()),
            current_batch_handler(),
        )
        .await?;
        Ok(CURRENT_BATCH_UID.to_string())
    }

    /// Wait for the first event of `uid`, bounded by the configured timeout.
    ///
    /// Fails with `ConnectionClosed` when the connection drops first.
    pub async fn first_event(&self, uid: &str) -> Result<(), SyncError> {
        let rx = {
            let mut state = self.state.lock().await;
            let EngineState {
                registry,
                dispatcher,
                ..
            } = &mut *state;
            dispatcher.expect_first_event(uid, registry)
        };

        let timeout = self.config.first_event_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed.into()),
            Err(_) => Err(SyncError::FirstEventTimeout {
                uid: uid.to_string(),
                timeout,
            }),
        }
    }

    /// Log-in check, connect, watch the current batch.
    ///
    /// Does not wait for the first event: the caller has to keep
    /// [`run`](Self::run) going for that.
    pub async fn bootstrap(&self, session: &dyn SessionProvider) -> Result<String, SyncError> {
        if !session.is_logged_in().await {
            return Err(SyncError::NotLoggedIn);
        }
        self.connect().await?;
        self.watch_current_batch().await
    }

    /// Decode and apply one inbound text frame.
    pub async fn process_frame(&self, text: &str) -> Result<Dispatch, SyncError> {
        let (outcome, events) = {
            let mut state = self.state.lock().await;
            let EngineState {
                registry,
                cascade,
                mirror,
                dispatcher,
            } = &mut *state;
            let mut events = Vec::new();
            let mut ctx = HandlerContext {
                mirror,
                registry,
                cascade,
                sink: &self.connection,
                events: &mut events,
            };
            let outcome = dispatcher.dispatch_text(text, &mut ctx);
            (outcome, events)
        };
        self.publish(events);
        Ok(outcome?)
    }

    /// Apply one transport event. Frames and closes from an older
    /// connection are ignored.
    pub async fn handle_transport_event(
        &self,
        event: TransportEvent,
    ) -> Result<Option<Dispatch>, SyncError> {
        match event {
            TransportEvent::Frame { generation, text } => {
                if generation != self.connection.generation() {
                    log::debug!("[Sync] ignoring frame from connection #{generation}");
                    return Ok(None);
                }
                self.process_frame(&text).await.map(Some)
            }
            TransportEvent::Closed { generation } => {
                self.handle_closed(generation).await;
                Ok(None)
            }
        }
    }

    async fn handle_closed(&self, generation: u64) {
        if generation != self.connection.generation() {
            return;
        }
        if self.closed.fetch_max(generation, Ordering::SeqCst) >= generation {
            return;
        }
        self.state.lock().await.reset();
        log::info!("[Sync] connection #{generation} closed, subscriptions dropped");
        self.emit(vec![SyncEvent::Disconnected]);
    }

    /// Process transport events until the current connection closes.
    ///
    /// Malformed frames are logged and skipped.
    pub async fn run(&self) -> Result<(), SyncError> {
        let mut guard = self.transport_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Err(TransportError::ConnectionClosed.into());
        };

        while let Some(event) = rx.recv().await {
            let closing = matches!(event, TransportEvent::Closed { .. });
            if let Err(e) = self.handle_transport_event(event).await {
                log::warn!("[Sync] {e}");
            }
            if closing && !self.connection.is_connected() {
                break;
            }
        }
        Ok(())
    }

    /// Process whatever transport events are already queued, without
    /// waiting. Returns how many were handled.
    pub async fn pump(&self) -> Result<usize, SyncError> {
        let mut guard = self.transport_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Err(TransportError::ConnectionClosed.into());
        };
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            handled += 1;
            self.handle_transport_event(event).await?;
        }
        Ok(handled)
    }

    /// Close the connection and forget all subscription state.
    pub async fn disconnect(&self) {
        self.connection.close();
        self.handle_closed(self.connection.generation()).await;
    }

    fn publish(&self, events: Vec<SyncEvent>) {
        for event in &events {
            let stored = match event {
                SyncEvent::BatchLoaded(batch_id) => self.tokens.save(batch_id),
                SyncEvent::BatchClosed(_) => self.tokens.clear(),
                _ => Ok(()),
            };
            if let Err(e) = stored {
                log::warn!("[Sync] could not update last batch hint: {e}");
            }
        }
        self.emit(events);
    }

    /// Copy of the mirror.
    pub async fn snapshot(&self) -> MirrorStore {
        self.state.lock().await.mirror.clone()
    }

    pub async fn current_batch_id(&self) -> Option<BatchId> {
        self.state
            .lock()
            .await
            .mirror
            .batch_id()
            .map(str::to_string)
    }

    /// Active subscription uids, sorted.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.state.lock().await.registry.uids()
    }

    pub async fn stats(&self) -> DispatchStats {
        self.state.lock().await.dispatcher.stats()
    }

    /// Last batch this client saw as current. Advisory only.
    pub fn last_batch_hint(&self) -> Result<Option<String>, SyncError> {
        Ok(self.tokens.load()?)
    }
}
