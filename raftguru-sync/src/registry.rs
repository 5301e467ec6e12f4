//! Subscription registry: one live subscription per caller-chosen uid.
//!
//! Subscribing a uid that is already registered is a logged no-op, even when
//! the collection or query differ. Unsubscribing an unknown uid is a logged
//! no-op too. Both directions send their control frame only when the
//! registry actually changed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::dispatcher::SubscriptionHandler;
use crate::protocol::{OutboundFrame, Query};
use crate::transport::FrameSink;

/// Deterministic uid of an item-scoped subscription.
pub fn item_uid(collection: &str, id: &str) -> String {
    format!("{collection}:{id}")
}

/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// A single record, filtered by id.
    Item(String),
    /// Every record matching an arbitrary filter.
    Collection,
}

/// A registered subscription.
pub struct SubscriptionEntry {
    pub collection: String,
    pub query: Query,
    pub scope: SubscriptionScope,
    /// Events routed to this subscription so far.
    pub events_received: u64,
    handler: Arc<dyn SubscriptionHandler>,
}

impl SubscriptionEntry {
    pub fn handler(&self) -> Arc<dyn SubscriptionHandler> {
        self.handler.clone()
    }
}

/// Maps uids to subscriptions and emits subscribe/unsubscribe frames.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `uid` and send its subscribe frame.
    ///
    /// Returns `false` without sending anything when `uid` is taken.
    pub fn subscribe(
        &mut self,
        sink: &dyn FrameSink,
        uid: &str,
        collection: &str,
        query: Query,
        scope: SubscriptionScope,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> bool {
        if self.entries.contains_key(uid) {
            log::debug!("[WS] already subscribed to {uid}");
            return false;
        }

        sink.send(&OutboundFrame::subscribe(uid, collection, query.clone()));
        self.entries.insert(
            uid.to_string(),
            SubscriptionEntry {
                collection: collection.to_string(),
                query,
                scope,
                events_received: 0,
                handler,
            },
        );
        log::debug!("[WS] subscribed to {uid}");
        true
    }

    /// Watch one record of `collection` under the uid `<collection>:<id>`.
    pub fn subscribe_item(
        &mut self,
        sink: &dyn FrameSink,
        collection: &str,
        id: &str,
        fields: Option<&[String]>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> bool {
        let mut query = Query::item(id);
        query.fields = fields.map(<[String]>::to_vec);
        self.subscribe(
            sink,
            &item_uid(collection, id),
            collection,
            query,
            SubscriptionScope::Item(id.to_string()),
            handler,
        )
    }

    /// Watch every record of `collection` matching `filter`.
    pub fn subscribe_collection(
        &mut self,
        sink: &dyn FrameSink,
        uid: &str,
        collection: &str,
        filter: Option<Value>,
        fields: Option<Vec<String>>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> bool {
        let query = Query { filter, fields };
        self.subscribe(sink, uid, collection, query, SubscriptionScope::Collection, handler)
    }

    /// Remove `uid` and send its unsubscribe frame.
    ///
    /// Returns `false` without sending anything when `uid` is unknown.
    pub fn unsubscribe(&mut self, sink: &dyn FrameSink, uid: &str) -> bool {
        if self.entries.remove(uid).is_none() {
            log::debug!("[WS] not subscribed to {uid}");
            return false;
        }
        sink.send(&OutboundFrame::unsubscribe(uid));
        log::debug!("[WS] unsubscribed from {uid}");
        true
    }

    /// Forget every subscription without sending frames (the connection is
    /// already gone).
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            log::info!("[WS] dropping {} subscriptions", self.entries.len());
        }
        self.entries.clear();
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn get(&self, uid: &str) -> Option<&SubscriptionEntry> {
        self.entries.get(uid)
    }

    pub(crate) fn get_mut(&mut self, uid: &str) -> Option<&mut SubscriptionEntry> {
        self.entries.get_mut(uid)
    }

    /// Handler registered for `uid`.
    pub fn handler(&self, uid: &str) -> Option<Arc<dyn SubscriptionHandler>> {
        self.entries.get(uid).map(SubscriptionEntry::handler)
    }

    /// Active uids, sorted.
    pub fn uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.entries.keys().cloned().collect();
        uids.sort();
        uids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
