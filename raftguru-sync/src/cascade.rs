//! Cascade resolver: keeps per-item child subscriptions in step with each
//! parent's child-id list.
//!
//! ```text
//! batches:B1 ──► tiles:T1 ──► rafts:R1
//!            │            └─► rafts:R2
//!            └─► tiles:T2 ──► rafts:R3
//! ```
//!
//! Every parent key is the uid of the parent's own item subscription, so a
//! child uid is also the parent key of the next level and teardown recurses
//! naturally. A child watched by two parents (a raft moving between tiles)
//! stays subscribed until the last parent lets go of it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::dispatcher::SubscriptionHandler;
use crate::registry::{item_uid, SubscriptionRegistry};
use crate::transport::FrameSink;

/// Result of comparing two child-id lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildDiff {
    /// Ids in the new list but not the previous set, in list order.
    pub added: Vec<String>,
    /// Ids in the previous set but not the new list, sorted.
    pub removed: Vec<String>,
}

impl ChildDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `added = next − previous`, `removed = previous − next`.
pub fn diff_children(previous: &BTreeSet<String>, next: &[String]) -> ChildDiff {
    let next_set: BTreeSet<&str> = next.iter().map(String::as_str).collect();

    let mut added: Vec<String> = Vec::new();
    for id in next {
        if !previous.contains(id) && !added.contains(id) {
            added.push(id.clone());
        }
    }

    let removed = previous
        .iter()
        .filter(|id| !next_set.contains(id.as_str()))
        .cloned()
        .collect();

    ChildDiff { added, removed }
}

/// One nesting level of the cascade (batch→tiles, tile→rafts).
#[derive(Clone)]
pub struct CascadeLevel {
    pub collection: String,
    pub fields: Option<Vec<String>>,
    pub handler: Arc<dyn SubscriptionHandler>,
}

impl CascadeLevel {
    pub fn new(collection: impl Into<String>, handler: Arc<dyn SubscriptionHandler>) -> Self {
        Self {
            collection: collection.into(),
            fields: None,
            handler,
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }
}

struct Watched {
    collection: String,
    ids: BTreeSet<String>,
}

/// Tracks which children each parent currently has subscribed.
#[derive(Default)]
pub struct CascadeResolver {
    watched: HashMap<String, Watched>,
}

impl CascadeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the children of `parent_uid` in line with `children`:
    /// subscribe the added ids, unsubscribe (recursively) the removed ones.
    pub fn apply(
        &mut self,
        parent_uid: &str,
        children: &[String],
        level: &CascadeLevel,
        registry: &mut SubscriptionRegistry,
        sink: &dyn FrameSink,
    ) -> ChildDiff {
        let diff = match self.watched.get(parent_uid) {
            Some(watched) => diff_children(&watched.ids, children),
            None => diff_children(&BTreeSet::new(), children),
        };

        let watched = self
            .watched
            .entry(parent_uid.to_string())
            .or_insert_with(|| Watched {
                collection: level.collection.clone(),
                ids: BTreeSet::new(),
            });
        watched.ids = children.iter().cloned().collect();

        for id in &diff.removed {
            self.drop_child(&level.collection, id, registry, sink);
        }
        for id in &diff.added {
            registry.subscribe_item(
                sink,
                &level.collection,
                id,
                level.fields.as_deref(),
                level.handler.clone(),
            );
        }

        if !diff.is_empty() {
            log::debug!(
                "[Cascade] {parent_uid}: +{:?} -{:?} ({})",
                diff.added,
                diff.removed,
                level.collection
            );
        }
        diff
    }

    /// Forget `parent_uid` and unsubscribe all of its descendants.
    /// Returns the child ids that were watched.
    pub fn release(
        &mut self,
        parent_uid: &str,
        registry: &mut SubscriptionRegistry,
        sink: &dyn FrameSink,
    ) -> Vec<String> {
        let Some(watched) = self.watched.remove(parent_uid) else {
            return Vec::new();
        };
        for id in &watched.ids {
            self.drop_child(&watched.collection, id, registry, sink);
        }
        watched.ids.into_iter().collect()
    }

    fn drop_child(
        &mut self,
        collection: &str,
        id: &str,
        registry: &mut SubscriptionRegistry,
        sink: &dyn FrameSink,
    ) {
        if self.watched_by_any(collection, id) {
            return;
        }
        let child_uid = item_uid(collection, id);
        registry.unsubscribe(sink, &child_uid);
        self.release(&child_uid, registry, sink);
    }

    fn watched_by_any(&self, collection: &str, id: &str) -> bool {
        self.watched
            .values()
            .any(|watched| watched.collection == collection && watched.ids.contains(id))
    }

    /// Children currently watched under `parent_uid`, sorted.
    pub fn children(&self, parent_uid: &str) -> Vec<String> {
        self.watched
            .get(parent_uid)
            .map(|watched| watched.ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_watching(&self, parent_uid: &str) -> bool {
        self.watched.contains_key(parent_uid)
    }

    /// Forget all bookkeeping without sending frames.
    pub fn clear(&mut self) {
        self.watched.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::HandlerContext;
    use crate::protocol::{OutboundFrame, Query, SubscriptionEvent};
    use crate::transport::test_support::RecordingSink;

    struct Noop;

    impl SubscriptionHandler for Noop {
        fn handle(&self, _event: &SubscriptionEvent, _ctx: &mut HandlerContext<'_>) {}
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn set(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn level(collection: &str) -> CascadeLevel {
        CascadeLevel::new(collection, Arc::new(Noop))
    }

    #[test]
    fn test_diff_is_set_difference() {
        let diff = diff_children(&set(&["T1", "T2"]), &ids(&["T2", "T3"]));
        assert_eq!(diff.added, ids(&["T3"]));
        assert_eq!(diff.removed, ids(&["T1"]));
    }

    #[test]
    fn test_diff_keeps_list_order_and_dedupes() {
        let diff = diff_children(&BTreeSet::new(), &ids(&["b", "a", "b"]));
        assert_eq!(diff.added, ids(&["b", "a"]));
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_diff_unchanged_is_empty() {
        assert!(diff_children(&set(&["x"]), &ids(&["x"])).is_empty());
    }

    #[test]
    fn test_batch_scenario_two_updates() {
        let sink = RecordingSink::default();
        let mut registry = SubscriptionRegistry::new();
        let mut cascade = CascadeResolver::new();
        let tiles = level("tiles");

        let first = cascade.apply("batches:B1", &ids(&["T1", "T2"]), &tiles, &mut registry, &sink);
        assert_eq!(first.added, ids(&["T1", "T2"]));
        assert!(first.removed.is_empty());
        assert_eq!(
            sink.take(),
            vec![
                OutboundFrame::subscribe("tiles:T1", "tiles", Query::item("T1")),
                OutboundFrame::subscribe("tiles:T2", "tiles", Query::item("T2")),
            ]
        );

        let second = cascade.apply("batches:B1", &ids(&["T2", "T3"]), &tiles, &mut registry, &sink);
        assert_eq!(second.added, ids(&["T3"]));
        assert_eq!(second.removed, ids(&["T1"]));
        assert_eq!(
            sink.take(),
            vec![
                OutboundFrame::unsubscribe("tiles:T1"),
                OutboundFrame::subscribe("tiles:T3", "tiles", Query::item("T3")),
            ]
        );
        assert_eq!(registry.uids(), ids(&["tiles:T2", "tiles:T3"]));
        assert_eq!(cascade.children("batches:B1"), ids(&["T2", "T3"]));
    }

    #[test]
    fn test_reapplying_same_list_sends_nothing() {
        let sink = RecordingSink::default();
        let mut registry = SubscriptionRegistry::new();
        let mut cascade = CascadeResolver::new();
        let tiles = level("tiles");

        cascade.apply("batches:B1", &ids(&["T1"]), &tiles, &mut registry, &sink);
        sink.take();
        let diff = cascade.apply("batches:B1", &ids(&["T1"]), &tiles, &mut registry, &sink);

        assert!(diff.is_empty());
        assert!(sink.frames().is_empty());
    }

    #[test]
    fn test_removing_tile_releases_its_rafts() {
        let sink = RecordingSink::default();
        let mut registry = SubscriptionRegistry::new();
        let mut cascade = CascadeResolver::new();
        let tiles = level("tiles");
        let rafts = level("rafts");

        cascade.apply("batches:B1", &ids(&["T1"]), &tiles, &mut registry, &sink);
        cascade.apply("tiles:T1", &ids(&["R1", "R2"]), &rafts, &mut registry, &sink);
        sink.take();

        cascade.apply("batches:B1", &[], &tiles, &mut registry, &sink);

        assert!(registry.is_empty());
        assert!(!cascade.is_watching("tiles:T1"));
        assert_eq!(
            sink.take(),
            vec![
                OutboundFrame::unsubscribe("tiles:T1"),
                OutboundFrame::unsubscribe("rafts:R1"),
                OutboundFrame::unsubscribe("rafts:R2"),
            ]
        );
    }

    #[test]
    fn test_release_tears_down_whole_tree() {
        let sink = RecordingSink::default();
        let mut registry = SubscriptionRegistry::new();
        let mut cascade = CascadeResolver::new();
        let tiles = level("tiles");
        let rafts = level("rafts");

        cascade.apply("batches:B1", &ids(&["T1", "T2"]), &tiles, &mut registry, &sink);
        cascade.apply("tiles:T1", &ids(&["R1"]), &rafts, &mut registry, &sink);
        cascade.apply("tiles:T2", &ids(&["R2"]), &rafts, &mut registry, &sink);

        let released = cascade.release("batches:B1", &mut registry, &sink);

        assert_eq!(released, ids(&["T1", "T2"]));
        assert!(registry.is_empty());
        assert!(!cascade.is_watching("tiles:T2"));
    }

    #[test]
    fn test_moved_child_stays_subscribed() {
        let sink = RecordingSink::default();
        let mut registry = SubscriptionRegistry::new();
        let mut cascade = CascadeResolver::new();
        let rafts = level("rafts");

        cascade.apply("tiles:T1", &ids(&["R1"]), &rafts, &mut registry, &sink);
        // R1 shows up under T2 before T1 reports losing it.
        cascade.apply("tiles:T2", &ids(&["R1"]), &rafts, &mut registry, &sink);
        cascade.apply("tiles:T1", &[], &rafts, &mut registry, &sink);

        assert!(registry.contains("rafts:R1"));
        assert_eq!(sink.frames().len(), 1);
    }

    #[test]
    fn test_release_unknown_parent() {
        let sink = RecordingSink::default();
        let mut registry = SubscriptionRegistry::new();
        let mut cascade = CascadeResolver::new();

        assert!(cascade.release("batches:none", &mut registry, &sink).is_empty());
        assert!(sink.frames().is_empty());
    }
}
