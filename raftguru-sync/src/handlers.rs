//! Handlers for the three watched collections.
//!
//! The batch watcher is a collection subscription on the current batch.
//! Everything below it is per-item: each tile id of the batch, and each raft
//! id of a tile, gets its own subscription through the cascade resolver.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::cascade::CascadeLevel;
use crate::dispatcher::{HandlerContext, SubscriptionHandler};
use crate::engine::SyncEvent;
use crate::mirror::{ApplyOutcome, RaftChange};
use crate::model::{child_ids, BatchPatch, Raft, Tile, TilePatch, TileRef};
use crate::protocol::{eq_filter, EventKind, SubscriptionEvent};
use crate::registry::item_uid;

/// Uid of the collection subscription watching the current batch.
pub const CURRENT_BATCH_UID: &str = "batches-current";

pub const BATCHES: &str = "batches";
pub const TILES: &str = "tiles";
pub const RAFTS: &str = "rafts";

pub const BATCH_FIELDS: &[&str] = &["id", "tiles", "date_created", "isCurrent"];
pub const TILE_FIELDS: &[&str] = &["*", "rafts.*"];
pub const RAFT_FIELDS: &[&str] = &["*", "tile.id", "tile.ref"];

fn fields(list: &[&str]) -> Vec<String> {
    list.iter().map(|field| field.to_string()).collect()
}

/// Filter selecting the current batch.
pub fn current_batch_filter() -> serde_json::Value {
    eq_filter("isCurrent", true)
}

/// Build the handler tree: batch → tiles → rafts.
pub fn current_batch_handler() -> Arc<BatchHandler> {
    let rafts = CascadeLevel::new(RAFTS, Arc::new(RaftHandler)).with_fields(fields(RAFT_FIELDS));
    let tiles = CascadeLevel::new(TILES, Arc::new(TileHandler::new(rafts)))
        .with_fields(fields(TILE_FIELDS));
    Arc::new(BatchHandler::new(tiles))
}

pub fn batch_fields() -> Vec<String> {
    fields(BATCH_FIELDS)
}

/// Decode the payload, logging and skipping entries that do not fit `T`.
fn decode_records<T: DeserializeOwned>(event: &SubscriptionEvent) -> Vec<T> {
    event
        .records::<T>()
        .into_iter()
        .filter_map(|record| match record {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("[Sync] dropping {} record on {}: {e}", event.kind.as_str(), event.uid);
                None
            }
        })
        .collect()
}

fn log_outcome(what: &str, id: &str, outcome: &ApplyOutcome) {
    if let ApplyOutcome::Ignored(reason) = outcome {
        log::warn!("[Sync] {what} {id} ignored: {reason:?}");
    }
}

/// Reacts to the current-batch watcher.
pub struct BatchHandler {
    tiles: CascadeLevel,
}

impl BatchHandler {
    pub fn new(tiles: CascadeLevel) -> Self {
        Self { tiles }
    }

    /// Apply one batch record. Records that only match the filter (`init`,
    /// `create`) count as current unless they say otherwise; an `update`
    /// for a batch the mirror does not hold must say so explicitly.
    fn load(&self, patch: BatchPatch, kind: EventKind, ctx: &mut HandlerContext<'_>) {
        let mirrored = ctx.mirror.batch_id() == Some(patch.id.as_str());
        let current = patch.is_current.unwrap_or(mirrored || kind != EventKind::Update);
        if !current {
            if mirrored {
                log::info!("[Sync] batch {} is no longer current", patch.id);
                Self::close(ctx);
            } else {
                log::debug!("[Sync] ignoring batch {} that is not current", patch.id);
            }
            return;
        }

        let batch_id = patch.id.clone();
        let parent = item_uid(BATCHES, &batch_id);
        let tile_ids = patch.tile_ids();
        if mirrored {
            ctx.mirror.update_batch(patch);
        } else {
            if ctx.mirror.batch_id().is_some() {
                log::info!("[Sync] current batch switched to {batch_id}");
                Self::close(ctx);
            }
            ctx.mirror.set_batch(patch.into_batch());
        }

        // Records without a tile list leave the tile subscriptions alone.
        if let Some(tile_ids) = &tile_ids {
            let diff = ctx
                .cascade
                .apply(&parent, tile_ids, &self.tiles, ctx.registry, ctx.sink);
            for tile_id in &diff.removed {
                if let Some(slot) = ctx.mirror.remove_tile(tile_id) {
                    ctx.events.push(SyncEvent::TileCleared(slot));
                }
            }
        }

        if !mirrored {
            let count = tile_ids.map_or(0, |ids| ids.len());
            log::info!("[Sync] loaded batch {batch_id} ({count} tiles)");
            ctx.events.push(SyncEvent::BatchLoaded(batch_id));
        }
    }

    /// Tear down the whole tree and empty the mirror.
    fn close(ctx: &mut HandlerContext<'_>) {
        let Some(batch_id) = ctx.mirror.batch_id().map(str::to_string) else {
            return;
        };
        ctx.cascade
            .release(&item_uid(BATCHES, &batch_id), ctx.registry, ctx.sink);
        ctx.mirror.clear();
        log::info!("[Sync] batch {batch_id} closed");
        ctx.events.push(SyncEvent::BatchClosed(batch_id));
    }
}

impl SubscriptionHandler for BatchHandler {
    fn handle(&self, event: &SubscriptionEvent, ctx: &mut HandlerContext<'_>) {
        match event.kind {
            EventKind::Init | EventKind::Create | EventKind::Update => {
                let batches = decode_records::<BatchPatch>(event);
                if batches.is_empty() && event.kind == EventKind::Init {
                    // Nothing is current right now.
                    Self::close(ctx);
                    return;
                }
                for batch in batches {
                    self.load(batch, event.kind, ctx);
                }
            }
            EventKind::Delete => {
                let deleted = event.ids();
                let closes_mirrored = ctx
                    .mirror
                    .batch_id()
                    .is_some_and(|id| deleted.iter().any(|deleted_id| deleted_id.as_str() == id));
                if closes_mirrored {
                    Self::close(ctx);
                } else {
                    log::debug!("[Sync] ignoring delete of batches {deleted:?}");
                }
            }
        }
    }
}

/// Reacts to one tile's item subscription.
pub struct TileHandler {
    rafts: CascadeLevel,
}

impl TileHandler {
    pub fn new(rafts: CascadeLevel) -> Self {
        Self { rafts }
    }

    fn follow_rafts(&self, tile_id: &str, raft_ids: &[String], ctx: &mut HandlerContext<'_>) {
        let diff = ctx.cascade.apply(
            &item_uid(TILES, tile_id),
            raft_ids,
            &self.rafts,
            ctx.registry,
            ctx.sink,
        );
        for raft_id in diff.removed {
            if ctx.mirror.detach_raft(tile_id, &raft_id) {
                ctx.events.push(SyncEvent::RaftRemoved(raft_id));
            }
        }
    }

    /// Another tile about to be overwritten in `slot` loses its rafts with
    /// it, so stop following them. Its own subscription stays with the
    /// batch, and its next event puts it back.
    fn displace(&self, slot: TileRef, tile_id: &str, ctx: &mut HandlerContext<'_>) {
        let Some(other) = ctx
            .mirror
            .tile(slot)
            .filter(|tile| tile.id != tile_id)
            .map(|tile| tile.id.clone())
        else {
            return;
        };
        log::warn!("[Sync] tile {tile_id} displaces {other} from {slot}");
        ctx.cascade
            .release(&item_uid(TILES, &other), ctx.registry, ctx.sink);
    }

    fn insert(&self, tile: Tile, ctx: &mut HandlerContext<'_>) {
        let tile_id = tile.id.clone();
        let raft_ids = tile.raft_ids();
        self.displace(tile.slot, &tile_id, ctx);
        let outcome = ctx.mirror.insert_tile(tile);
        if let ApplyOutcome::Applied(slot) = outcome {
            ctx.events.push(SyncEvent::TileChanged(slot));
            self.follow_rafts(&tile_id, &raft_ids, ctx);
        }
    }

    fn update(&self, patch: TilePatch, ctx: &mut HandlerContext<'_>) {
        let tile_id = patch.id.clone();
        let previous = ctx.mirror.find_tile(&tile_id);
        let raft_ids = patch.rafts.as_deref().map(child_ids);
        if let Some(target) = patch.slot.filter(|slot| Some(*slot) != previous) {
            self.displace(target, &tile_id, ctx);
        }
        let outcome = ctx.mirror.update_tile(patch);
        log_outcome("tile", &tile_id, &outcome);

        let ApplyOutcome::Applied(slot) = outcome else {
            return;
        };
        if let Some(old) = previous.filter(|old| *old != slot) {
            ctx.events.push(SyncEvent::TileCleared(old));
        }
        ctx.events.push(SyncEvent::TileChanged(slot));
        if let Some(raft_ids) = raft_ids {
            self.follow_rafts(&tile_id, &raft_ids, ctx);
        }
    }

    fn remove(&self, tile_id: &str, ctx: &mut HandlerContext<'_>) {
        ctx.cascade
            .release(&item_uid(TILES, tile_id), ctx.registry, ctx.sink);
        if let Some(slot) = ctx.mirror.remove_tile(tile_id) {
            ctx.events.push(SyncEvent::TileCleared(slot));
        }
    }
}

impl SubscriptionHandler for TileHandler {
    fn handle(&self, event: &SubscriptionEvent, ctx: &mut HandlerContext<'_>) {
        match event.kind {
            EventKind::Init | EventKind::Create => {
                for tile in decode_records::<Tile>(event) {
                    self.insert(tile, ctx);
                }
            }
            EventKind::Update => {
                for patch in decode_records::<TilePatch>(event) {
                    self.update(patch, ctx);
                }
            }
            EventKind::Delete => {
                for tile_id in event.ids() {
                    self.remove(&tile_id, ctx);
                }
            }
        }
    }
}

/// Reacts to one raft's item subscription.
pub struct RaftHandler;

impl RaftHandler {
    fn upsert(raft: Raft, change: RaftChange, ctx: &mut HandlerContext<'_>) {
        let raft_id = raft.id.clone();
        let outcome = ctx.mirror.upsert_raft(raft, change);
        log_outcome("raft", &raft_id, &outcome);
        if let ApplyOutcome::Applied(slot) = outcome {
            ctx.events.push(SyncEvent::RaftChanged { slot, raft_id });
        }
    }
}

impl SubscriptionHandler for RaftHandler {
    fn handle(&self, event: &SubscriptionEvent, ctx: &mut HandlerContext<'_>) {
        let change = match event.kind {
            EventKind::Init | EventKind::Create => RaftChange::Create,
            EventKind::Update => RaftChange::Update,
            EventKind::Delete => {
                for raft_id in event.ids() {
                    if ctx.mirror.remove_raft(&raft_id) {
                        ctx.events.push(SyncEvent::RaftRemoved(raft_id));
                    }
                }
                return;
            }
        };
        for raft in decode_records::<Raft>(event) {
            Self::upsert(raft, change, ctx);
        }
    }
}
