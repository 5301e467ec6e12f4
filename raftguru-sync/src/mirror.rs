//! Local mirror of the current batch: the batch record plus a twelve-slot
//! tile grid, each occupied slot holding its tile and the tile's rafts.
//!
//! Every mutation returns an [`ApplyOutcome`] instead of failing, so data
//! faults (unknown tile, orphan raft) are observable without aborting
//! event processing.

use crate::model::{Batch, BatchPatch, Raft, RaftId, Tile, TileId, TilePatch, TileRef};

/// A live tile with its inlined rafts.
#[derive(Debug, Clone, PartialEq)]
pub struct TileEntry {
    pub tile: Tile,
    pub rafts: Vec<Raft>,
}

impl TileEntry {
    fn new(tile: Tile) -> Self {
        let rafts = tile
            .rafts
            .iter()
            .filter_map(|child| child.record().cloned())
            .collect();
        Self { tile, rafts }
    }

    pub fn raft(&self, id: &str) -> Option<&Raft> {
        self.rafts.iter().find(|raft| raft.id == id)
    }
}

/// Grid slot: a live tile or the explicit empty marker.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Slot {
    #[default]
    Empty,
    Occupied(TileEntry),
}

impl Slot {
    pub fn entry(&self) -> Option<&TileEntry> {
        match self {
            Slot::Empty => None,
            Slot::Occupied(entry) => Some(entry),
        }
    }

    fn entry_mut(&mut self) -> Option<&mut TileEntry> {
        match self {
            Slot::Empty => None,
            Slot::Occupied(entry) => Some(entry),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

/// Why an event left the mirror untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// A tile update without a slot for a tile the mirror does not hold.
    UnknownTile(TileId),
    /// A raft whose owning tile is not in the grid.
    OrphanRaft { raft_id: RaftId, tile: Option<TileId> },
}

/// Result of applying one record to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(TileRef),
    Unchanged,
    Ignored(Rejection),
}

/// How a raft record reached the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftChange {
    Create,
    Update,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorStore {
    batch: Option<Batch>,
    grid: [Slot; TileRef::COUNT],
}

impl MirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.batch.as_ref().map(|batch| batch.id.as_str())
    }

    /// Replace the batch record. Slots are left alone.
    pub fn set_batch(&mut self, batch: Batch) {
        self.batch = Some(batch);
    }

    /// Merge a partial record into the mirrored batch. Returns false when
    /// `patch` is for some other batch.
    pub fn update_batch(&mut self, patch: BatchPatch) -> bool {
        match self.batch.as_mut() {
            Some(batch) if batch.id == patch.id => {
                patch.apply_to(batch);
                true
            }
            _ => false,
        }
    }

    /// Forget the batch and empty every slot.
    pub fn clear(&mut self) {
        self.batch = None;
        self.grid = Default::default();
    }

    pub fn slot(&self, slot: TileRef) -> &Slot {
        &self.grid[slot.index()]
    }

    /// Slots in grid order.
    pub fn slots(&self) -> impl Iterator<Item = (TileRef, &Slot)> {
        TileRef::ALL.into_iter().zip(self.grid.iter())
    }

    pub fn tile(&self, slot: TileRef) -> Option<&Tile> {
        self.slot(slot).entry().map(|entry| &entry.tile)
    }

    pub fn rafts(&self, slot: TileRef) -> &[Raft] {
        self.slot(slot)
            .entry()
            .map(|entry| entry.rafts.as_slice())
            .unwrap_or_default()
    }

    /// Slot currently holding tile `id`.
    pub fn find_tile(&self, id: &str) -> Option<TileRef> {
        self.slots()
            .find(|(_, slot)| slot.entry().is_some_and(|entry| entry.tile.id == id))
            .map(|(slot, _)| slot)
    }

    /// Slot currently holding raft `id`.
    pub fn find_raft(&self, id: &str) -> Option<TileRef> {
        self.slots()
            .find(|(_, slot)| slot.entry().is_some_and(|entry| entry.raft(id).is_some()))
            .map(|(slot, _)| slot)
    }

    pub fn occupied(&self) -> usize {
        self.grid.iter().filter(|slot| !slot.is_empty()).count()
    }

    /// Put `tile` into the slot named by its `ref`.
    ///
    /// The same tile held elsewhere is moved. When the slot already holds
    /// this tile its rafts are kept unless the record expands new ones.
    pub fn insert_tile(&mut self, tile: Tile) -> ApplyOutcome {
        let target = tile.slot;
        let mut kept_rafts = None;
        if let Some(current) = self.find_tile(&tile.id) {
            if let Slot::Occupied(entry) = std::mem::take(&mut self.grid[current.index()]) {
                kept_rafts = Some(entry.rafts);
            }
        }

        let mut entry = TileEntry::new(tile);
        if entry.rafts.is_empty() {
            if let Some(rafts) = kept_rafts {
                entry.rafts = rafts;
            }
        }
        self.grid[target.index()] = Slot::Occupied(entry);
        ApplyOutcome::Applied(target)
    }

    /// Merge a partial tile into its entry, moving it when `ref` changed.
    /// A patch for an unknown tile is inserted when it names a slot.
    pub fn update_tile(&mut self, patch: TilePatch) -> ApplyOutcome {
        let Some(current) = self.find_tile(&patch.id) else {
            let id = patch.id.clone();
            return match patch.into_tile() {
                Some(tile) => self.insert_tile(tile),
                None => ApplyOutcome::Ignored(Rejection::UnknownTile(id)),
            };
        };

        let Slot::Occupied(mut entry) = std::mem::take(&mut self.grid[current.index()]) else {
            return ApplyOutcome::Unchanged;
        };
        let expanded: Vec<Raft> = patch
            .rafts
            .iter()
            .flatten()
            .filter_map(|child| child.record().cloned())
            .collect();
        patch.apply_to(&mut entry.tile);
        if !expanded.is_empty() {
            entry.rafts = expanded;
        }

        let target = entry.tile.slot;
        self.grid[target.index()] = Slot::Occupied(entry);
        ApplyOutcome::Applied(target)
    }

    /// Empty the slot holding tile `id`. Its rafts go with it.
    pub fn remove_tile(&mut self, id: &str) -> Option<TileRef> {
        let slot = self.find_tile(id)?;
        self.grid[slot.index()] = Slot::Empty;
        Some(slot)
    }

    /// Add or replace a raft under its owning tile.
    ///
    /// The owner is found by the raft's tile id, then by its expanded tile
    /// ref. Updates without either stay where the raft already lives.
    pub fn upsert_raft(&mut self, raft: Raft, change: RaftChange) -> ApplyOutcome {
        let owner = raft
            .tile_id()
            .and_then(|tile_id| self.find_tile(tile_id))
            .or_else(|| {
                raft.tile_slot()
                    .filter(|slot| !self.slot(*slot).is_empty())
            })
            .or_else(|| match change {
                RaftChange::Update if raft.tile.is_none() => self.find_raft(&raft.id),
                _ => None,
            });

        let Some(owner) = owner else {
            return ApplyOutcome::Ignored(Rejection::OrphanRaft {
                raft_id: raft.id.clone(),
                tile: raft.tile_id().map(str::to_string),
            });
        };

        for (index, slot) in self.grid.iter_mut().enumerate() {
            if index == owner.index() {
                continue;
            }
            if let Some(entry) = slot.entry_mut() {
                entry.rafts.retain(|existing| existing.id != raft.id);
            }
        }

        let Some(entry) = self.grid[owner.index()].entry_mut() else {
            return ApplyOutcome::Unchanged;
        };
        match entry.rafts.iter_mut().find(|existing| existing.id == raft.id) {
            Some(existing) if *existing == raft => return ApplyOutcome::Unchanged,
            Some(existing) => *existing = raft,
            None => entry.rafts.push(raft),
        }
        ApplyOutcome::Applied(owner)
    }

    /// Remove raft `id` from every slot. Returns whether anything changed.
    pub fn remove_raft(&mut self, id: &str) -> bool {
        let mut removed = false;
        for entry in self.grid.iter_mut().filter_map(Slot::entry_mut) {
            let before = entry.rafts.len();
            entry.rafts.retain(|raft| raft.id != id);
            removed |= entry.rafts.len() != before;
        }
        removed
    }

    /// Remove raft `id` only from the tile `tile_id`, leaving a copy that
    /// already moved to another tile in place.
    pub fn detach_raft(&mut self, tile_id: &str, id: &str) -> bool {
        let Some(slot) = self.find_tile(tile_id) else {
            return false;
        };
        let Some(entry) = self.grid[slot.index()].entry_mut() else {
            return false;
        };
        let before = entry.rafts.len();
        entry.rafts.retain(|raft| raft.id != id);
        entry.rafts.len() != before
    }
}
