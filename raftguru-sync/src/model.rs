//! Server records mirrored by the client: batches, tiles and rafts.
//!
//! Field names follow the wire format of the record API (`isCurrent`,
//! `ref`, `serialNumber`, ...). Parent/child links are either bare ids or
//! expanded records depending on the `fields` projection of the request,
//! which is what [`Related`] models.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type BatchId = String;
pub type TileId = String;
pub type RaftId = String;
pub type UserId = String;

/// ISO-8601 timestamp as sent by the server. Never parsed by the mirror.
pub type Timestamp = String;

/// Records that carry a server identifier.
pub trait Identified {
    fn record_id(&self) -> Option<&str>;
}

/// A link to another record: either its id or the expanded record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Related<T> {
    Id(String),
    Record(T),
}

impl<T: Identified> Related<T> {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Id(id) => Some(id.as_str()),
            Self::Record(record) => record.record_id(),
        }
    }

    pub fn record(&self) -> Option<&T> {
        match self {
            Self::Id(_) => None,
            Self::Record(record) => Some(record),
        }
    }
}

/// Collect the ids of a child list, skipping entries without one and
/// keeping the first occurrence of duplicates.
pub fn child_ids<T: Identified>(children: &[Related<T>]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::with_capacity(children.len());
    for child in children {
        if let Some(id) = child.id() {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

/// One of the twelve fixed grid slots (rows A–D × columns 0–2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TileRef {
    #[serde(rename = "A-0")]
    A0,
    #[serde(rename = "A-1")]
    A1,
    #[serde(rename = "A-2")]
    A2,
    #[serde(rename = "B-0")]
    B0,
    #[serde(rename = "B-1")]
    B1,
    #[serde(rename = "B-2")]
    B2,
    #[serde(rename = "C-0")]
    C0,
    #[serde(rename = "C-1")]
    C1,
    #[serde(rename = "C-2")]
    C2,
    #[serde(rename = "D-0")]
    D0,
    #[serde(rename = "D-1")]
    D1,
    #[serde(rename = "D-2")]
    D2,
}

impl TileRef {
    pub const COUNT: usize = 12;

    /// All slots in grid order (row-major).
    pub const ALL: [TileRef; Self::COUNT] = [
        TileRef::A0,
        TileRef::A1,
        TileRef::A2,
        TileRef::B0,
        TileRef::B1,
        TileRef::B2,
        TileRef::C0,
        TileRef::C1,
        TileRef::C2,
        TileRef::D0,
        TileRef::D1,
        TileRef::D2,
    ];

    /// Position of the slot in [`TileRef::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TileRef::A0 => "A-0",
            TileRef::A1 => "A-1",
            TileRef::A2 => "A-2",
            TileRef::B0 => "B-0",
            TileRef::B1 => "B-1",
            TileRef::B2 => "B-2",
            TileRef::C0 => "C-0",
            TileRef::C1 => "C-1",
            TileRef::C2 => "C-2",
            TileRef::D0 => "D-0",
            TileRef::D1 => "D-1",
            TileRef::D2 => "D-2",
        }
    }
}

impl fmt::Display for TileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TileRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TileRef::ALL
            .into_iter()
            .find(|slot| slot.as_str() == s)
            .ok_or_else(|| format!("unknown tile ref '{s}'"))
    }
}

/// Application user, as expanded in audit fields or returned by `/users/me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Identified for User {
    fn record_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

/// Top-level unit of work. At most one batch is current at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_created: Option<Timestamp>,
    #[serde(rename = "isCurrent", default)]
    pub is_current: bool,
    #[serde(default)]
    pub tiles: Vec<Related<Tile>>,
}

impl Batch {
    pub fn tile_ids(&self) -> Vec<TileId> {
        child_ids(&self.tiles)
    }
}

impl Identified for Batch {
    fn record_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

/// Batch record as carried by watcher events. Absent fields are unknown,
/// not false or empty.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BatchPatch {
    pub id: BatchId,
    #[serde(default)]
    pub date_created: Option<Timestamp>,
    #[serde(rename = "isCurrent", default)]
    pub is_current: Option<bool>,
    #[serde(default)]
    pub tiles: Option<Vec<Related<Tile>>>,
}

impl BatchPatch {
    /// Tile ids, when the record carries the tile list at all.
    pub fn tile_ids(&self) -> Option<Vec<TileId>> {
        self.tiles.as_deref().map(child_ids)
    }

    pub fn apply_to(self, batch: &mut Batch) {
        if self.date_created.is_some() {
            batch.date_created = self.date_created;
        }
        if let Some(is_current) = self.is_current {
            batch.is_current = is_current;
        }
        if let Some(tiles) = self.tiles {
            batch.tiles = tiles;
        }
    }

    /// Full batch record, with absent fields at their defaults.
    pub fn into_batch(self) -> Batch {
        Batch {
            id: self.id,
            date_created: self.date_created,
            is_current: self.is_current.unwrap_or(true),
            tiles: self.tiles.unwrap_or_default(),
        }
    }
}

/// A record in one of the twelve grid slots of the current batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub id: TileId,
    #[serde(rename = "ref")]
    pub slot: TileRef,
    #[serde(default)]
    pub standup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchId>,
    /// Child links as last reported by the server. The mirror keeps the
    /// full raft records separately.
    #[serde(default)]
    pub rafts: Vec<Related<Raft>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_created: Option<Related<User>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_updated: Option<Related<User>>,
}

impl Tile {
    pub fn raft_ids(&self) -> Vec<RaftId> {
        child_ids(&self.rafts)
    }
}

impl Identified for Tile {
    fn record_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

/// Partial tile as carried by update events. Absent fields keep their
/// previous value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TilePatch {
    pub id: TileId,
    #[serde(rename = "ref", default)]
    pub slot: Option<TileRef>,
    #[serde(default)]
    pub standup: Option<bool>,
    #[serde(default)]
    pub batch: Option<BatchId>,
    #[serde(default)]
    pub rafts: Option<Vec<Related<Raft>>>,
    #[serde(default)]
    pub user_created: Option<Related<User>>,
    #[serde(default)]
    pub user_updated: Option<Related<User>>,
}

impl TilePatch {
    /// Merge into an existing tile.
    pub fn apply_to(self, tile: &mut Tile) {
        if let Some(slot) = self.slot {
            tile.slot = slot;
        }
        if let Some(standup) = self.standup {
            tile.standup = standup;
        }
        if self.batch.is_some() {
            tile.batch = self.batch;
        }
        if let Some(rafts) = self.rafts {
            tile.rafts = rafts;
        }
        if self.user_created.is_some() {
            tile.user_created = self.user_created;
        }
        if self.user_updated.is_some() {
            tile.user_updated = self.user_updated;
        }
    }

    /// Build a full tile when the patch names a slot.
    pub fn into_tile(self) -> Option<Tile> {
        let slot = self.slot?;
        Some(Tile {
            id: self.id,
            slot,
            standup: self.standup.unwrap_or(false),
            batch: self.batch,
            rafts: self.rafts.unwrap_or_default(),
            user_created: self.user_created,
            user_updated: self.user_updated,
        })
    }
}

/// Owning tile of a raft when the request expanded it (`tile.ref`, `tile.id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileStub {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TileId>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<TileRef>,
}

impl Identified for TileStub {
    fn record_id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

fn valid_by_default() -> bool {
    true
}

/// A measurement record: three timestamped readings with validity flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raft {
    pub id: RaftId,
    #[serde(rename = "serialNumber", default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_inflation: Option<Timestamp>,
    #[serde(rename = "inflationValid", default = "valid_by_default")]
    pub inflation_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_pressure1: Option<Timestamp>,
    #[serde(rename = "pressure1Valid", default)]
    pub pressure1_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_pressure2: Option<Timestamp>,
    #[serde(rename = "pressure2Valid", default)]
    pub pressure2_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile: Option<Related<TileStub>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_created: Option<Related<User>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_updated: Option<Related<User>>,
}

impl Identified for Raft {
    fn record_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

/// The three readings taken on a raft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    Inflation,
    Pressure1,
    Pressure2,
}

/// Borrowed view of one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement<'a> {
    pub kind: MeasurementKind,
    pub at: Option<&'a str>,
    pub valid: bool,
}

impl Raft {
    pub fn measurement(&self, kind: MeasurementKind) -> Measurement<'_> {
        let (at, valid) = match kind {
            MeasurementKind::Inflation => (&self.time_inflation, self.inflation_valid),
            MeasurementKind::Pressure1 => (&self.time_pressure1, self.pressure1_valid),
            MeasurementKind::Pressure2 => (&self.time_pressure2, self.pressure2_valid),
        };
        Measurement {
            kind,
            at: at.as_deref(),
            valid,
        }
    }

    pub fn measurements(&self) -> [Measurement<'_>; 3] {
        [
            self.measurement(MeasurementKind::Inflation),
            self.measurement(MeasurementKind::Pressure1),
            self.measurement(MeasurementKind::Pressure2),
        ]
    }

    /// Id of the owning tile, when the payload carries it.
    pub fn tile_id(&self) -> Option<&str> {
        self.tile.as_ref().and_then(Related::id)
    }

    /// Slot of the owning tile, when the payload expanded `tile.ref`.
    pub fn tile_slot(&self) -> Option<TileRef> {
        self.tile
            .as_ref()
            .and_then(Related::record)
            .and_then(|stub| stub.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tile_ref_order_matches_index() {
        for (i, slot) in TileRef::ALL.iter().enumerate() {
            assert_eq!(slot.index(), i);
        }
        assert_eq!(TileRef::D2.index(), 11);
    }

    #[test]
    fn test_tile_ref_parse() {
        assert_eq!("B-1".parse::<TileRef>().unwrap(), TileRef::B1);
        assert!("E-0".parse::<TileRef>().is_err());
        assert_eq!(TileRef::C2.to_string(), "C-2");
    }

    #[test]
    fn test_unknown_tile_ref_rejected_on_decode() {
        let result: Result<Tile, _> = serde_json::from_value(json!({"id": "t1", "ref": "Z-9"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_tiles_as_ids_or_records() {
        let batch: Batch = serde_json::from_value(json!({
            "id": "b1",
            "isCurrent": true,
            "tiles": ["t1", {"id": "t2", "ref": "A-1"}, "t1"]
        }))
        .unwrap();

        assert!(batch.is_current);
        assert_eq!(batch.tile_ids(), vec!["t1".to_string(), "t2".to_string()]);
        assert!(batch.tiles[1].record().is_some());
    }

    #[test]
    fn test_raft_tile_link_forms() {
        let by_id: Raft = serde_json::from_value(json!({"id": "r1", "tile": "t1"})).unwrap();
        assert_eq!(by_id.tile_id(), Some("t1"));
        assert_eq!(by_id.tile_slot(), None);

        let expanded: Raft =
            serde_json::from_value(json!({"id": "r2", "tile": {"ref": "D-0"}})).unwrap();
        assert_eq!(expanded.tile_id(), None);
        assert_eq!(expanded.tile_slot(), Some(TileRef::D0));
    }

    #[test]
    fn test_raft_measurements() {
        let raft: Raft = serde_json::from_value(json!({
            "id": "r1",
            "time_inflation": "2025-01-01T08:00:00Z",
            "time_pressure1": "2025-01-01T09:00:00Z",
            "pressure1Valid": true
        }))
        .unwrap();

        let [inflation, p1, p2] = raft.measurements();
        assert_eq!(inflation.at, Some("2025-01-01T08:00:00Z"));
        assert!(inflation.valid);
        assert!(p1.valid);
        assert_eq!(p2.at, None);
        assert!(!p2.valid);
    }

    #[test]
    fn test_tile_patch_keeps_absent_fields() {
        let mut tile: Tile = serde_json::from_value(json!({
            "id": "t1", "ref": "A-0", "standup": false, "batch": "b1", "rafts": ["r1"]
        }))
        .unwrap();

        let patch: TilePatch = serde_json::from_value(json!({"id": "t1", "standup": true})).unwrap();
        patch.apply_to(&mut tile);

        assert!(tile.standup);
        assert_eq!(tile.slot, TileRef::A0);
        assert_eq!(tile.raft_ids(), vec!["r1".to_string()]);
        assert_eq!(tile.batch.as_deref(), Some("b1"));
    }

    #[test]
    fn test_tile_patch_without_slot_is_not_a_tile() {
        let patch: TilePatch = serde_json::from_value(json!({"id": "t1"})).unwrap();
        assert!(patch.into_tile().is_none());
    }

    #[test]
    fn test_batch_patch_leaves_missing_flag_and_tiles_unknown() {
        let patch: BatchPatch =
            serde_json::from_value(json!({"id": "b2", "date_created": "2025-01-01T00:00:00Z"}))
                .unwrap();
        assert_eq!(patch.is_current, None);
        assert_eq!(patch.tile_ids(), None);

        let mut batch: Batch = serde_json::from_value(json!({
            "id": "b2", "isCurrent": true, "tiles": ["t1"]
        }))
        .unwrap();
        patch.apply_to(&mut batch);
        assert!(batch.is_current);
        assert_eq!(batch.tile_ids(), vec!["t1".to_string()]);
        assert_eq!(batch.date_created.as_deref(), Some("2025-01-01T00:00:00Z"));
    }
}
