//! # raftguru-sync: live mirror of the current RaftGuru batch
//!
//! Keeps a local copy of the current batch, its twelve tile slots and their
//! rafts in step with the record server, over one WebSocket carrying many
//! JSON subscriptions. Mutations go through the HTTP record API and come
//! back as subscription events.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  subscribe / unsubscribe / pong  ┌──────────────┐
//! │  SyncEngine  │ ───────────────────────────────► │ record server│
//! │              │ ◄─────────────────────────────── │  (WebSocket) │
//! └──────┬───────┘   init / create / update / delete└──────┬───────┘
//!        │                                                 ▲
//!        ▼                                                 │ HTTP
//! ┌──────────────┐   batches:B ─► tiles:T ─► rafts:R ┌─────┴────────┐
//! │ MirrorStore  │   (cascade, one uid per item)     │   Records    │
//! │ batch + grid │                                   │ (mutations)  │
//! └──────────────┘                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Batch / Tile / Raft records and the twelve tile refs
//! - [`protocol`]: JSON frame codec
//! - [`transport`]: the shared WebSocket connection
//! - [`registry`]: uid → subscription, with subscribe/unsubscribe frames
//! - [`dispatcher`]: routes inbound frames to handlers, answers pings
//! - [`cascade`]: keeps child subscriptions in step with parent child lists
//! - [`mirror`]: the local batch + tile grid
//! - [`handlers`]: batch, tile and raft reactions
//! - [`engine`]: the context object tying it together
//! - [`api`] / [`session`]: HTTP record API and authentication
//! - [`persist`]: advisory last-batch token
//! - [`config`]: configuration with environment overrides

pub mod api;
pub mod cascade;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod mirror;
pub mod model;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use api::{ApiError, HttpRecordApi, ItemQuery, RecordApi, Records};
pub use cascade::{diff_children, CascadeLevel, CascadeResolver, ChildDiff};
pub use config::SyncConfig;
pub use dispatcher::{Dispatch, DispatchStats, Dispatcher, HandlerContext, SubscriptionHandler};
pub use engine::{SyncEngine, SyncEvent};
pub use error::SyncError;
pub use handlers::CURRENT_BATCH_UID;
pub use mirror::{ApplyOutcome, MirrorStore, RaftChange, Rejection, Slot, TileEntry};
pub use model::{Batch, BatchPatch, Raft, Related, Tile, TilePatch, TileRef, User};
pub use persist::{FileTokenStore, MemoryTokenStore, PersistError, TokenStore};
pub use protocol::{EventKind, InboundFrame, OutboundFrame, ProtocolError, Query};
pub use registry::{SubscriptionRegistry, SubscriptionScope};
pub use session::{HttpSession, SessionProvider};
pub use transport::{AttachedPeer, Connection, ConnectionState, FrameSink, TransportError};
