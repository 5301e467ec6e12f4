//! Crate-level error type.

use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;
use crate::persist::PersistError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("No event for subscription {uid} within {timeout:?}")]
    FirstEventTimeout { uid: String, timeout: Duration },

    #[error("Not logged in")]
    NotLoggedIn,
}
