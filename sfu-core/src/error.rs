use thiserror::Error;

use crate::models::RoomId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("server {0} is not registered")]
    ServerNotRegistered(String),

    #[error("invalid server token for server {0}")]
    InvalidToken(String),

    #[error("server {0} already registered with a different token")]
    TokenMismatch(String),

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("room {0} is owned by another server")]
    RoomOwnedByOtherServer(RoomId),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
