// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io;

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Publish attempted without a live connection.
    #[error("not connected")]
    NotConnected,
    /// Operation attempted after a permanent stop.
    #[error("stopped")]
    Stopped,
    /// RDY update attempted on a draining connection.
    #[error("closing")]
    Closing,
    /// RDY update would exceed the consumer's max-in-flight budget.
    #[error("over configured max-inflight")]
    OverMaxInFlight,
    #[error("already connected")]
    AlreadyConnected,
    #[error("failed to IDENTIFY - {0}")]
    Identify(String),
    #[error("auth failed - {0}")]
    Auth(String),
    /// Error frame sent back by nsqd for a command (e.g. `E_BAD_MESSAGE`).
    #[error("{0}")]
    Protocol(String),
    #[error("no handlers")]
    NoHandlers,
    #[error("handlers must be added before connecting")]
    HandlersAfterConnect,
    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),
    #[error("invalid channel name {0:?}")]
    InvalidChannel(String),
    #[error("invalid nsqlookupd address {addr:?}: {reason}")]
    InvalidLookupdAddr { addr: String, reason: String },
    #[error("cannot disconnect from only remaining nsqlookupd HTTP address {0}")]
    CannotRemoveLastLookupd(String),
    #[error("nsqlookupd query failed: {0}")]
    Lookupd(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
