// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for the NSQ distributed message queue:
//! - [`Producer`] publishes to one nsqd over a lazily dialed connection.
//! - [`Consumer`] subscribes to a topic/channel on many nsqd instances,
//!   found directly or through nsqlookupd, and paces delivery with RDY.
//!
//! Transport: TCP, NSQ protocol V2.
//! Framing: big-endian `u32` size, `u32` frame type, payload.
//! Session: magic `"  V2"`, then IDENTIFY (with optional deflate and AUTH),
//!          then SUB for consumers or PUB/MPUB/DPUB for producers.

mod command;
mod config;
mod conn;
mod consumer;
mod error;
mod lookupd;
mod message;
mod producer;
mod protocol;
mod timer;

pub use command::{Command, IdentifyRequest};
pub use config::{
    parse_duration, BackoffStrategy, Config, ConfigError, ExponentialStrategy,
    FullJitterStrategy, OptionValue,
};
pub use conn::{AuthResponse, Conn, ConnDelegate, IdentifyResponse};
pub use consumer::{Consumer, ConsumerStats, DiscoveryFilter, Handler, HandlerError};
pub use error::{Error, Result};
pub use lookupd::{query as query_lookupd, LookupResponse, PeerInfo};
pub use message::{Message, MessageDelegate, MessageId};
pub use producer::{Producer, ProducerTransaction, TransactionArgs};
pub use protocol::{
    is_valid_channel_name, is_valid_topic_name, read_response, read_unpacked_response,
    unpack_response, FrameType, MAGIC_V2, MAX_FRAME_SIZE, MSG_ID_LENGTH,
};
