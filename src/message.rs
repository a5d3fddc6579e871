// SPDX-License-Identifier: AGPL-3.0-or-later
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::protocol::{self, MSG_ID_LENGTH};

pub type MessageId = [u8; MSG_ID_LENGTH];

/// Receives the terminal and touch responses of a [`Message`].
///
/// A connection implements this for the messages it decodes.
pub trait MessageDelegate: Send + Sync {
    fn on_finish(&self, message: &Message);

    /// `delay` of `None` asks for the attempt-scaled default delay.
    fn on_requeue(&self, message: &Message, delay: Option<Duration>, backoff: bool);

    fn on_touch(&self, message: &Message);
}

#[derive(Default)]
struct ResponseState {
    responded: AtomicBool,
    auto_response_disabled: AtomicBool,
}

/// One unit of work delivered by nsqd.
///
/// Clones share their response state, so a handler may keep a clone and
/// respond later from another thread.
#[derive(Clone)]
pub struct Message {
    pub id: MessageId,
    pub body: Vec<u8>,
    /// Nanoseconds since the epoch, as stamped by nsqd.
    pub timestamp: i64,
    pub attempts: u16,
    pub max_attempts: u16,
    pub nsqd_address: String,
    delegate: Option<Arc<dyn MessageDelegate>>,
    state: Arc<ResponseState>,
}

impl Message {
    pub fn new(id: MessageId, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            body: body.into(),
            timestamp: 0,
            attempts: 0,
            max_attempts: 0,
            nsqd_address: String::new(),
            delegate: None,
            state: Arc::default(),
        }
    }

    /// Decodes `<u64 ts><u16 attempts><16-byte id><body>`.
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        let raw = protocol::decode_message(data)?;
        let mut message = Self::new(raw.id, raw.body);
        message.timestamp = raw.timestamp;
        message.attempts = raw.attempts;
        Ok(message)
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn MessageDelegate>) {
        self.delegate = Some(delegate);
    }

    /// The id as text; nsqd ids are ASCII hex.
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    /// Stops the consumer's handler loop from finishing or requeueing the
    /// message once the handler returns.
    pub fn disable_auto_response(&self) {
        self.state.auto_response_disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_auto_response_disabled(&self) -> bool {
        self.state.auto_response_disabled.load(Ordering::SeqCst)
    }

    pub fn has_responded(&self) -> bool {
        self.state.responded.load(Ordering::SeqCst)
    }

    fn mark_responded(&self) -> bool {
        self.state
            .responded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        if !self.mark_responded() {
            return;
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_finish(self);
        }
    }

    /// Resets the server-side timeout. Ignored after a terminal response.
    pub fn touch(&self) {
        if self.has_responded() {
            return;
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_touch(self);
        }
    }

    /// Requeues and signals a processing failure to the consumer's backoff.
    pub fn requeue(&self, delay: Option<Duration>) {
        self.do_requeue(delay, true);
    }

    pub fn requeue_without_backoff(&self, delay: Option<Duration>) {
        self.do_requeue(delay, false);
    }

    fn do_requeue(&self, delay: Option<Duration>, backoff: bool) {
        if !self.mark_responded() {
            return;
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_requeue(self, delay, backoff);
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id_str())
            .field("body_len", &self.body.len())
            .field("timestamp", &self.timestamp)
            .field("attempts", &self.attempts)
            .field("nsqd_address", &self.nsqd_address)
            .field("responded", &self.has_responded())
            .finish()
    }
}
