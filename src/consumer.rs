// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level subscriber for one topic/channel.
//!
//! A `Consumer` owns any number of nsqd connections and loans each of them
//! a share of `max_in_flight` as RDY credit. Handler failures push the
//! whole consumer into backoff: every connection drops to RDY 0, and after
//! the backoff window a single connection gets RDY 1 to probe recovery.

use std::any::Any;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use crossbeam::sync::WaitGroup;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::command::Command;
use crate::config::Config;
use crate::conn::{is_close_wait, Conn, ConnDelegate};
use crate::error::{Error, Result};
use crate::lookupd::{self, LookupResponse, PeerInfo};
use crate::message::Message;
use crate::protocol::{is_valid_channel_name, is_valid_topic_name};
use crate::timer::Timer;

const RDY_RETRY_DELAY: Duration = Duration::from_secs(5);
const HARD_EXIT_TIMEOUT: Duration = Duration::from_secs(30);
const LOOKUPD_QUERY_ATTEMPTS: usize = 3;

pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Processes messages on the consumer's handler threads.
///
/// Returning `Ok` finishes the message and an error requeues it, unless
/// the handler called [`Message::disable_auto_response`].
pub trait Handler: Send + Sync + 'static {
    fn handle_message(&self, message: &Message) -> std::result::Result<(), HandlerError>;

    /// Called for a message that exceeded `max_attempts`, just before it is
    /// finished without reaching [`Handler::handle_message`].
    fn log_failed_message(&self, _message: &Message) {}
}

impl<F> Handler for F
where
    F: Fn(&Message) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle_message(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        self(message)
    }
}

/// Narrows the nsqd addresses returned by nsqlookupd.
pub trait DiscoveryFilter: Send + Sync {
    fn filter(&self, addrs: Vec<String>) -> Vec<String>;
}

impl<F> DiscoveryFilter for F
where
    F: Fn(Vec<String>) -> Vec<String> + Send + Sync,
{
    fn filter(&self, addrs: Vec<String>) -> Vec<String> {
        self(addrs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffSignal {
    Backoff,
    Continue,
    Resume,
}

pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    me: Weak<ConsumerInner>,
    topic: String,
    channel: String,
    prefix: String,
    config: Config,

    messages_received: AtomicU64,
    messages_finished: AtomicU64,
    messages_requeued: AtomicU64,

    total_rdy_count: AtomicI64,
    max_in_flight: AtomicI64,
    // set by the idle redistribution policy, 0 when unset
    per_conn_override: AtomicI64,
    need_rdy_redistributed: AtomicBool,

    backoff_mtx: Mutex<()>,
    backoff_counter: AtomicU32,
    // nanoseconds of the pending backoff window, 0 when none
    backoff_duration: AtomicU64,
    backoff_timer: Mutex<Option<Timer>>,

    connections: RwLock<HashMap<String, Arc<Conn>>>,
    pending_connections: RwLock<HashMap<String, Arc<Conn>>>,
    nsqd_tcp_addrs: RwLock<Vec<String>>,
    lookupd_http_addrs: RwLock<Vec<String>>,
    lookupd_query_index: AtomicUsize,
    rdy_retry_timers: Mutex<HashMap<String, Timer>>,
    discovery_filter: RwLock<Option<Arc<dyn DiscoveryFilter>>>,

    incoming_tx: Mutex<Option<Sender<Message>>>,
    incoming_rx: Receiver<Message>,
    lookupd_recheck_tx: Sender<()>,
    lookupd_recheck_rx: Receiver<()>,
    exit_tx: Mutex<Option<Sender<()>>>,
    exit_rx: Receiver<()>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    exit_timer: Mutex<Option<Timer>>,

    stop_flag: AtomicBool,
    connected_flag: AtomicBool,
    running_handlers: AtomicI32,
    stop_handler: Once,
    exit_handler: Once,
    wg: Mutex<Option<WaitGroup>>,
}

impl Consumer {
    /// Validates `config`, starts the RDY redistribution loop and returns
    /// a consumer ready for handlers. Nothing is dialed yet.
    pub fn new(topic: &str, channel: &str, config: &Config) -> Result<Self> {
        config.validate()?;
        if !is_valid_topic_name(topic) {
            return Err(Error::InvalidTopic(topic.to_string()));
        }
        if !is_valid_channel_name(channel) {
            return Err(Error::InvalidChannel(channel.to_string()));
        }

        let (incoming_tx, incoming_rx) = channel::bounded(0);
        let (lookupd_recheck_tx, lookupd_recheck_rx) = channel::bounded(1);
        let (exit_tx, exit_rx) = channel::bounded(0);
        let (stop_tx, stop_rx) = channel::bounded(0);
        let wg = WaitGroup::new();
        let rdy_wg = wg.clone();

        let inner = Arc::new_cyclic(|me| ConsumerInner {
            me: me.clone(),
            topic: topic.to_string(),
            channel: channel.to_string(),
            prefix: format!("[{}/{}]", topic, channel),
            config: config.clone(),
            messages_received: AtomicU64::new(0),
            messages_finished: AtomicU64::new(0),
            messages_requeued: AtomicU64::new(0),
            total_rdy_count: AtomicI64::new(0),
            max_in_flight: AtomicI64::new(config.max_in_flight),
            per_conn_override: AtomicI64::new(0),
            need_rdy_redistributed: AtomicBool::new(false),
            backoff_mtx: Mutex::new(()),
            backoff_counter: AtomicU32::new(0),
            backoff_duration: AtomicU64::new(0),
            backoff_timer: Mutex::new(None),
            connections: RwLock::new(HashMap::new()),
            pending_connections: RwLock::new(HashMap::new()),
            nsqd_tcp_addrs: RwLock::new(Vec::new()),
            lookupd_http_addrs: RwLock::new(Vec::new()),
            lookupd_query_index: AtomicUsize::new(0),
            rdy_retry_timers: Mutex::new(HashMap::new()),
            discovery_filter: RwLock::new(None),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx,
            lookupd_recheck_tx,
            lookupd_recheck_rx,
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            exit_timer: Mutex::new(None),
            stop_flag: AtomicBool::new(false),
            connected_flag: AtomicBool::new(false),
            running_handlers: AtomicI32::new(0),
            stop_handler: Once::new(),
            exit_handler: Once::new(),
            wg: Mutex::new(Some(wg)),
        });

        let rdy_inner = inner.clone();
        thread::spawn(move || {
            rdy_inner.rdy_loop();
            drop(rdy_wg);
        });

        Ok(Self { inner })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            messages_received: self.inner.messages_received.load(Ordering::SeqCst),
            messages_finished: self.inner.messages_finished.load(Ordering::SeqCst),
            messages_requeued: self.inner.messages_requeued.load(Ordering::SeqCst),
            connections: self.inner.connections.read().len(),
        }
    }

    pub fn set_discovery_filter<F: DiscoveryFilter + 'static>(&self, filter: F) {
        *self.inner.discovery_filter.write() = Some(Arc::new(filter));
    }

    /// Adds one handler thread. Must be called before connecting.
    pub fn add_handler<H: Handler>(&self, handler: H) -> Result<()> {
        self.add_concurrent_handlers(handler, 1)
    }

    /// Adds `concurrency` threads sharing one handler.
    pub fn add_concurrent_handlers<H: Handler>(&self, handler: H, concurrency: usize) -> Result<()> {
        self.inner.add_concurrent_handlers(Arc::new(handler), concurrency)
    }

    pub fn connect_to_nsqd(&self, addr: &str) -> Result<()> {
        self.inner.connect_to_nsqd(addr)
    }

    /// Connects to each address in turn, stopping at the first failure.
    pub fn connect_to_nsqds<S: AsRef<str>>(&self, addrs: &[S]) -> Result<()> {
        for addr in addrs {
            self.connect_to_nsqd(addr.as_ref())?;
        }
        Ok(())
    }

    /// Adds an nsqlookupd to poll for producers of this topic. The first
    /// one triggers an immediate query and starts the poll loop.
    pub fn connect_to_nsqlookupd(&self, addr: &str) -> Result<()> {
        self.inner.connect_to_nsqlookupd(addr)
    }

    pub fn connect_to_nsqlookupds<S: AsRef<str>>(&self, addrs: &[S]) -> Result<()> {
        for addr in addrs {
            self.connect_to_nsqlookupd(addr.as_ref())?;
        }
        Ok(())
    }

    /// Closes the connection to `addr` and stops reconnecting to it.
    pub fn disconnect_from_nsqd(&self, addr: &str) -> Result<()> {
        self.inner.disconnect_from_nsqd(addr)
    }

    pub fn disconnect_from_nsqlookupd(&self, addr: &str) -> Result<()> {
        self.inner.disconnect_from_nsqlookupd(addr)
    }

    /// Changes the in-flight budget and rebalances RDY unless backing off.
    pub fn change_max_in_flight(&self, max_in_flight: i64) {
        self.inner.change_max_in_flight(max_in_flight)
    }

    /// True when some connection has nearly exhausted its granted RDY,
    /// i.e. the handlers are the bottleneck.
    pub fn is_starved(&self) -> bool {
        self.inner.conns().iter().any(|conn| {
            let threshold = (conn.last_rdy() as f64 * 0.85) as i64;
            let in_flight = conn.in_flight();
            in_flight >= threshold && in_flight > 0 && !conn.is_closing()
        })
    }

    /// Starts a graceful shutdown and returns immediately.
    pub fn stop_async(&self) {
        self.inner.stop_async()
    }

    /// Stops and waits until [`Consumer::stopped`] fires. Must not be
    /// called from a handler.
    pub fn stop(&self) {
        self.stop_async();
        let _ = self.inner.stop_rx.recv();
    }

    /// Disconnects once the consumer has fully stopped.
    pub fn stopped(&self) -> Receiver<()> {
        self.inner.stop_rx.clone()
    }
}

impl ConsumerInner {
    fn conns(&self) -> Vec<Arc<Conn>> {
        self.connections.read().values().cloned().collect()
    }

    fn max_in_flight(&self) -> i64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn per_conn_max_in_flight(&self) -> i64 {
        let max = self.max_in_flight();
        let overridden = self.per_conn_override.load(Ordering::SeqCst);
        if overridden > 0 {
            return overridden.min(max);
        }

        let conns = self.connections.read().len() as i64;
        if conns == 0 {
            return max;
        }
        (max / conns).max(1).min(max)
    }

    fn in_backoff(&self) -> bool {
        self.backoff_counter.load(Ordering::SeqCst) > 0
    }

    fn in_backoff_timeout(&self) -> bool {
        self.backoff_duration.load(Ordering::SeqCst) > 0
    }

    fn add_concurrent_handlers(&self, handler: Arc<dyn Handler>, concurrency: usize) -> Result<()> {
        if self.connected_flag.load(Ordering::SeqCst) {
            return Err(Error::HandlersAfterConnect);
        }
        let inner = self.me.upgrade().ok_or(Error::Stopped)?;

        self.running_handlers.fetch_add(concurrency as i32, Ordering::SeqCst);
        for _ in 0..concurrency {
            let inner = inner.clone();
            let handler = handler.clone();
            let incoming = self.incoming_rx.clone();
            thread::spawn(move || inner.handler_loop(handler.as_ref(), incoming));
        }
        Ok(())
    }

    fn connect_to_nsqd(&self, addr: &str) -> Result<()> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if self.running_handlers.load(Ordering::SeqCst) == 0 {
            return Err(Error::NoHandlers);
        }
        self.connected_flag.store(true, Ordering::SeqCst);

        let delegate = Arc::new(ConsumerConnDelegate {
            consumer: self.me.clone(),
        });
        let conn = Conn::new(addr, &self.config, delegate);
        {
            let mut pending = self.pending_connections.write();
            if pending.contains_key(addr) || self.connections.read().contains_key(addr) {
                return Err(Error::AlreadyConnected);
            }
            pending.insert(addr.to_string(), conn.clone());
        }
        {
            let mut nsqd_addrs = self.nsqd_tcp_addrs.write();
            if !nsqd_addrs.iter().any(|a| a == addr) {
                nsqd_addrs.push(addr.to_string());
            }
        }

        info!("{} ({}) connecting to nsqd", self.prefix, addr);

        let cleanup = || {
            self.pending_connections.write().remove(addr);
            conn.close();
        };

        let resp = match conn.connect() {
            Ok(resp) => resp,
            Err(e) => {
                cleanup();
                return Err(e);
            }
        };

        if let Some(resp) = &resp {
            if resp.max_rdy_count < self.max_in_flight() {
                warn!(
                    "{} ({}) max RDY count {} < consumer max in flight {}, truncation possible",
                    self.prefix, addr, resp.max_rdy_count, self.max_in_flight()
                );
            }
        }

        if let Err(e) = conn.write_command(&Command::subscribe(&self.topic, &self.channel)) {
            cleanup();
            return Err(Error::Io(e));
        }

        {
            let mut pending = self.pending_connections.write();
            pending.remove(addr);
            self.connections.write().insert(addr.to_string(), conn);
        }
        self.per_conn_override.store(0, Ordering::SeqCst);

        // new connections lower everyone's share
        for conn in self.conns() {
            self.maybe_update_rdy(&conn);
        }
        Ok(())
    }

    fn connect_to_nsqlookupd(&self, addr: &str) -> Result<()> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if self.running_handlers.load(Ordering::SeqCst) == 0 {
            return Err(Error::NoHandlers);
        }
        lookupd::validate_addr(addr)?;
        self.connected_flag.store(true, Ordering::SeqCst);

        let num_lookupd = {
            let mut addrs = self.lookupd_http_addrs.write();
            if addrs.iter().any(|a| a == addr) {
                return Ok(());
            }
            addrs.push(addr.to_string());
            addrs.len()
        };
        info!("{} added nsqlookupd {}", self.prefix, addr);

        if num_lookupd == 1 {
            self.query_lookupd();

            let Some(wg) = self.wg.lock().as_ref().map(WaitGroup::clone) else {
                return Ok(());
            };
            let inner = self.me.upgrade().ok_or(Error::Stopped)?;
            thread::spawn(move || {
                inner.lookupd_loop();
                drop(wg);
            });
        }
        Ok(())
    }

    fn disconnect_from_nsqd(&self, addr: &str) -> Result<()> {
        {
            let mut addrs = self.nsqd_tcp_addrs.write();
            let idx = addrs
                .iter()
                .position(|a| a == addr)
                .ok_or(Error::NotConnected)?;
            addrs.remove(idx);
        }

        let live = self.connections.read().get(addr).cloned();
        let conn = match live {
            Some(conn) => Some(conn),
            None => self.pending_connections.read().get(addr).cloned(),
        };
        if let Some(conn) = conn {
            conn.close();
        }
        Ok(())
    }

    fn disconnect_from_nsqlookupd(&self, addr: &str) -> Result<()> {
        let mut addrs = self.lookupd_http_addrs.write();
        let idx = addrs
            .iter()
            .position(|a| a == addr)
            .ok_or(Error::NotConnected)?;
        if addrs.len() == 1 {
            return Err(Error::CannotRemoveLastLookupd(addr.to_string()));
        }
        addrs.remove(idx);
        Ok(())
    }

    fn change_max_in_flight(&self, max_in_flight: i64) {
        if self.max_in_flight() == max_in_flight {
            return;
        }
        self.max_in_flight.store(max_in_flight, Ordering::SeqCst);

        if self.in_backoff() {
            return;
        }
        for conn in self.conns() {
            self.maybe_update_rdy(&conn);
        }
    }

    fn lookupd_loop(&self) {
        // spread restarts of many consumers across the poll interval
        let jitter = self
            .config
            .lookupd_poll_interval
            .mul_f64(rand::random::<f64>() * self.config.lookupd_poll_jitter);

        select! {
            recv(self.exit_rx) -> _ => {
                info!("{} exiting lookupdLoop", self.prefix);
                return;
            }
            recv(channel::after(jitter)) -> _ => {}
        }

        let ticker = channel::tick(self.config.lookupd_poll_interval);
        loop {
            select! {
                recv(ticker) -> _ => self.query_lookupd(),
                recv(self.lookupd_recheck_rx) -> _ => self.query_lookupd(),
                recv(self.exit_rx) -> _ => break,
            }
        }
        info!("{} exiting lookupdLoop", self.prefix);
    }

    fn next_lookupd_endpoint(&self) -> Option<String> {
        let addrs = self.lookupd_http_addrs.read();
        if addrs.is_empty() {
            return None;
        }
        let idx = self.lookupd_query_index.fetch_add(1, Ordering::SeqCst) % addrs.len();
        Some(addrs[idx].clone())
    }

    fn query_lookupd(&self) {
        for attempt in 1..=LOOKUPD_QUERY_ATTEMPTS {
            let Some(endpoint) = self.next_lookupd_endpoint() else {
                return;
            };
            info!("{} querying nsqlookupd {}", self.prefix, endpoint);

            match lookupd::query(&endpoint, &self.topic, self.config.lookupd_poll_timeout) {
                Ok(resp) => {
                    self.connect_discovered(resp);
                    return;
                }
                Err(e) => {
                    error!("{} error querying nsqlookupd ({}) - {}", self.prefix, endpoint, e);
                    if attempt < LOOKUPD_QUERY_ATTEMPTS {
                        info!("{} retrying with next nsqlookupd", self.prefix);
                    }
                }
            }
        }
    }

    fn connect_discovered(&self, resp: LookupResponse) {
        let mut addrs: Vec<String> = resp.producers.iter().map(PeerInfo::tcp_addr).collect();
        let filter = self.discovery_filter.read().clone();
        if let Some(filter) = filter {
            addrs = filter.filter(addrs);
        }

        for addr in addrs {
            match self.connect_to_nsqd(&addr) {
                Ok(()) | Err(Error::AlreadyConnected) => {}
                Err(e) => error!("{} ({}) error connecting to nsqd - {}", self.prefix, addr, e),
            }
        }
    }

    fn on_conn_message(&self, conn: &Conn, message: Message) {
        self.total_rdy_count.fetch_sub(1, Ordering::SeqCst);
        self.messages_received.fetch_add(1, Ordering::SeqCst);

        let incoming = self.incoming_tx.lock().clone();
        let undelivered = match incoming {
            Some(tx) => tx.send(message).err().map(|e| e.into_inner()),
            None => Some(message),
        };
        if let Some(message) = undelivered {
            warn!(
                "{} ({}) handlers stopped, requeueing msg {}",
                self.prefix, conn, message.id_str()
            );
            message.requeue_without_backoff(None);
        }

        self.maybe_update_rdy(conn);
    }

    fn maybe_update_rdy(&self, conn: &Conn) {
        let in_backoff = self.in_backoff();
        let in_backoff_timeout = self.in_backoff_timeout();
        if in_backoff || in_backoff_timeout {
            debug!(
                "{} ({}) skip sending RDY in_backoff:{} || in_backoff_timeout:{}",
                self.prefix, conn, in_backoff, in_backoff_timeout
            );
            return;
        }

        let remain = conn.rdy();
        let last_rdy = conn.last_rdy();
        let count = self.per_conn_max_in_flight();

        // refill at 1, at 25%, or when the share shrank below what is left
        if remain <= 1 || remain < last_rdy / 4 || (count > 0 && count < remain) {
            debug!(
                "{} ({}) sending RDY {} ({} remain from last RDY {})",
                self.prefix, conn, count, remain, last_rdy
            );
            self.update_rdy_or_warn(conn, count);
        } else {
            debug!(
                "{} ({}) skip sending RDY {} ({} remain out of last RDY {})",
                self.prefix, conn, count, remain, last_rdy
            );
        }
    }

    fn update_rdy_or_warn(&self, conn: &Conn, count: i64) {
        if let Err(e) = self.update_rdy(conn, count) {
            warn!("{} ({}) error updating RDY {} - {}", self.prefix, conn, count, e);
        }
    }

    fn update_rdy(&self, conn: &Conn, count: i64) -> Result<()> {
        if conn.is_closing() {
            return Err(Error::Closing);
        }

        let mut count = count.min(conn.max_rdy());

        // a fresh update supersedes any scheduled retry
        self.rdy_retry_timers.lock().remove(conn.addr());

        let rdy = conn.rdy();
        let max_possible_rdy = self.max_in_flight() - self.total_rdy_count.load(Ordering::SeqCst) + rdy;
        if max_possible_rdy > 0 && max_possible_rdy < count {
            count = max_possible_rdy;
        }
        if max_possible_rdy <= 0 && count > 0 {
            if rdy == 0 {
                // retry later so a starved connection does not stay at zero
                let consumer = self.me.clone();
                let addr = conn.addr().to_string();
                let timer = Timer::after(RDY_RETRY_DELAY, move || {
                    if let Some(inner) = consumer.upgrade() {
                        inner.retry_rdy(&addr, count);
                    }
                });
                self.rdy_retry_timers.lock().insert(conn.addr().to_string(), timer);
            }
            return Err(Error::OverMaxInFlight);
        }

        self.send_rdy(conn, count)
    }

    fn retry_rdy(&self, addr: &str, count: i64) {
        let conn = self.connections.read().get(addr).cloned();
        match conn {
            Some(conn) => self.update_rdy_or_warn(&conn, count),
            None => {
                self.rdy_retry_timers.lock().remove(addr);
            }
        }
    }

    fn send_rdy(&self, conn: &Conn, count: i64) -> Result<()> {
        if count == 0 && conn.last_rdy() == 0 {
            return Ok(());
        }

        let previous = conn.set_rdy(count);
        self.total_rdy_count.fetch_add(count - previous, Ordering::SeqCst);
        if let Err(e) = conn.write_command(&Command::ready(count)) {
            error!("{} ({}) error sending RDY {} - {}", self.prefix, conn, count, e);
            return Err(e.into());
        }
        Ok(())
    }

    fn start_stop_continue_backoff(&self, signal: BackoffSignal) {
        // one adjustment per backoff window
        let _guard = self.backoff_mtx.lock();
        if self.in_backoff_timeout() {
            return;
        }

        let mut counter = self.backoff_counter.load(Ordering::SeqCst);
        let mut updated = false;
        match signal {
            BackoffSignal::Resume | BackoffSignal::Continue => {
                if counter > 0 {
                    counter -= 1;
                    updated = true;
                }
            }
            BackoffSignal::Backoff => {
                let next = self.config.backoff_duration(counter + 1);
                if next <= self.config.max_backoff_duration {
                    counter += 1;
                    updated = true;
                }
            }
        }
        self.backoff_counter.store(counter, Ordering::SeqCst);

        if counter == 0 && updated {
            let count = self.per_conn_max_in_flight();
            warn!("{} exiting backoff, returning all to RDY {}", self.prefix, count);
            for conn in self.conns() {
                self.update_rdy_or_warn(&conn, count);
            }
        } else if counter > 0 {
            let duration = self
                .config
                .backoff_duration(counter)
                .min(self.config.max_backoff_duration);
            warn!(
                "{} backing off for {:?} (backoff level {}), setting all to RDY 0",
                self.prefix, duration, counter
            );
            for conn in self.conns() {
                self.update_rdy_or_warn(&conn, 0);
            }
            self.backoff(duration);
        }
    }

    fn backoff(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.backoff_duration.store(nanos, Ordering::SeqCst);

        let consumer = self.me.clone();
        let timer = Timer::after(duration, move || {
            if let Some(inner) = consumer.upgrade() {
                inner.resume();
            }
        });
        *self.backoff_timer.lock() = Some(timer);
    }

    fn resume(&self) {
        self.backoff_timer.lock().take();

        if self.stop_flag.load(Ordering::SeqCst) {
            self.backoff_duration.store(0, Ordering::SeqCst);
            return;
        }

        let conns = self.conns();
        if conns.is_empty() {
            warn!("{} no connection available to resume, backing off for 1s", self.prefix);
            self.backoff(Duration::from_secs(1));
            return;
        }

        // probe with a single message before resuming full throughput
        let choice = &conns[rand::random_range(0..conns.len())];
        warn!("{} ({}) backoff timeout expired, sending RDY 1", self.prefix, choice);
        if let Err(e) = self.update_rdy(choice, 1) {
            warn!("{} ({}) error resuming RDY 1 - {}, backing off for 1s", self.prefix, choice, e);
            self.backoff(Duration::from_secs(1));
            return;
        }
        self.backoff_duration.store(0, Ordering::SeqCst);
    }

    fn rdy_loop(&self) {
        let ticker = channel::tick(self.config.rdy_redistribute_interval);
        loop {
            select! {
                recv(ticker) -> _ => self.redistribute_rdy(),
                recv(self.exit_rx) -> _ => break,
            }
        }
        info!("{} rdyLoop exiting", self.prefix);
    }

    fn is_idle(&self, conn: &Conn) -> bool {
        conn.last_message_time().elapsed() > self.config.low_rdy_idle_timeout
    }

    fn redistribute_rdy(&self) {
        if self.in_backoff_timeout() {
            return;
        }

        let conns = self.conns();
        if conns.is_empty() {
            return;
        }

        let max_in_flight = self.max_in_flight();
        if conns.len() as i64 > max_in_flight {
            debug!(
                "{} redistributing RDY state ({} conns > {} max_in_flight)",
                self.prefix, conns.len(), max_in_flight
            );
            self.need_rdy_redistributed.store(true, Ordering::SeqCst);
        }
        if self.in_backoff() && conns.len() > 1 {
            debug!(
                "{} redistributing RDY state (in backoff and {} conns > 1)",
                self.prefix, conns.len()
            );
            self.need_rdy_redistributed.store(true, Ordering::SeqCst);
        }

        let on_idle = self.config.rdy_redistribute_on_idle && !self.in_backoff();
        if on_idle && conns.len() > 1 {
            let unbalanced = conns.iter().any(|c| {
                let idle = self.is_idle(c);
                (idle && c.rdy() > 0) || (!idle && c.rdy() == 0)
            });
            if unbalanced {
                self.need_rdy_redistributed.store(true, Ordering::SeqCst);
            }
        }

        if self
            .need_rdy_redistributed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let (active, idle): (Vec<_>, Vec<_>) = conns.into_iter().partition(|c| !self.is_idle(c));
        if on_idle && !active.is_empty() {
            self.redistribute_to_active(active, idle, max_in_flight);
            return;
        }
        self.per_conn_override.store(0, Ordering::SeqCst);

        for conn in &idle {
            if conn.rdy() > 0 {
                debug!("{} ({}) idle connection, giving up RDY", self.prefix, conn);
                self.update_rdy_or_warn(conn, 0);
            }
        }

        let mut possible: Vec<_> = active.into_iter().chain(idle).collect();
        let mut available = if self.in_backoff() {
            1 - self.total_rdy_count.load(Ordering::SeqCst)
        } else {
            max_in_flight - self.total_rdy_count.load(Ordering::SeqCst)
        };
        while !possible.is_empty() && available > 0 {
            available -= 1;
            let conn = possible.swap_remove(rand::random_range(0..possible.len()));
            debug!("{} ({}) redistributing RDY", self.prefix, conn);
            self.update_rdy_or_warn(&conn, 1);
        }
    }

    /// Splits the budget evenly over connections that received a message
    /// recently; leftovers go one unit at a time to random idle ones.
    fn redistribute_to_active(&self, mut active: Vec<Arc<Conn>>, mut idle: Vec<Arc<Conn>>, max_in_flight: i64) {
        let share = (max_in_flight / active.len() as i64).max(1);
        self.per_conn_override.store(share, Ordering::SeqCst);
        debug!(
            "{} redistributing RDY {} over {} active connections ({} idle)",
            self.prefix, share, active.len(), idle.len()
        );

        for conn in &idle {
            if conn.rdy() > 0 {
                self.update_rdy_or_warn(conn, 0);
            }
        }

        // shrink before growing, otherwise credit still held by a later
        // connection truncates an earlier one
        active.sort_by_key(|c| std::cmp::Reverse(c.rdy()));
        for conn in active.iter().filter(|c| c.rdy() > share) {
            self.update_rdy_or_warn(conn, share);
        }
        for conn in active.iter().filter(|c| c.rdy() < share) {
            self.update_rdy_or_warn(conn, share);
        }

        let mut available = max_in_flight - self.total_rdy_count.load(Ordering::SeqCst);
        while !idle.is_empty() && available > 0 {
            available -= 1;
            let conn = idle.swap_remove(rand::random_range(0..idle.len()));
            self.update_rdy_or_warn(&conn, 1);
        }
    }

    fn on_conn_close(&self, conn: &Conn) {
        let rdy = conn.rdy();
        self.total_rdy_count.fetch_sub(rdy, Ordering::SeqCst);

        let had_retry_timer = self.rdy_retry_timers.lock().remove(conn.addr()).is_some();

        let left = {
            let mut conns = self.connections.write();
            // a reconnect may already own the address
            let same = conns
                .get(conn.addr())
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn));
            if same {
                conns.remove(conn.addr());
            }
            conns.len()
        };
        self.per_conn_override.store(0, Ordering::SeqCst);
        warn!("{} ({}) connection closed, {} connections left alive", self.prefix, conn, left);

        if (had_retry_timer || rdy > 0) && (left as i64 == self.max_in_flight() || self.in_backoff()) {
            // move the freed credit to a surviving connection
            self.need_rdy_redistributed.store(true, Ordering::SeqCst);
        }

        if self.stop_flag.load(Ordering::SeqCst) {
            if left == 0 {
                self.stop_handlers();
            }
            return;
        }

        let num_lookupd = self.lookupd_http_addrs.read().len();
        let reconnect = self.nsqd_tcp_addrs.read().iter().any(|a| a == conn.addr());
        if num_lookupd > 0 {
            let _ = self.lookupd_recheck_tx.try_send(());
        } else if reconnect {
            self.spawn_reconnect(conn.addr().to_string());
        }
    }

    fn spawn_reconnect(&self, addr: String) {
        let consumer = self.me.clone();
        let exit = self.exit_rx.clone();
        let interval = self.config.lookupd_poll_interval;
        let prefix = self.prefix.clone();

        thread::spawn(move || loop {
            info!("{} ({}) re-connecting in {:?}", prefix, addr, interval);
            select! {
                recv(exit) -> _ => return,
                recv(channel::after(interval)) -> _ => {}
            }

            let Some(inner) = consumer.upgrade() else { return };
            if inner.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            if !inner.nsqd_tcp_addrs.read().iter().any(|a| *a == addr) {
                warn!("{} ({}) skipped reconnect after removal", prefix, addr);
                return;
            }
            match inner.connect_to_nsqd(&addr) {
                Ok(()) | Err(Error::AlreadyConnected) => return,
                Err(e) => error!("{} ({}) error connecting to nsqd - {}", prefix, addr, e),
            }
        });
    }

    fn handler_loop(&self, handler: &dyn Handler, incoming: Receiver<Message>) {
        debug!("{} starting Handler", self.prefix);
        for message in incoming.iter() {
            self.handle_message(handler, message);
        }
        debug!("{} stopping Handler", self.prefix);

        if self.running_handlers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.exit();
        }
    }

    fn handle_message(&self, handler: &dyn Handler, message: Message) {
        if self.should_fail_message(handler, &message) {
            message.finish();
            return;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_message(&message)))
            .unwrap_or_else(|payload| Err(panic_message(payload).into()));

        match result {
            Ok(()) => {
                if !message.is_auto_response_disabled() {
                    message.finish();
                }
            }
            Err(e) => {
                error!(
                    "{} Handler returned error ({}) for msg {}",
                    self.prefix, e, message.id_str()
                );
                if !message.is_auto_response_disabled() {
                    message.requeue(None);
                }
            }
        }
    }

    fn should_fail_message(&self, handler: &dyn Handler, message: &Message) -> bool {
        if message.max_attempts > 0 && message.attempts > message.max_attempts {
            warn!(
                "{} msg {} attempted {} times, giving up",
                self.prefix, message.id_str(), message.attempts
            );
            handler.log_failed_message(message);
            return true;
        }
        false
    }

    fn stop_async(&self) {
        if self
            .stop_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        info!("{} stopping...", self.prefix);

        let conns = self.conns();
        if conns.is_empty() {
            self.stop_handlers();
            return;
        }

        for conn in conns {
            if let Err(e) = conn.write_command(&Command::start_close()) {
                error!("{} ({}) error sending CLS - {}", self.prefix, conn, e);
            }
        }

        // handlers may be stuck mid-message; exit regardless after a while
        let consumer = self.me.clone();
        let timer = Timer::after(HARD_EXIT_TIMEOUT, move || {
            if let Some(inner) = consumer.upgrade() {
                inner.exit();
            }
        });
        *self.exit_timer.lock() = Some(timer);
    }

    fn stop_handlers(&self) {
        self.stop_handler.call_once(|| {
            info!("{} stopping handlers", self.prefix);
            self.incoming_tx.lock().take();
            if self.running_handlers.load(Ordering::SeqCst) == 0 {
                self.exit();
            }
        });
    }

    fn exit(&self) {
        self.exit_handler.call_once(|| {
            self.exit_timer.lock().take();
            self.exit_tx.lock().take();
            let wg = self.wg.lock().take();
            if let Some(wg) = wg {
                wg.wait();
            }
            self.stop_tx.lock().take();
            info!("{} stopped", self.prefix);
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

struct ConsumerConnDelegate {
    consumer: Weak<ConsumerInner>,
}

impl ConsumerConnDelegate {
    fn with_consumer(&self, f: impl FnOnce(&ConsumerInner)) {
        if let Some(inner) = self.consumer.upgrade() {
            f(&inner);
        }
    }
}

impl ConnDelegate for ConsumerConnDelegate {
    fn on_response(&self, conn: &Conn, data: &[u8]) {
        if is_close_wait(data) {
            info!("({}) received CLOSE_WAIT from nsqd", conn);
            conn.close();
        }
    }

    fn on_message(&self, conn: &Conn, message: Message) {
        match self.consumer.upgrade() {
            Some(inner) => inner.on_conn_message(conn, message),
            None => message.requeue_without_backoff(None),
        }
    }

    fn on_message_finished(&self, _conn: &Conn, _message: &Message) {
        self.with_consumer(|c| {
            c.messages_finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    fn on_message_requeued(&self, _conn: &Conn, _message: &Message) {
        self.with_consumer(|c| {
            c.messages_requeued.fetch_add(1, Ordering::SeqCst);
        });
    }

    fn on_backoff(&self, _conn: &Conn) {
        self.with_consumer(|c| c.start_stop_continue_backoff(BackoffSignal::Backoff));
    }

    fn on_continue(&self, _conn: &Conn) {
        self.with_consumer(|c| c.start_stop_continue_backoff(BackoffSignal::Continue));
    }

    fn on_resume(&self, _conn: &Conn) {
        self.with_consumer(|c| c.start_stop_continue_backoff(BackoffSignal::Resume));
    }

    fn on_io_error(&self, conn: &Conn, _err: &std::io::Error) {
        conn.close();
    }

    fn on_close(&self, conn: &Conn) {
        self.with_consumer(|c| c.on_conn_close(conn));
    }
}
