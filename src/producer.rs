// SPDX-License-Identifier: AGPL-3.0-or-later
//! Publisher bound to a single nsqd.
//!
//! The connection is dialed lazily by the first publish and re-dialed
//! after it drops. A router thread serializes every command onto the
//! socket and matches responses to pending publishes in FIFO order, since
//! nsqd answers commands in the order it receives them.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::command::Command;
use crate::config::Config;
use crate::conn::{Conn, ConnDelegate};
use crate::error::{Error, Result};
use crate::protocol::{is_valid_topic_name, FrameType};

const STATE_INIT: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

const CLEANUP_SPIN: Duration = Duration::from_millis(5);

pub type TransactionArgs = Box<dyn Any + Send>;

/// Outcome of an asynchronous publish, sent on the caller's channel with
/// the caller's `args` handed back untouched.
pub struct ProducerTransaction {
    pub error: Option<Error>,
    pub args: Option<TransactionArgs>,
}

impl fmt::Debug for ProducerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerTransaction")
            .field("error", &self.error)
            .field("has_args", &self.args.is_some())
            .finish()
    }
}

struct Transaction {
    cmd: Command,
    done: Sender<ProducerTransaction>,
    args: Option<TransactionArgs>,
}

impl Transaction {
    fn finish(self, error: Option<Error>) {
        let _ = self.done.send(ProducerTransaction {
            error,
            args: self.args,
        });
    }
}

/// Counts publish calls in progress so router cleanup can wait them out.
struct PublishGuard<'a> {
    count: &'a AtomicI32,
}

impl<'a> PublishGuard<'a> {
    fn new(count: &'a AtomicI32) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    me: Weak<ProducerInner>,
    addr: String,
    config: Config,

    conn: Mutex<Option<Arc<Conn>>>,
    state: AtomicU8,
    stop_flag: AtomicBool,
    concurrent_producers: AtomicI32,
    // serializes connect, close and stop
    guard: Mutex<()>,

    transaction_tx: Sender<Transaction>,
    transaction_rx: Receiver<Transaction>,
    response_tx: Sender<Vec<u8>>,
    response_rx: Receiver<Vec<u8>>,
    error_tx: Sender<Vec<u8>>,
    error_rx: Receiver<Vec<u8>>,
    close_tx: Mutex<Option<Sender<()>>>,
    exit_tx: Mutex<Option<Sender<()>>>,
    exit_rx: Receiver<()>,
    // disconnects when the current router exits
    router_done: Mutex<Option<Receiver<()>>>,
}

impl Producer {
    /// Validates `config`. No connection is made until the first publish
    /// or [`Producer::ping`].
    pub fn new(addr: &str, config: &Config) -> Result<Self> {
        config.validate()?;

        let (transaction_tx, transaction_rx) = channel::bounded(0);
        let (response_tx, response_rx) = channel::bounded(0);
        let (error_tx, error_rx) = channel::bounded(0);
        let (exit_tx, exit_rx) = channel::bounded(0);

        let inner = Arc::new_cyclic(|me| ProducerInner {
            me: me.clone(),
            addr: addr.to_string(),
            config: config.clone(),
            conn: Mutex::new(None),
            state: AtomicU8::new(STATE_INIT),
            stop_flag: AtomicBool::new(false),
            concurrent_producers: AtomicI32::new(0),
            guard: Mutex::new(()),
            transaction_tx,
            transaction_rx,
            response_tx,
            response_rx,
            error_tx,
            error_rx,
            close_tx: Mutex::new(None),
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_rx,
            router_done: Mutex::new(None),
        });
        Ok(Self { inner })
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Connects if needed and sends a NOP to check the connection.
    pub fn ping(&self) -> Result<()> {
        self.inner.ensure_connected()?;
        let conn = self.inner.conn.lock().clone().ok_or(Error::NotConnected)?;
        conn.write_command(&Command::nop())?;
        Ok(())
    }

    /// Publishes and waits for nsqd's acknowledgement.
    pub fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
        self.inner.send_command(Command::publish(topic, body), topic)
    }

    pub fn multi_publish<B: AsRef<[u8]>>(&self, topic: &str, bodies: &[B]) -> Result<()> {
        self.inner.send_command(Command::multi_publish(topic, bodies)?, topic)
    }

    /// Publishes a message nsqd holds back for `delay`.
    pub fn deferred_publish(&self, topic: &str, delay: Duration, body: &[u8]) -> Result<()> {
        self.inner
            .send_command(Command::deferred_publish(topic, delay, body), topic)
    }

    /// Queues a publish; the outcome arrives on `done`. The router blocks
    /// until `done` accepts the result, so give it capacity or drain it.
    pub fn publish_async(
                &self,
                topic: &str,
                body: &[u8],
                done: Sender<ProducerTransaction>,
                args: Option<TransactionArgs>
            ) -> Result<()> {
        self.inner
            .send_command_async(Command::publish(topic, body), topic, done, args)
    }

    pub fn multi_publish_async<B: AsRef<[u8]>>(
                &self,
                topic: &str,
                bodies: &[B],
                done: Sender<ProducerTransaction>,
                args: Option<TransactionArgs>
            ) -> Result<()> {
        let cmd = Command::multi_publish(topic, bodies)?;
        self.inner.send_command_async(cmd, topic, done, args)
    }

    pub fn deferred_publish_async(
                &self,
                topic: &str,
                delay: Duration,
                body: &[u8],
                done: Sender<ProducerTransaction>,
                args: Option<TransactionArgs>
            ) -> Result<()> {
        let cmd = Command::deferred_publish(topic, delay, body);
        self.inner.send_command_async(cmd, topic, done, args)
    }

    /// Closes the connection and waits for the router to fail every
    /// outstanding publish with [`Error::NotConnected`].
    pub fn stop(&self) {
        self.inner.stop()
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.addr)
    }
}

impl ProducerInner {
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state() != STATE_CONNECTED {
            self.connect()?;
        }
        Ok(())
    }

    fn send_command(&self, cmd: Command, topic: &str) -> Result<()> {
        let (done_tx, done_rx) = channel::bounded(1);
        self.send_command_async(cmd, topic, done_tx, None)?;

        let transaction = done_rx.recv().map_err(|_| Error::NotConnected)?;
        match transaction.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn send_command_async(
                &self,
                cmd: Command,
                topic: &str,
                done: Sender<ProducerTransaction>,
                args: Option<TransactionArgs>
            ) -> Result<()> {
        if !is_valid_topic_name(topic) {
            return Err(Error::InvalidTopic(topic.to_string()));
        }

        let _publishing = PublishGuard::new(&self.concurrent_producers);
        self.ensure_connected()?;

        let transaction = Transaction { cmd, done, args };
        select! {
            send(self.transaction_tx, transaction) -> res => {
                res.map_err(|_| Error::NotConnected)
            }
            recv(self.exit_rx) -> _ => Err(Error::Stopped),
        }
    }

    fn connect(&self) -> Result<()> {
        let _guard = self.guard.lock();

        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        match self.state() {
            STATE_INIT => {}
            STATE_CONNECTED => return Ok(()),
            _ => return Err(Error::NotConnected),
        }

        info!("({}) connecting to nsqd", self.addr);

        let (close_tx, close_rx) = channel::bounded::<()>(0);
        let delegate = Arc::new(ProducerConnDelegate {
            producer: self.me.clone(),
            closed: close_rx.clone(),
        });
        let conn = Conn::new(&self.addr, &self.config, delegate);
        *self.close_tx.lock() = Some(close_tx);

        if let Err(e) = conn.connect() {
            conn.close();
            error!("({}) error connecting to nsqd - {}", self.addr, e);
            return Err(e);
        }

        *self.conn.lock() = Some(conn.clone());
        self.state.store(STATE_CONNECTED, Ordering::SeqCst);

        let inner = self.me.upgrade().ok_or(Error::Stopped)?;
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        *self.router_done.lock() = Some(done_rx);
        thread::spawn(move || {
            inner.router(&conn, &close_rx);
            drop(done_tx);
        });
        Ok(())
    }

    fn close(&self) {
        if self
            .state
            .compare_exchange(STATE_CONNECTED, STATE_DISCONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Some(conn) = self.conn.lock().clone() {
            conn.close();
        }

        // the next publish may only redial once the router is gone
        let router_done = self.router_done.lock().clone();
        let producer = self.me.clone();
        thread::spawn(move || {
            if let Some(done) = router_done {
                let _ = done.recv();
            }
            if let Some(inner) = producer.upgrade() {
                inner.state.store(STATE_INIT, Ordering::SeqCst);
            }
        });
    }

    fn stop(&self) {
        {
            let _guard = self.guard.lock();
            if self
                .stop_flag
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            info!("({}) stopping", self.addr);
            self.exit_tx.lock().take();
            self.close();
        }

        let router_done = self.router_done.lock().clone();
        if let Some(done) = router_done {
            let _ = done.recv();
        }
    }

    fn router(&self, conn: &Conn, closed: &Receiver<()>) {
        let mut transactions = VecDeque::new();

        loop {
            select! {
                recv(self.transaction_rx) -> t => {
                    let Ok(t) = t else { break };
                    let written = conn.write_command(&t.cmd);
                    transactions.push_back(t);
                    if let Err(e) = written {
                        error!("({}) sending command - {}", conn, e);
                        self.close();
                    }
                }
                recv(self.response_rx) -> data => {
                    if let Ok(data) = data {
                        self.pop_transaction(&mut transactions, FrameType::Response, &data);
                    }
                }
                recv(self.error_rx) -> data => {
                    if let Ok(data) = data {
                        self.pop_transaction(&mut transactions, FrameType::Error, &data);
                    }
                }
                recv(closed) -> _ => break,
                recv(self.exit_rx) -> _ => break,
            }
        }

        self.transaction_cleanup(&mut transactions);
        info!("({}) exiting router", conn);
    }

    fn pop_transaction(&self, transactions: &mut VecDeque<Transaction>, frame_type: FrameType, data: &[u8]) {
        let Some(t) = transactions.pop_front() else {
            warn!(
                "({}) unexpected {:?} with no pending transaction - {}",
                self.addr,
                frame_type,
                String::from_utf8_lossy(data)
            );
            return;
        };

        let error = match frame_type {
            FrameType::Error => Some(Error::Protocol(String::from_utf8_lossy(data).into_owned())),
            _ => None,
        };
        t.finish(error);
    }

    fn transaction_cleanup(&self, transactions: &mut VecDeque<Transaction>) {
        for t in transactions.drain(..) {
            t.finish(Some(Error::NotConnected));
        }

        // free publishers that raced the router's exit
        loop {
            match self.transaction_rx.try_recv() {
                Ok(t) => t.finish(Some(Error::NotConnected)),
                Err(_) => {
                    if self.concurrent_producers.load(Ordering::SeqCst) == 0 {
                        return;
                    }
                    thread::sleep(CLEANUP_SPIN);
                }
            }
        }
    }
}

struct ProducerConnDelegate {
    producer: Weak<ProducerInner>,
    closed: Receiver<()>,
}

impl ProducerConnDelegate {
    fn forward(&self, pick: fn(&ProducerInner) -> &Sender<Vec<u8>>, data: &[u8]) {
        let Some(inner) = self.producer.upgrade() else { return };
        select! {
            send(pick(&inner), data.to_vec()) -> _ => {}
            recv(self.closed) -> _ => {}
            recv(inner.exit_rx) -> _ => {}
        }
    }
}

impl ConnDelegate for ProducerConnDelegate {
    fn on_response(&self, _conn: &Conn, data: &[u8]) {
        self.forward(|p| &p.response_tx, data);
    }

    fn on_error(&self, _conn: &Conn, data: &[u8]) {
        self.forward(|p| &p.error_tx, data);
    }

    fn on_io_error(&self, _conn: &Conn, _err: &std::io::Error) {
        if let Some(inner) = self.producer.upgrade() {
            inner.close();
        }
    }

    fn on_close(&self, _conn: &Conn) {
        if let Some(inner) = self.producer.upgrade() {
            let _guard = inner.guard.lock();
            inner.close_tx.lock().take();
        }
    }
}
