// SPDX-License-Identifier: AGPL-3.0-or-later
//! One TCP connection to one nsqd.
//!
//! After the handshake two threads own the socket: the read loop decodes
//! frames and hands them to the [`ConnDelegate`], the write loop serializes
//! message responses (FIN/REQ) and queued commands. Closing is a drain:
//! the connection waits for every in-flight message to be answered and
//! for both loops to exit before it reports [`ConnDelegate::on_close`].

use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use crossbeam::sync::WaitGroup;
use flate2::Compression;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::command::{Command, IdentifyRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{Message, MessageDelegate};
use crate::protocol::{self, FrameType, CLOSE_WAIT, HEARTBEAT, MAGIC_V2, OK};

const DEFAULT_MAX_RDY: i64 = 2500;

/// Connection events. Every method defaults to a no-op.
pub trait ConnDelegate: Send + Sync {
    fn on_response(&self, _conn: &Conn, _data: &[u8]) {}
    fn on_error(&self, _conn: &Conn, _data: &[u8]) {}
    fn on_message(&self, _conn: &Conn, _message: Message) {}
    fn on_message_finished(&self, _conn: &Conn, _message: &Message) {}
    fn on_message_requeued(&self, _conn: &Conn, _message: &Message) {}
    fn on_backoff(&self, _conn: &Conn) {}
    fn on_continue(&self, _conn: &Conn) {}
    fn on_resume(&self, _conn: &Conn) {}
    fn on_io_error(&self, _conn: &Conn, _err: &io::Error) {}
    fn on_heartbeat(&self, _conn: &Conn) {}
    fn on_close(&self, _conn: &Conn) {}
}

/// Negotiated session settings returned by IDENTIFY.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: i64,
    pub version: String,
    pub max_msg_timeout: i64,
    pub msg_timeout: i64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub max_deflate_level: i32,
    pub snappy: bool,
    pub sample_rate: i32,
    pub auth_required: bool,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        Self {
            max_rdy_count: DEFAULT_MAX_RDY,
            version: String::new(),
            max_msg_timeout: 0,
            msg_timeout: 0,
            tls_v1: false,
            deflate: false,
            deflate_level: 0,
            max_deflate_level: 0,
            snappy: false,
            sample_rate: 0,
            auth_required: false,
            output_buffer_size: 0,
            output_buffer_timeout: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    pub identity: String,
    pub identity_url: String,
    pub permission_count: i64,
}

struct MsgResponse {
    message: Message,
    cmd: Command,
    success: bool,
    backoff: bool,
}

pub struct Conn {
    me: Weak<Conn>,
    addr: String,
    config: Config,
    delegate: Arc<dyn ConnDelegate>,

    socket: OnceLock<TcpStream>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,

    max_rdy: AtomicI64,
    rdy: AtomicI64,
    last_rdy: AtomicI64,
    // nanoseconds since `created`
    last_rdy_ts: AtomicU64,
    last_msg_ts: AtomicU64,
    created: Instant,

    messages_in_flight: AtomicI64,
    close_flag: AtomicBool,
    read_loop_running: AtomicBool,
    stopper: Once,

    cmd_tx: Sender<Command>,
    cmd_rx: Receiver<Command>,
    msg_response_tx: Sender<MsgResponse>,
    msg_response_rx: Receiver<MsgResponse>,

    exit_tx: Mutex<Option<Sender<()>>>,
    exit_rx: Receiver<()>,
    drain_ready_tx: Mutex<Option<Sender<()>>>,
    drain_ready_rx: Receiver<()>,

    wait_group: Mutex<Option<WaitGroup>>,
}

impl Conn {
    pub fn new(addr: &str, config: &Config, delegate: Arc<dyn ConnDelegate>) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = channel::bounded(0);
        let (msg_response_tx, msg_response_rx) = channel::unbounded();
        let (exit_tx, exit_rx) = channel::bounded(0);
        let (drain_ready_tx, drain_ready_rx) = channel::bounded(0);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            addr: addr.to_string(),
            config: config.clone(),
            delegate,
            socket: OnceLock::new(),
            writer: Mutex::new(None),
            max_rdy: AtomicI64::new(DEFAULT_MAX_RDY),
            rdy: AtomicI64::new(0),
            last_rdy: AtomicI64::new(0),
            last_rdy_ts: AtomicU64::new(0),
            last_msg_ts: AtomicU64::new(0),
            created: Instant::now(),
            messages_in_flight: AtomicI64::new(0),
            close_flag: AtomicBool::new(false),
            read_loop_running: AtomicBool::new(false),
            stopper: Once::new(),
            cmd_tx,
            cmd_rx,
            msg_response_tx,
            msg_response_rx,
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_rx,
            drain_ready_tx: Mutex::new(Some(drain_ready_tx)),
            drain_ready_rx,
            wait_group: Mutex::new(None),
        })
    }

    /// Dials, negotiates the session and starts the read and write loops.
    ///
    /// Returns `None` when the daemon predates feature negotiation and
    /// answered IDENTIFY with a bare `OK`.
    pub fn connect(&self) -> Result<Option<IdentifyResponse>> {
        let socket_addr = protocol::resolve_first(&self.addr)?;
        let stream = if self.config.dial_timeout.is_zero() {
            TcpStream::connect(socket_addr)?
        } else {
            TcpStream::connect_timeout(&socket_addr, self.config.dial_timeout)?
        };
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;

        let mut reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(stream.try_clone()?));
        let mut writer: Box<dyn Write + Send> = Box::new(BufWriter::new(stream.try_clone()?));
        writer.write_all(MAGIC_V2)?;
        writer.flush()?;

        if self.socket.set(stream).is_err() {
            return Err(Error::AlreadyConnected);
        }
        *self.writer.lock() = Some(writer);

        let response = self.identify(&mut reader)?;

        if let Some(resp) = &response {
            if resp.deflate {
                reader = self.upgrade_deflate(reader, resp.deflate_level)?;
            }
            if resp.auth_required {
                match &self.config.auth_secret {
                    Some(secret) => self.auth(&mut reader, secret)?,
                    None => {
                        error!("({}) auth required", self.addr);
                        return Err(Error::Auth("auth required".into()));
                    }
                }
            } else if self.config.auth_secret.is_some() {
                warn!("({}) auth secret configured but nsqd does not require auth", self.addr);
            }
        }

        let conn = self.me.upgrade().ok_or(Error::NotConnected)?;
        let wg = WaitGroup::new();
        self.read_loop_running.store(true, Ordering::SeqCst);
        {
            let conn = conn.clone();
            let wg = wg.clone();
            thread::spawn(move || {
                conn.read_loop(reader);
                drop(wg);
            });
        }
        {
            let wg = wg.clone();
            thread::spawn(move || {
                conn.write_loop();
                drop(wg);
            });
        }
        *self.wait_group.lock() = Some(wg);

        Ok(response)
    }

    fn identify(&self, reader: &mut dyn BufRead) -> Result<Option<IdentifyResponse>> {
        let ms = |d: Duration| d.as_millis() as i64;
        let request = IdentifyRequest {
            client_id: self.config.client_id.clone(),
            hostname: self.config.hostname.clone(),
            user_agent: self.config.user_agent.clone(),
            short_id: self.config.client_id.clone(),
            long_id: self.config.hostname.clone(),
            tls_v1: self.config.tls_v1,
            deflate: self.config.deflate,
            deflate_level: self.config.deflate_level,
            snappy: self.config.snappy,
            feature_negotiation: true,
            // -1 disables heartbeats server-side
            heartbeat_interval: if self.config.heartbeat_interval.is_zero() {
                -1
            } else {
                ms(self.config.heartbeat_interval)
            },
            sample_rate: self.config.sample_rate,
            output_buffer_size: self.config.output_buffer_size,
            output_buffer_timeout: ms(self.config.output_buffer_timeout),
            msg_timeout: ms(self.config.msg_timeout),
        };

        let cmd = Command::identify(&request)?;
        self.send(&cmd).map_err(|e| Error::Identify(e.to_string()))?;

        let (frame_type, data) = protocol::read_unpacked_response(reader, self.config.max_msg_size)
            .map_err(|e| Error::Identify(e.to_string()))?;
        if frame_type == FrameType::Error {
            return Err(Error::Identify(String::from_utf8_lossy(&data).into_owned()));
        }

        // old nsqd without feature negotiation
        if data == OK {
            return Ok(None);
        }

        let resp: IdentifyResponse = serde_json::from_slice(&data)
            .map_err(|e| Error::Identify(format!("invalid IDENTIFY response - {}", e)))?;
        debug!("({}) IDENTIFY response: {:?}", self.addr, resp);

        self.max_rdy.store(resp.max_rdy_count, Ordering::SeqCst);
        Ok(Some(resp))
    }

    fn upgrade_deflate(
                &self,
                reader: Box<dyn BufRead + Send>,
                level: i32
            ) -> Result<Box<dyn BufRead + Send>> {
        info!("({}) upgrading to deflate", self.addr);
        let level = if level > 0 { level as u32 } else { self.config.deflate_level };

        let stream = self.socket.get().ok_or(Error::NotConnected)?.try_clone()?;
        let encoder = flate2::write::DeflateEncoder::new(
            BufWriter::new(stream),
            Compression::new(level),
        );
        *self.writer.lock() = Some(Box::new(encoder));

        let mut reader: Box<dyn BufRead + Send> =
            Box::new(BufReader::new(flate2::bufread::DeflateDecoder::new(reader)));
        let (frame_type, data) =
            protocol::read_unpacked_response(&mut reader, self.config.max_msg_size)
                .map_err(|e| Error::Identify(format!("deflate upgrade failed - {}", e)))?;
        if frame_type == FrameType::Error || data != OK {
            return Err(Error::Identify(format!(
                "invalid response from deflate upgrade: {}",
                String::from_utf8_lossy(&data)
            )));
        }
        Ok(reader)
    }

    fn auth(&self, reader: &mut dyn BufRead, secret: &str) -> Result<()> {
        self.send(&Command::auth(secret))?;

        let (frame_type, data) = protocol::read_unpacked_response(reader, self.config.max_msg_size)?;
        if frame_type == FrameType::Error {
            return Err(Error::Auth(String::from_utf8_lossy(&data).into_owned()));
        }

        let resp: AuthResponse = serde_json::from_slice(&data)
            .map_err(|e| Error::Auth(format!("invalid AUTH response - {}", e)))?;
        info!(
            "({}) auth accepted for {} ({}) with {} permissions",
            self.addr, resp.identity, resp.identity_url, resp.permission_count
        );
        Ok(())
    }

    fn send(&self, cmd: &Command) -> io::Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;
        cmd.write_to(writer)?;
        writer.flush()
    }

    /// Serializes and flushes one command. Failures are logged and
    /// reported to the delegate before being returned.
    pub fn write_command(&self, cmd: &Command) -> io::Result<()> {
        if let Err(e) = self.send(cmd) {
            error!("({}) IO error writing {} - {}", self.addr, cmd, e);
            self.delegate.on_io_error(self, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Asks the connection to close once its in-flight messages drain.
    pub fn close(&self) {
        self.close_flag.store(true, Ordering::SeqCst);
        if self.in_flight() == 0 {
            if let Some(socket) = self.socket.get() {
                socket.shutdown(Shutdown::Read).ok();
            }
        }
    }

    fn read_loop(self: Arc<Self>, mut reader: Box<dyn BufRead + Send>) {
        let message_delegate: Arc<dyn MessageDelegate> = Arc::new(ConnMessageDelegate {
            conn: self.me.clone(),
        });

        loop {
            if self.is_closing() {
                break;
            }

            let (frame_type, data) =
                match protocol::read_unpacked_response(&mut reader, self.config.max_msg_size) {
                    Ok(frame) => frame,
                    Err(e) => {
                        if !self.is_closing() {
                            error!("({}) IO error - {}", self.addr, e);
                            self.delegate.on_io_error(&self, &e);
                        }
                        break;
                    }
                };

            if frame_type == FrameType::Response && data == HEARTBEAT {
                debug!("({}) heartbeat received", self.addr);
                self.delegate.on_heartbeat(&self);
                if let Err(e) = self.write_command(&Command::nop()) {
                    error!("({}) error sending NOP - {}", self.addr, e);
                    break;
                }
                continue;
            }

            match frame_type {
                FrameType::Response => self.delegate.on_response(&self, &data),
                FrameType::Message => {
                    let mut message = match Message::decode(&data) {
                        Ok(message) => message,
                        Err(e) => {
                            error!("({}) IO error - {}", self.addr, e);
                            self.delegate.on_io_error(&self, &e);
                            break;
                        }
                    };
                    message.set_delegate(message_delegate.clone());
                    message.nsqd_address = self.addr.clone();
                    message.max_attempts = self.config.max_attempts;

                    self.message_arrived();
                    self.delegate.on_message(&self, message);
                }
                FrameType::Error => {
                    error!("({}) protocol error - {}", self.addr, String::from_utf8_lossy(&data));
                    self.delegate.on_error(&self, &data);
                }
            }
        }

        self.read_loop_running.store(false, Ordering::SeqCst);
        let in_flight = self.in_flight();
        if in_flight == 0 {
            self.begin_close();
        } else {
            warn!("({}) delaying close, {} outstanding messages", self.addr, in_flight);
        }
        info!("({}) readLoop exiting", self.addr);
    }

    fn write_loop(self: Arc<Self>) {
        loop {
            select! {
                recv(self.exit_rx) -> _ => break,
                recv(self.cmd_rx) -> cmd => {
                    let Ok(cmd) = cmd else { continue };
                    if let Err(e) = self.write_command(&cmd) {
                        error!("({}) error sending command {} - {}", self.addr, cmd, e);
                        self.begin_close();
                    }
                }
                recv(self.msg_response_rx) -> resp => {
                    let Ok(resp) = resp else { continue };
                    let in_flight = self.messages_in_flight.fetch_sub(1, Ordering::SeqCst) - 1;

                    if resp.success {
                        debug!("({}) FIN {}", self.addr, resp.message.id_str());
                        self.delegate.on_message_finished(&self, &resp.message);
                        self.delegate.on_resume(&self);
                    } else {
                        debug!("({}) REQ {}", self.addr, resp.message.id_str());
                        self.delegate.on_message_requeued(&self, &resp.message);
                        if resp.backoff {
                            self.delegate.on_backoff(&self);
                        } else {
                            self.delegate.on_continue(&self);
                        }
                    }

                    if let Err(e) = self.write_command(&resp.cmd) {
                        error!("({}) error sending command {} - {}", self.addr, resp.cmd, e);
                        self.begin_close();
                        continue;
                    }

                    if in_flight == 0 && self.is_closing() {
                        self.begin_close();
                    }
                }
            }
        }

        self.drain_ready_tx.lock().take();
        info!("({}) writeLoop exiting", self.addr);
    }

    fn begin_close(&self) {
        self.stopper.call_once(|| {
            info!("({}) beginning close", self.addr);
            self.close_flag.store(true, Ordering::SeqCst);
            self.exit_tx.lock().take();
            if let Some(socket) = self.socket.get() {
                socket.shutdown(Shutdown::Read).ok();
            }

            let Some(conn) = self.me.upgrade() else { return };
            let wg = match self.wait_group.lock().take() {
                Some(wg) => wg,
                None => {
                    // loops never started; nothing will open the drain gate
                    self.drain_ready_tx.lock().take();
                    WaitGroup::new()
                }
            };

            let cleanup_wg = wg.clone();
            let cleanup_conn = conn.clone();
            thread::spawn(move || {
                cleanup_conn.cleanup();
                drop(cleanup_wg);
            });
            thread::spawn(move || conn.wait_for_cleanup(wg));
        });
    }

    fn cleanup(&self) {
        let _ = self.drain_ready_rx.recv();

        let ticker = channel::tick(Duration::from_millis(100));
        let mut last_warning = Instant::now();
        // responses can still race in after the write loop stops pulling them
        loop {
            let in_flight = select! {
                recv(self.msg_response_rx) -> resp => {
                    if resp.is_ok() {
                        self.messages_in_flight.fetch_sub(1, Ordering::SeqCst) - 1
                    } else {
                        self.in_flight()
                    }
                }
                recv(ticker) -> _ => self.in_flight(),
            };

            if in_flight > 0 {
                if last_warning.elapsed() > Duration::from_secs(1) {
                    warn!("({}) draining... waiting for {} messages in flight", self.addr, in_flight);
                    last_warning = Instant::now();
                }
                continue;
            }
            if self.read_loop_running.load(Ordering::SeqCst) {
                if last_warning.elapsed() > Duration::from_secs(1) {
                    warn!("({}) draining... readLoop still running", self.addr);
                    last_warning = Instant::now();
                }
                continue;
            }
            break;
        }
        info!("({}) finished draining, cleanup exiting", self.addr);
    }

    fn wait_for_cleanup(self: Arc<Self>, wg: WaitGroup) {
        wg.wait();
        if let Some(socket) = self.socket.get() {
            socket.shutdown(Shutdown::Write).ok();
        }
        info!("({}) clean close complete", self.addr);
        self.delegate.on_close(&self);
    }

    fn on_message_finish(&self, message: &Message) {
        let resp = MsgResponse {
            message: message.clone(),
            cmd: Command::finish(&message.id),
            success: true,
            backoff: true,
        };
        // the receiver lives in self, so the send cannot fail
        let _ = self.msg_response_tx.send(resp);
    }

    fn on_message_requeue(&self, message: &Message, delay: Option<Duration>, backoff: bool) {
        let delay = delay.unwrap_or_else(|| {
            self.config
                .default_requeue_delay
                .saturating_mul(u32::from(message.attempts))
                .min(self.config.max_requeue_delay)
        });
        let resp = MsgResponse {
            message: message.clone(),
            cmd: Command::requeue(&message.id, delay),
            success: false,
            backoff,
        };
        let _ = self.msg_response_tx.send(resp);
    }

    fn on_message_touch(&self, message: &Message) {
        select! {
            send(self.cmd_tx, Command::touch(&message.id)) -> _ => {}
            recv(self.exit_rx) -> _ => {}
        }
    }

    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn rdy(&self) -> i64 {
        self.rdy.load(Ordering::SeqCst)
    }

    pub fn last_rdy(&self) -> i64 {
        self.last_rdy.load(Ordering::SeqCst)
    }

    pub fn max_rdy(&self) -> i64 {
        self.max_rdy.load(Ordering::SeqCst)
    }

    /// Records a granted RDY count and returns the credit it replaced.
    /// The wire command is sent by the caller.
    pub fn set_rdy(&self, rdy: i64) -> i64 {
        // swap, so a delivery racing the update is not lost
        let previous = self.rdy.swap(rdy, Ordering::SeqCst);
        self.last_rdy.store(rdy, Ordering::SeqCst);
        if rdy > 0 {
            self.last_rdy_ts.store(self.elapsed_nanos(), Ordering::SeqCst);
        }
        previous
    }

    /// Books one delivered message against the granted credit.
    pub(crate) fn message_arrived(&self) {
        self.rdy.fetch_sub(1, Ordering::SeqCst);
        self.messages_in_flight.fetch_add(1, Ordering::SeqCst);
        self.last_msg_ts.store(self.elapsed_nanos(), Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> i64 {
        self.messages_in_flight.load(Ordering::SeqCst)
    }

    /// When the last message arrived; the connection's creation time if none has.
    pub fn last_message_time(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_msg_ts.load(Ordering::SeqCst))
    }

    pub fn last_rdy_time(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_rdy_ts.load(Ordering::SeqCst))
    }

    pub fn is_closing(&self) -> bool {
        self.close_flag.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn with_writer(
                addr: &str,
                config: &Config,
                delegate: Arc<dyn ConnDelegate>,
                writer: Box<dyn Write + Send>
            ) -> Arc<Self> {
        let conn = Self::new(addr, config, delegate);
        *conn.writer.lock() = Some(writer);
        conn
    }

    #[cfg(test)]
    pub(crate) fn set_max_rdy(&self, max_rdy: i64) {
        self.max_rdy.store(max_rdy, Ordering::SeqCst);
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("addr", &self.addr)
            .field("rdy", &self.rdy())
            .field("max_rdy", &self.max_rdy())
            .field("in_flight", &self.in_flight())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Routes a message's responses back to the connection it came from.
struct ConnMessageDelegate {
    conn: Weak<Conn>,
}

impl MessageDelegate for ConnMessageDelegate {
    fn on_finish(&self, message: &Message) {
        match self.conn.upgrade() {
            Some(conn) => conn.on_message_finish(message),
            None => warn!("FIN {} dropped, connection is gone", message.id_str()),
        }
    }

    fn on_requeue(&self, message: &Message, delay: Option<Duration>, backoff: bool) {
        match self.conn.upgrade() {
            Some(conn) => conn.on_message_requeue(message, delay, backoff),
            None => warn!("REQ {} dropped, connection is gone", message.id_str()),
        }
    }

    fn on_touch(&self, message: &Message) {
        if let Some(conn) = self.conn.upgrade() {
            conn.on_message_touch(message);
        }
    }
}

/// True for the response nsqd sends after `CLS`.
pub(crate) fn is_close_wait(data: &[u8]) -> bool {
    data == CLOSE_WAIT
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// In-memory writer whose bytes stay readable after the conn takes it.
    #[derive(Clone, Default)]
    pub(crate) struct SharedSink(pub(crate) Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        pub(crate) fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Quiet;
    impl ConnDelegate for Quiet {}

    #[test]
    fn write_command_goes_through_writer() {
        let sink = SharedSink::default();
        let conn = Conn::with_writer("127.0.0.1:4150", &Config::new(), Arc::new(Quiet), Box::new(sink.clone()));
        conn.write_command(&Command::ready(5)).unwrap();
        conn.write_command(&Command::nop()).unwrap();
        assert_eq!(sink.text(), "RDY 5\nNOP\n");
    }

    #[test]
    fn write_without_socket_is_not_connected() {
        let conn = Conn::new("127.0.0.1:4150", &Config::new(), Arc::new(Quiet));
        let err = conn.write_command(&Command::nop()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn set_rdy_tracks_last_rdy() {
        let conn = Conn::new("127.0.0.1:4150", &Config::new(), Arc::new(Quiet));
        assert_eq!(conn.max_rdy(), DEFAULT_MAX_RDY);
        assert_eq!(conn.set_rdy(7), 0);
        assert_eq!((conn.rdy(), conn.last_rdy()), (7, 7));
        assert!(conn.last_rdy_time() >= conn.created);
        conn.message_arrived();
        assert_eq!((conn.rdy(), conn.in_flight()), (6, 1));
        assert_eq!(conn.set_rdy(0), 6);
        assert_eq!((conn.rdy(), conn.last_rdy()), (0, 0));
    }

    #[test]
    fn requeue_delay_scales_with_attempts() {
        let mut config = Config::new();
        config.default_requeue_delay = Duration::from_secs(90);
        config.max_requeue_delay = Duration::from_secs(200);
        let conn = Conn::new("127.0.0.1:4150", &config, Arc::new(Quiet));

        let mut message = Message::new(*b"0123456789abcdef", "x");
        message.attempts = 2;
        conn.on_message_requeue(&message, None, true);
        message.attempts = 3;
        conn.on_message_requeue(&message, None, true);
        conn.on_message_requeue(&message, Some(Duration::from_millis(5)), false);

        let cmds: Vec<String> = conn.msg_response_rx.try_iter().map(|r| r.cmd.to_string()).collect();
        assert_eq!(
            cmds,
            [
                "REQ 0123456789abcdef 180000",
                "REQ 0123456789abcdef 200000",
                "REQ 0123456789abcdef 5",
            ]
        );
    }

    #[test]
    fn close_before_connect_is_harmless() {
        let conn = Conn::new("127.0.0.1:4150", &Config::new(), Arc::new(Quiet));
        conn.close();
        assert!(conn.is_closing());
        assert!(is_close_wait(b"CLOSE_WAIT"));
        assert!(!is_close_wait(b"OK"));
    }

    #[test]
    fn identify_response_defaults_max_rdy() {
        let resp: IdentifyResponse = serde_json::from_str(r#"{"deflate":true}"#).unwrap();
        assert!(resp.deflate);
        assert_eq!(resp.max_rdy_count, DEFAULT_MAX_RDY);
    }
}
