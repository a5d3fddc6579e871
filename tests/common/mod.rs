// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process stand-ins for nsqd and nsqlookupd.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use flate2::bufread::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

pub const WAIT: Duration = Duration::from_secs(5);

const FRAME_RESPONSE: u32 = 0;
const FRAME_ERROR: u32 = 1;
const FRAME_MESSAGE: u32 = 2;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `check` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[derive(Clone)]
pub struct MockMessage {
    pub id: [u8; 16],
    pub attempts: u16,
    pub body: Vec<u8>,
}

impl MockMessage {
    pub fn new(n: u32, body: &[u8]) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(format!("{:016x}", n).as_bytes());
        Self {
            id,
            attempts: 1,
            body: body.to_vec(),
        }
    }

    pub fn with_attempts(mut self, attempts: u16) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }
}

#[derive(Default)]
pub struct MockOptions {
    pub messages: Vec<MockMessage>,
    pub heartbeat_after_sub: bool,
    pub auth_required: bool,
    /// Answer IDENTIFY with a bare `OK`, like nsqd before feature negotiation.
    pub legacy_identify: bool,
    /// Agree to deflate when the client asks for it.
    pub deflate: bool,
    /// Drop the first connection as soon as it sends RDY.
    pub hang_up_first_on_rdy: bool,
}

#[derive(Default)]
struct State {
    commands: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    queue: Mutex<VecDeque<MockMessage>>,
    connections: Mutex<usize>,
}

pub struct MockNsqd {
    addr: String,
    state: Arc<State>,
}

impl MockNsqd {
    pub fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(State::default());
        state.queue.lock().unwrap().extend(options.messages.iter().cloned());

        let options = Arc::new(options);
        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let index = {
                    let mut connections = accept_state.connections.lock().unwrap();
                    *connections += 1;
                    *connections
                };
                let state = accept_state.clone();
                let options = options.clone();
                thread::spawn(move || {
                    let _ = serve(stream, index, &state, &options);
                });
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn saw(&self, cmd: &str) -> bool {
        self.commands().iter().any(|c| c == cmd)
    }

    pub fn count(&self, cmd: &str) -> usize {
        self.commands().iter().filter(|c| *c == cmd).count()
    }

    /// The most recent `RDY` command, if any.
    pub fn last_rdy(&self) -> Option<String> {
        self.commands().into_iter().rev().find(|c| c.starts_with("RDY "))
    }

    pub fn wait_for(&self, pred: impl Fn(&str) -> bool) -> bool {
        eventually(WAIT, || self.commands().iter().any(|c| pred(c)))
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        *self.state.connections.lock().unwrap()
    }
}

fn write_frame(w: &mut impl Write, frame_type: u32, data: &[u8]) -> io::Result<()> {
    let size = (data.len() + 4) as u32;
    w.write_all(&size.to_be_bytes())?;
    w.write_all(&frame_type.to_be_bytes())?;
    w.write_all(data)?;
    w.flush()
}

fn write_message(w: &mut impl Write, msg: &MockMessage) -> io::Result<()> {
    let mut data = Vec::with_capacity(26 + msg.body.len());
    data.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
    data.extend_from_slice(&msg.attempts.to_be_bytes());
    data.extend_from_slice(&msg.id);
    data.extend_from_slice(&msg.body);
    write_frame(w, FRAME_MESSAGE, &data)
}

fn read_body(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    r.read_exact(&mut body)?;
    Ok(body)
}

fn identify_response(options: &MockOptions, deflate: bool) -> Vec<u8> {
    if options.legacy_identify {
        return b"OK".to_vec();
    }
    format!(
        r#"{{"max_rdy_count":2500,"version":"1.3.0","max_msg_timeout":900000,
            "msg_timeout":60000,"tls_v1":false,"deflate":{},"deflate_level":6,
            "max_deflate_level":6,"snappy":false,"sample_rate":0,
            "auth_required":{},"output_buffer_size":16384,"output_buffer_timeout":250}}"#,
        deflate, options.auth_required
    )
    .into_bytes()
}

/// Per-connection flow control, the way nsqd applies RDY: at most `rdy`
/// messages in flight at once.
#[derive(Default)]
struct Credit {
    rdy: usize,
    in_flight: usize,
}

fn pump(w: &mut impl Write, state: &State, credit: &mut Credit) -> io::Result<()> {
    while credit.in_flight < credit.rdy {
        let next = state.queue.lock().unwrap().pop_front();
        let Some(msg) = next else { break };
        write_message(w, &msg)?;
        credit.in_flight += 1;
    }
    Ok(())
}

fn serve(stream: TcpStream, index: usize, state: &State, options: &MockOptions) -> io::Result<()> {
    let mut reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(stream.try_clone()?));
    let mut writer: Box<dyn Write + Send> = Box::new(stream.try_clone()?);
    let mut credit = Credit::default();

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    assert_eq!(&magic, b"  V2");

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let cmd = line.trim_end().to_string();
        state.commands.lock().unwrap().push(cmd.clone());

        let mut parts = cmd.split(' ');
        match parts.next().unwrap_or_default() {
            "IDENTIFY" => {
                let body = read_body(&mut reader)?;
                let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
                let deflate = options.deflate && request["deflate"] == true;
                write_frame(&mut writer, FRAME_RESPONSE, &identify_response(options, deflate))?;
                if deflate {
                    // everything after the IDENTIFY response is compressed
                    writer = Box::new(DeflateEncoder::new(stream.try_clone()?, Compression::new(6)));
                    reader = Box::new(BufReader::new(DeflateDecoder::new(reader)));
                    write_frame(&mut writer, FRAME_RESPONSE, b"OK")?;
                }
            }
            "AUTH" => {
                let secret = read_body(&mut reader)?;
                if secret == b"letmein" {
                    let resp = br#"{"identity":"tester","identity_url":"","permission_count":1}"#;
                    write_frame(&mut writer, FRAME_RESPONSE, resp)?;
                } else {
                    write_frame(&mut writer, FRAME_ERROR, b"E_AUTH_FAILED AUTH failed")?;
                }
            }
            "SUB" => {
                write_frame(&mut writer, FRAME_RESPONSE, b"OK")?;
                if options.heartbeat_after_sub {
                    write_frame(&mut writer, FRAME_RESPONSE, b"_heartbeat_")?;
                }
            }
            "RDY" => {
                if options.hang_up_first_on_rdy && index == 1 {
                    return Ok(());
                }
                credit.rdy = parts.next().unwrap_or("0").parse().unwrap_or(0);
                pump(&mut writer, state, &mut credit)?;
            }
            "FIN" | "REQ" => {
                credit.in_flight = credit.in_flight.saturating_sub(1);
                pump(&mut writer, state, &mut credit)?;
            }
            "PUB" | "DPUB" | "MPUB" => {
                let topic = parts.next().unwrap_or_default().to_string();
                let body = read_body(&mut reader)?;
                if body == b"hangup" {
                    return Ok(());
                }
                if body == b"bad" {
                    write_frame(&mut writer, FRAME_ERROR, b"E_BAD_MESSAGE PUB invalid body")?;
                } else {
                    state.published.lock().unwrap().push((topic, body));
                    write_frame(&mut writer, FRAME_RESPONSE, b"OK")?;
                }
            }
            "CLS" => {
                credit.rdy = 0;
                write_frame(&mut writer, FRAME_RESPONSE, b"CLOSE_WAIT")?;
            }
            // TOUCH and NOP are only recorded
            _ => {}
        }
    }
}

/// Serves `/lookup` with a single producer pointing at `nsqd_addr`.
pub struct MockLookupd {
    addr: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockLookupd {
    pub fn start(nsqd_addr: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (host, port) = nsqd_addr.rsplit_once(':').unwrap();
        let body = format!(
            r#"{{"channels":[],"producers":[{{"remote_address":"{host}:50000",
                "hostname":"mock","broadcast_address":"{host}","tcp_port":{port},
                "http_port":4151,"version":"1.3.0"}}]}}"#
        );

        let seen = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let _ = answer_lookup(stream, &body, &seen);
            }
        });

        Self { addr, requests }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn answer_lookup(stream: TcpStream, body: &str, seen: &Mutex<Vec<String>>) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" {
            break;
        }
    }
    seen.lock().unwrap().push(request_line.trim_end().to_string());

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
         X-NSQ-Content-Type: nsq; version=1.0\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    )?;
    stream.flush()
}
