// SPDX-License-Identifier: AGPL-3.0-or-later
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use nsq_client::{Command, Config, Conn, ConnDelegate, Message};

use common::{eventually, init_logging, MockMessage, MockNsqd, MockOptions, WAIT};

struct Recorder {
    messages: Sender<Message>,
    finished: AtomicUsize,
    closed: AtomicUsize,
}

impl ConnDelegate for Recorder {
    fn on_message(&self, _conn: &Conn, message: Message) {
        let _ = self.messages.send(message);
    }

    fn on_message_finished(&self, _conn: &Conn, _message: &Message) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _conn: &Conn) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn recorder() -> (Arc<Recorder>, channel::Receiver<Message>) {
    let (tx, rx) = channel::unbounded();
    let recorder = Arc::new(Recorder {
        messages: tx,
        finished: AtomicUsize::new(0),
        closed: AtomicUsize::new(0),
    });
    (recorder, rx)
}

#[test]
fn close_waits_for_in_flight_messages() {
    init_logging();
    let msg = MockMessage::new(7, b"payload");
    let nsqd = MockNsqd::start(MockOptions {
        messages: vec![msg.clone()],
        ..Default::default()
    });

    let (delegate, messages) = recorder();
    let conn = Conn::new(&nsqd.addr(), &Config::new(), delegate.clone());
    let identify = conn.connect().unwrap().unwrap();
    assert_eq!(identify.max_rdy_count, 2500);
    assert_eq!(conn.max_rdy(), 2500);

    conn.write_command(&Command::subscribe("events", "archive")).unwrap();
    conn.write_command(&Command::ready(1)).unwrap();

    let message = messages.recv_timeout(WAIT).unwrap();
    assert_eq!(message.body, b"payload");
    assert_eq!(message.attempts, 1);
    assert_eq!(message.nsqd_address, nsqd.addr());
    assert_eq!(conn.in_flight(), 1);

    conn.close();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(delegate.closed.load(Ordering::SeqCst), 0);

    message.finish();
    // a second response is ignored
    message.requeue(None);

    let fin = format!("FIN {}", msg.id_str());
    assert!(nsqd.wait_for(|c| c == fin));
    assert!(eventually(WAIT, || delegate.closed.load(Ordering::SeqCst) == 1));
    assert_eq!(delegate.finished.load(Ordering::SeqCst), 1);
    assert_eq!(conn.in_flight(), 0);
    assert!(!nsqd.commands().iter().any(|c| c.starts_with("REQ")));

    // close is idempotent and reports once
    conn.close();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(delegate.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn touch_is_sent_before_finish() {
    init_logging();
    let msg = MockMessage::new(8, b"slow");
    let nsqd = MockNsqd::start(MockOptions {
        messages: vec![msg.clone()],
        ..Default::default()
    });

    let (delegate, messages) = recorder();
    let conn = Conn::new(&nsqd.addr(), &Config::new(), delegate.clone());
    conn.connect().unwrap();
    conn.write_command(&Command::subscribe("events", "archive")).unwrap();
    conn.write_command(&Command::ready(1)).unwrap();

    let message = messages.recv_timeout(WAIT).unwrap();
    message.touch();
    let touch = format!("TOUCH {}", msg.id_str());
    assert!(nsqd.wait_for(|c| c == touch));

    message.finish();
    message.touch();
    let fin = format!("FIN {}", msg.id_str());
    assert!(nsqd.wait_for(|c| c == fin));

    conn.close();
    assert!(eventually(WAIT, || delegate.closed.load(Ordering::SeqCst) == 1));
    let touches = nsqd.commands().iter().filter(|c| c.starts_with("TOUCH")).count();
    assert_eq!(touches, 1);
}

#[test]
fn refused_dial_is_an_io_error() {
    init_logging();
    let (delegate, _messages) = recorder();
    let conn = Conn::new("127.0.0.1:1", &Config::new(), delegate);
    assert!(matches!(conn.connect(), Err(nsq_client::Error::Io(_))));
}
