// SPDX-License-Identifier: AGPL-3.0-or-later
use std::env;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use crossbeam::channel;
use crossbeam::select;
use log::{info, warn};
use nsq_client::{Config, Consumer, HandlerError, Message};

fn hex_preview(bytes: &[u8], max: usize) -> String {
    let mut out = String::new();
    for (i, b) in bytes.iter().take(max).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", b));
    }
    if bytes.len() > max {
        out.push_str(" ...");
    }
    out
}

#[derive(Clone, Copy)]
enum Mode {
    Text,
    Jsonl,
    Base64,
}

fn print_message(mode: Mode, msg: &Message) -> io::Result<()> {
    let mut out = io::stdout().lock();
    match mode {
        Mode::Text => match std::str::from_utf8(&msg.body) {
            Ok(s) => writeln!(out, "{}", s)?,
            Err(_) => writeln!(
                out,
                "msg {} ({} bytes) hex: {}",
                msg.id_str(), msg.body.len(), hex_preview(&msg.body, 32)
            )?,
        },
        Mode::Jsonl => {
            let s = std::str::from_utf8(&msg.body).map_err(
                |_| io::Error::new(io::ErrorKind::InvalidData, "payload not valid UTF-8")
            )?;
            // one line per message
            if s.contains('\n') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "payload contains newline; not valid for --jsonl (use --base64)",
                ));
            }
            writeln!(out, "{}", s)?;
        }
        Mode::Base64 => writeln!(out, "{}", STANDARD.encode(&msg.body))?,
    }
    out.flush()
}

fn usage() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "usage: nsq_tail <nsqd host:port | http://lookupd:port> <topic> [channel] [--text|--jsonl|--base64]",
    )
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // By default emit warnings
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")
    ).init();

    let mut args = env::args().skip(1);
    let addr = args.next().ok_or_else(usage)?;
    let topic = args.next().ok_or_else(usage)?;
    let mut channel = "nsq_tail#ephemeral".to_string();
    let mut mode = Mode::Text;
    for arg in args {
        match arg.as_str() {
            "--text" => mode = Mode::Text,
            "--jsonl" => mode = Mode::Jsonl,
            "--base64" => mode = Mode::Base64,
            other if other.starts_with("--") => return Err(usage().into()),
            other => channel = other.to_string(),
        }
    }

    let mut config = Config::new();
    config.set("max_in_flight", 200i64)?;
    let consumer = Consumer::new(&topic, &channel, &config)?;

    consumer.add_handler(move |msg: &Message| -> Result<(), HandlerError> {
        // a malformed payload is reported, not redelivered
        if let Err(e) = print_message(mode, msg) {
            warn!("skipping msg {} - {}", msg.id_str(), e);
        }
        Ok(())
    })?;

    // Ctrl-C or SIGTERM starts a graceful stop
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    if addr.starts_with("http://") || addr.starts_with("https://") {
        consumer.connect_to_nsqlookupd(&addr)?;
    } else {
        consumer.connect_to_nsqd(&addr)?;
    }
    info!("tailing {}/{} via {}", topic, channel, addr);

    let stopped = consumer.stopped();
    let ticker = channel::tick(Duration::from_millis(100));
    loop {
        select! {
            recv(stopped) -> _ => break,
            recv(ticker) -> _ => {
                if shutdown.swap(false, Ordering::SeqCst) {
                    info!("stopping consumer");
                    consumer.stop_async();
                }
            }
        }
    }
    Ok(())
}
