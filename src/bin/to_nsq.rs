// SPDX-License-Identifier: AGPL-3.0-or-later
use std::env;
use std::io::{self, BufRead};

use log::info;
use nsq_client::{Config, Producer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // By default emit warnings
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")
    ).init();

    let mut args = env::args().skip(1);
    let topic = args.next().ok_or_else(
        || io::Error::new(io::ErrorKind::InvalidInput, "usage: to_nsq <topic> [nsqd host:port]")
    )?;
    let nsqd = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:4150".to_string());

    let producer = Producer::new(&nsqd, &Config::new())?;
    producer.ping()?;
    info!("publishing to {} via {}", topic, nsqd);
    info!("type lines; each line becomes one message");

    let mut published = 0u64;
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        producer.publish(&topic, line.as_bytes())?;
        published += 1;
    }

    info!("published {} messages", published);
    producer.stop();
    Ok(())
}
