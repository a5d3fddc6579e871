// SPDX-License-Identifier: AGPL-3.0-or-later
use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;

use crate::message::MessageId;

/// One outbound instruction: `<name>[ <param>]*\n[<u32-BE len><body>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub params: Vec<Vec<u8>>,
    pub body: Option<Vec<u8>>,
}

/// IDENTIFY body. Field names are the wire keys.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyRequest {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub short_id: String,
    pub long_id: String,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub snappy: bool,
    pub feature_negotiation: bool,
    pub heartbeat_interval: i64,
    pub sample_rate: u32,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    pub msg_timeout: i64,
}

impl Command {
    fn new(name: &'static str, params: Vec<Vec<u8>>, body: Option<Vec<u8>>) -> Self {
        Self { name, params, body }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(self.name.as_bytes())?;
        for param in &self.params {
            w.write_all(b" ")?;
            w.write_all(param)?;
        }
        w.write_all(b"\n")?;

        if let Some(body) = &self.body {
            let len = u32::try_from(body.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "command body too large")
            })?;
            w.write_all(&len.to_be_bytes())?;
            w.write_all(body)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn identify(request: &IdentifyRequest) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(request)?;
        Ok(Self::new("IDENTIFY", Vec::new(), Some(body)))
    }

    pub fn auth(secret: &str) -> Self {
        Self::new("AUTH", Vec::new(), Some(secret.as_bytes().to_vec()))
    }

    pub fn subscribe(topic: &str, channel: &str) -> Self {
        Self::new("SUB", vec![topic.into(), channel.into()], None)
    }

    pub fn publish(topic: &str, body: &[u8]) -> Self {
        Self::new("PUB", vec![topic.into()], Some(body.to_vec()))
    }

    pub fn deferred_publish(topic: &str, delay: Duration, body: &[u8]) -> Self {
        Self::new(
            "DPUB",
            vec![topic.into(), millis(delay).into_bytes()],
            Some(body.to_vec()),
        )
    }

    /// Body: `<u32 count>(<u32 len><bytes>)*`.
    pub fn multi_publish<B: AsRef<[u8]>>(topic: &str, bodies: &[B]) -> io::Result<Self> {
        let too_large =
            || io::Error::new(io::ErrorKind::InvalidInput, "MPUB body too large");

        let count = u32::try_from(bodies.len()).map_err(|_| too_large())?;
        let size = bodies.iter().map(|b| b.as_ref().len() + 4).sum::<usize>() + 4;
        let mut body = Vec::with_capacity(size);
        body.extend_from_slice(&count.to_be_bytes());
        for b in bodies {
            let b = b.as_ref();
            let len = u32::try_from(b.len()).map_err(|_| too_large())?;
            body.extend_from_slice(&len.to_be_bytes());
            body.extend_from_slice(b);
        }
        Ok(Self::new("MPUB", vec![topic.into()], Some(body)))
    }

    pub fn ready(count: i64) -> Self {
        Self::new("RDY", vec![count.to_string().into_bytes()], None)
    }

    pub fn finish(id: &MessageId) -> Self {
        Self::new("FIN", vec![id.to_vec()], None)
    }

    /// Delay is sent in whole milliseconds.
    pub fn requeue(id: &MessageId, delay: Duration) -> Self {
        Self::new("REQ", vec![id.to_vec(), millis(delay).into_bytes()], None)
    }

    pub fn touch(id: &MessageId) -> Self {
        Self::new("TOUCH", vec![id.to_vec()], None)
    }

    /// `CLS`: asks nsqd to stop sending messages; answered by `CLOSE_WAIT`.
    pub fn start_close() -> Self {
        Self::new("CLS", Vec::new(), None)
    }

    pub fn nop() -> Self {
        Self::new("NOP", Vec::new(), None)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        for param in &self.params {
            write!(f, " {}", String::from_utf8_lossy(param))?;
        }
        Ok(())
    }
}

fn millis(d: Duration) -> String {
    d.as_millis().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &MessageId = b"0a1b2c3d4e5f6a7b";

    #[test]
    fn requeue_serializes_without_body() {
        let cmd = Command::requeue(ID, Duration::from_millis(250));
        assert_eq!(cmd.to_bytes().unwrap(), b"REQ 0a1b2c3d4e5f6a7b 250\n");
        assert!(cmd.body.is_none());
    }

    #[test]
    fn publish_prefixes_body_length() {
        let cmd = Command::publish("events", b"hello");
        let mut expected = b"PUB events\n".to_vec();
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"hello");
        assert_eq!(cmd.to_bytes().unwrap(), expected);
    }

    #[test]
    fn multi_publish_body_layout() {
        let cmd = Command::multi_publish("events", &[b"a".as_slice(), b"bcd".as_slice()]).unwrap();
        let body = cmd.body.as_ref().unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(b"a");
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(b"bcd");
        assert_eq!(body, &expected);

        let wire = cmd.to_bytes().unwrap();
        assert!(wire.starts_with(b"MPUB events\n"));
        assert_eq!(&wire[12..16], &(expected.len() as u32).to_be_bytes());
    }

    #[test]
    fn deferred_publish_carries_delay_in_ms() {
        let cmd = Command::deferred_publish("events", Duration::from_secs(2), b"x");
        assert_eq!(cmd.to_string(), "DPUB events 2000");
    }

    #[test]
    fn simple_commands() {
        assert_eq!(Command::ready(100).to_bytes().unwrap(), b"RDY 100\n");
        assert_eq!(Command::finish(ID).to_bytes().unwrap(), b"FIN 0a1b2c3d4e5f6a7b\n");
        assert_eq!(Command::touch(ID).to_bytes().unwrap(), b"TOUCH 0a1b2c3d4e5f6a7b\n");
        assert_eq!(Command::subscribe("t", "c").to_bytes().unwrap(), b"SUB t c\n");
        assert_eq!(Command::start_close().to_bytes().unwrap(), b"CLS\n");
        assert_eq!(Command::nop().to_bytes().unwrap(), b"NOP\n");
    }

    #[test]
    fn identify_body_uses_wire_keys() {
        let request = IdentifyRequest {
            client_id: "host".into(),
            hostname: "host.example".into(),
            user_agent: "ua".into(),
            short_id: "host".into(),
            long_id: "host.example".into(),
            tls_v1: false,
            deflate: false,
            deflate_level: 6,
            snappy: false,
            feature_negotiation: true,
            heartbeat_interval: 30_000,
            sample_rate: 0,
            output_buffer_size: 16384,
            output_buffer_timeout: 250,
            msg_timeout: 0,
        };
        let cmd = Command::identify(&request).unwrap();
        let body: serde_json::Value = serde_json::from_slice(cmd.body.as_ref().unwrap()).unwrap();
        for key in [
            "client_id", "hostname", "user_agent", "short_id", "long_id", "tls_v1",
            "deflate", "deflate_level", "snappy", "feature_negotiation",
            "heartbeat_interval", "sample_rate", "output_buffer_size",
            "output_buffer_timeout", "msg_timeout",
        ] {
            assert!(body.get(key).is_some(), "missing {key}");
        }
        assert_eq!(body["heartbeat_interval"], 30_000);
        assert!(cmd.to_bytes().unwrap().starts_with(b"IDENTIFY\n"));
    }
}
