// SPDX-License-Identifier: AGPL-3.0-or-later
//! NSQ TCP protocol v2 framing.
//!
//! Server frames: big-endian u32 size + big-endian u32 frame type + data,
//! where size counts the type field and the data.

use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::LazyLock;

use regex::Regex;

/// Sent once, before anything else, on every new connection.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

pub const MSG_ID_LENGTH: usize = 16;

/// Upper bound on any frame read when no `max_msg_size` is configured.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024; // 64 MiB

// timestamp (8) + attempts (2) + id (16)
const MSG_HEADER_LENGTH: usize = 8 + 2 + MSG_ID_LENGTH;

static VALID_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\.a-zA-Z0-9_-]+(#ephemeral)?$").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Response,
    Error,
    Message,
}

impl FrameType {
    pub fn from_wire(raw: i32) -> io::Result<Self> {
        match raw {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type {}", other),
            )),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            FrameType::Response => 0,
            FrameType::Error => 1,
            FrameType::Message => 2,
        }
    }
}

pub fn is_valid_topic_name(name: &str) -> bool {
    is_valid_name(name)
}

pub fn is_valid_channel_name(name: &str) -> bool {
    is_valid_name(name)
}

fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    VALID_NAME.is_match(name)
}

pub(crate) fn resolve_first(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(
            || io::Error::new(
                io::ErrorKind::InvalidInput, "could not resolve address"
            )
        )
}

/// Reads one size-prefixed response (frame type + data).
///
/// `max_msg_size` of zero falls back to [`MAX_FRAME_SIZE`].
pub fn read_response<R: Read + ?Sized>(r: &mut R, max_msg_size: u32) -> io::Result<Vec<u8>> {
    let mut size_buf = [0u8; 4];
    r.read_exact(&mut size_buf)?;

    let size = i32::from_be_bytes(size_buf);
    if size < 0 {
        return Err(
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response msg size is negative: {}", size)
            )
        );
    }
    let limit = if max_msg_size > 0 { max_msg_size } else { MAX_FRAME_SIZE };
    if size as u32 > limit {
        return Err(
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response msg size {} exceeds maximum ({})", size, limit)
            )
        );
    }

    let mut buf = vec![0u8; size as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Splits a response into its frame type and data.
pub fn unpack_response(response: &[u8]) -> io::Result<(FrameType, &[u8])> {
    if response.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "length of response is too small",
        ));
    }
    let raw = i32::from_be_bytes([response[0], response[1], response[2], response[3]]);
    Ok((FrameType::from_wire(raw)?, &response[4..]))
}

pub fn read_unpacked_response<R: Read + ?Sized>(
            r: &mut R,
            max_msg_size: u32
        ) -> io::Result<(FrameType, Vec<u8>)> {
    let mut response = read_response(r, max_msg_size)?;
    let (frame_type, _) = unpack_response(&response)?;
    response.drain(..4);
    Ok((frame_type, response))
}

/// Message frame fields, before a connection attaches itself.
pub(crate) struct RawMessage {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; MSG_ID_LENGTH],
    pub body: Vec<u8>,
}

pub(crate) fn decode_message(data: &[u8]) -> io::Result<RawMessage> {
    if data.len() < MSG_HEADER_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not enough data to decode valid message",
        ));
    }

    let mut ts = [0u8; 8];
    ts.copy_from_slice(&data[0..8]);
    let attempts = u16::from_be_bytes([data[8], data[9]]);
    let mut id = [0u8; MSG_ID_LENGTH];
    id.copy_from_slice(&data[10..MSG_HEADER_LENGTH]);

    Ok(RawMessage {
        timestamp: i64::from_be_bytes(ts),
        attempts,
        id,
        body: data[MSG_HEADER_LENGTH..].to_vec(),
    })
}

#[cfg(test)]
pub(crate) fn encode_frame(frame_type: FrameType, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
    buf.extend_from_slice(&frame_type.to_wire().to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_response_frame() {
        let frame = encode_frame(FrameType::Response, b"OK");
        let (frame_type, data) =
            read_unpacked_response(&mut Cursor::new(frame), 0).unwrap();
        assert_eq!(frame_type, FrameType::Response);
        assert_eq!(data, b"OK");
    }

    #[test]
    fn reads_error_frame() {
        let frame = encode_frame(FrameType::Error, b"E_INVALID bad");
        let (frame_type, data) =
            read_unpacked_response(&mut Cursor::new(frame), 0).unwrap();
        assert_eq!(frame_type, FrameType::Error);
        assert_eq!(data, b"E_INVALID bad");
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let mut frame = encode_frame(FrameType::Message, b"0123456789");
        frame.truncate(frame.len() - 3);
        let err = read_unpacked_response(&mut Cursor::new(frame), 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn rejects_negative_and_oversized_frames() {
        let negative = (-1i32).to_be_bytes().to_vec();
        let err = read_response(&mut Cursor::new(negative), 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let frame = encode_frame(FrameType::Response, &[0u8; 100]);
        let err = read_response(&mut Cursor::new(frame), 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unlimited_reads_still_stop_at_max_frame_size() {
        // a garbage header must fail before anything is allocated
        let header = i32::MAX.to_be_bytes().to_vec();
        let err = read_response(&mut Cursor::new(header), 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let frame = encode_frame(FrameType::Response, &[7u8; 1000]);
        assert_eq!(read_response(&mut Cursor::new(frame), 0).unwrap().len(), 1004);
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&6u32.to_be_bytes());
        frame.extend_from_slice(&9i32.to_be_bytes());
        frame.extend_from_slice(b"xx");
        let err = read_unpacked_response(&mut Cursor::new(frame), 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn short_message_fails_to_decode() {
        let err = decode_message(&[0u8; 25]).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn topic_and_channel_names() {
        assert!(is_valid_topic_name("test"));
        assert!(is_valid_topic_name("test.topic-name_1"));
        assert!(is_valid_topic_name("test#ephemeral"));
        assert!(is_valid_channel_name(&"a".repeat(64)));

        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name(&"a".repeat(65)));
        assert!(!is_valid_topic_name("has space"));
        assert!(!is_valid_topic_name("test#ephemeral#ephemeral"));
        assert!(!is_valid_channel_name("bad/name"));
    }
}
