// SPDX-License-Identifier: AGPL-3.0-or-later
//! nsqlookupd discovery: `GET /lookup?topic=<topic>`.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const ACCEPT: &str = "application/vnd.nsq; version=1.0";
const VERSIONED_CONTENT_TYPE: &str = "nsq; version=1.0";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeerInfo {
    pub remote_address: String,
    pub hostname: String,
    pub broadcast_address: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub version: String,
}

impl PeerInfo {
    /// `broadcast_address:tcp_port`, bracketing IPv6 hosts.
    pub fn tcp_addr(&self) -> String {
        join_host_port(&self.broadcast_address, self.tcp_port)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LookupResponse {
    pub channels: Vec<String>,
    pub producers: Vec<PeerInfo>,
}

// pre-1.0 nsqlookupd wraps every body
#[derive(Deserialize)]
struct LegacyEnvelope {
    status_code: i64,
    #[serde(default)]
    status_txt: String,
    data: Option<LookupResponse>,
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Checks a lookupd address: either a bare `host:port` or an
/// `http`/`https` URL.
pub(crate) fn validate_addr(addr: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidLookupdAddr {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    if addr.contains('/') {
        let (scheme, rest) = addr.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme != "http" && scheme != "https" {
            return Err(invalid("scheme must be http or https"));
        }
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        return Ok(());
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok(())
}

/// Full lookup URL (without the query string) for a validated address.
pub(crate) fn lookup_endpoint(addr: &str) -> String {
    let url = if addr.contains('/') {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    };

    let after_scheme = url.find("://").map_or(0, |i| i + 3);
    match url[after_scheme..].find('/') {
        None => format!("{}/lookup", url),
        Some(i) if after_scheme + i + 1 == url.len() => format!("{}lookup", url),
        Some(_) => url,
    }
}

pub(crate) fn parse_lookup_response(body: &[u8], versioned: bool) -> Result<LookupResponse> {
    if versioned {
        return Ok(serde_json::from_slice(body)?);
    }

    let envelope: LegacyEnvelope = serde_json::from_slice(body)?;
    if envelope.status_code != 200 {
        return Err(Error::Lookupd(format!(
            "{} {}",
            envelope.status_code, envelope.status_txt
        )));
    }
    Ok(envelope.data.unwrap_or_default())
}

/// Queries one lookupd for the producers of `topic`.
pub fn query(addr: &str, topic: &str, timeout: Duration) -> Result<LookupResponse> {
    let endpoint = lookup_endpoint(addr);

    let mut builder = ureq::AgentBuilder::new();
    if !timeout.is_zero() {
        builder = builder.timeout(timeout);
    }
    let agent = builder.build();

    let response = agent
        .get(&endpoint)
        .set("Accept", ACCEPT)
        .query("topic", topic)
        .call()
        .map_err(|e| Error::Lookupd(format!("{} - {}", endpoint, e)))?;

    let versioned = response
        .header("X-NSQ-Content-Type")
        .is_some_and(|v| v == VERSIONED_CONTENT_TYPE);
    let body = response.into_string()?;

    parse_lookup_response(body.as_bytes(), versioned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn joins_ipv6_hosts_with_brackets() {
        assert_eq!(join_host_port("127.0.0.1", 4150), "127.0.0.1:4150");
        assert_eq!(join_host_port("::1", 4150), "[::1]:4150");
        assert_eq!(join_host_port("nsqd.local", 4150), "nsqd.local:4150");
    }

    #[test]
    fn validates_addresses() {
        assert!(validate_addr("127.0.0.1:4161").is_ok());
        assert!(validate_addr("[::1]:4161").is_ok());
        assert!(validate_addr("http://lookupd:4161").is_ok());
        assert!(validate_addr("https://lookupd:4161/lookup").is_ok());

        assert!(validate_addr("lookupd").is_err());
        assert!(validate_addr("lookupd:port").is_err());
        assert!(validate_addr("ftp://lookupd:4161/").is_err());
        assert!(validate_addr("lookupd:4161/lookup").is_err());
        assert!(validate_addr("http:///lookup").is_err());
    }

    #[test]
    fn builds_endpoints() {
        assert_eq!(lookup_endpoint("127.0.0.1:4161"), "http://127.0.0.1:4161/lookup");
        assert_eq!(lookup_endpoint("http://lookupd:4161"), "http://lookupd:4161/lookup");
        assert_eq!(lookup_endpoint("http://lookupd:4161/"), "http://lookupd:4161/lookup");
        assert_eq!(
            lookup_endpoint("https://lookupd:4161/custom/lookup"),
            "https://lookupd:4161/custom/lookup"
        );
    }

    const BODY: &str = r#"{"channels":["c"],"producers":[
        {"broadcast_address":"10.0.0.1","tcp_port":4150,"http_port":4151},
        {"broadcast_address":"fe80::1","tcp_port":4150}
    ]}"#;

    #[test]
    fn parses_versioned_body() {
        let resp = parse_lookup_response(BODY.as_bytes(), true).unwrap();
        assert_eq!(resp.channels, ["c"]);
        let addrs: Vec<_> = resp.producers.iter().map(PeerInfo::tcp_addr).collect();
        assert_eq!(addrs, ["10.0.0.1:4150", "[fe80::1]:4150"]);
    }

    #[test]
    fn parses_legacy_envelope() {
        let legacy = format!(r#"{{"status_code":200,"status_txt":"OK","data":{}}}"#, BODY);
        let resp = parse_lookup_response(legacy.as_bytes(), false).unwrap();
        assert_eq!(resp.producers.len(), 2);

        let failed = br#"{"status_code":500,"status_txt":"INTERNAL_ERROR","data":null}"#;
        assert!(matches!(
            parse_lookup_response(failed, false),
            Err(Error::Lookupd(_))
        ));
    }

    #[test]
    fn queries_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut accept = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line.to_ascii_lowercase().starts_with("accept:") {
                    accept = line.trim().to_string();
                }
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 X-NSQ-Content-Type: nsq; version=1.0\r\nContent-Length: {}\r\n\
                 Connection: close\r\n\r\n{}",
                BODY.len(),
                BODY
            )
            .unwrap();
            (request_line, accept)
        });

        let resp = query(&addr.to_string(), "events", Duration::from_secs(5)).unwrap();
        assert_eq!(resp.producers[0].tcp_addr(), "10.0.0.1:4150");

        let (request_line, accept) = server.join().unwrap();
        assert!(request_line.starts_with("GET /lookup?topic=events "));
        assert!(accept.ends_with("application/vnd.nsq; version=1.0"));
    }
}
