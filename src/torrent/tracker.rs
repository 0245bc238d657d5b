//! HTTP tracker announces (BEP 3 with compact peers, BEP 23).
//!
//! The session announces on start, stop, completion and on the tracker's
//! advertised interval. Responses feed the seeder/leecher counts shown
//! next to each torrent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use reqwest::Client;

use super::bencode::Bencode;
use crate::error::{DownloadError, Result};
use crate::protocol::InfoHash;

/// Identifier sent as the peer_id prefix, Azureus style.
const PEER_ID_PREFIX: &[u8; 8] = b"-PD0001-";

/// Fallback re-announce interval when the tracker does not send one.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    /// Periodic re-announce, no event parameter on the wire.
    Interval,
}

impl AnnounceEvent {
    fn as_param(self) -> Option<&'static str> {
        match self {
            Self::Started => Some("started"),
            Self::Stopped => Some("stopped"),
            Self::Completed => Some("completed"),
            Self::Interval => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Duration,
    /// Peers with a complete copy, `-1` when the tracker omits the count.
    pub seeders: i32,
    pub leechers: i32,
    pub peers: Vec<SocketAddr>,
}

pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}

pub struct TrackerClient {
    http: Client,
}

impl TrackerClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Announces to one tracker. Only HTTP(S) trackers are supported;
    /// other schemes fail so the caller can move down the tracker list.
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        if !tracker_url.starts_with("http://") && !tracker_url.starts_with("https://") {
            return Err(DownloadError::TorrentStartup {
                message: format!("unsupported tracker protocol: {}", tracker_url),
            });
        }

        let url = build_announce_url(tracker_url, request);
        let response = self.http.get(&url).send().await.map_err(|e| {
            DownloadError::connection(format!("tracker request failed: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(DownloadError::connection(format!(
                "tracker returned status {}",
                response.status()
            )));
        }
        let body = response.bytes().await.map_err(|e| {
            DownloadError::connection(format!("tracker response read failed: {e}"))
        })?;
        parse_announce_response(&body)
    }
}

fn build_announce_url(tracker_url: &str, request: &AnnounceRequest) -> String {
    let mut url = tracker_url.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });

    url.push_str("info_hash=");
    for byte in &request.info_hash.0 {
        url.push_str(&format!("%{:02X}", byte));
    }
    url.push_str("&peer_id=");
    for byte in &request.peer_id {
        url.push_str(&format!("%{:02X}", byte));
    }
    url.push_str(&format!(
        "&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        request.port, request.uploaded, request.downloaded, request.left
    ));
    if let Some(event) = request.event.as_param() {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let root = Bencode::decode(body).map_err(|_| {
        DownloadError::connection("tracker sent a malformed response")
    })?;

    if let Some(reason) = root.get("failure reason").and_then(Bencode::as_str) {
        return Err(DownloadError::connection(format!(
            "tracker refused announce: {reason}"
        )));
    }

    let interval = root
        .get("interval")
        .and_then(Bencode::as_int)
        .filter(|&n| n > 0)
        .map(|n| Duration::from_secs(n as u64))
        .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL);

    let seeders = root
        .get("complete")
        .and_then(Bencode::as_int)
        .map(|n| n as i32)
        .unwrap_or(-1);
    let leechers = root
        .get("incomplete")
        .and_then(Bencode::as_int)
        .map(|n| n as i32)
        .unwrap_or(-1);

    let peers = match root.get("peers") {
        // Compact form: 6 bytes per peer, IPv4 + big-endian port.
        Some(Bencode::Bytes(raw)) if raw.len() % 6 == 0 => raw
            .chunks_exact(6)
            .map(|c| {
                let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                let port = u16::from_be_bytes([c[4], c[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect(),
        // Dictionary form (BEP 3 original).
        Some(Bencode::List(items)) => items
            .iter()
            .filter_map(|item| {
                let ip: IpAddr = item.get("ip")?.as_str()?.parse().ok()?;
                let port = item.get("port")?.as_int()? as u16;
                Some(SocketAddr::new(ip, port))
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        seeders,
        leechers,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], PEER_ID_PREFIX);
        assert_ne!(generate_peer_id()[8..], id[8..]);
    }

    #[test]
    fn announce_url_escapes_binary_hash() {
        let request = AnnounceRequest {
            info_hash: InfoHash([0xff; 20]),
            peer_id: *b"-PD0001-abcdefghijkl",
            port: 8500,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event: AnnounceEvent::Started,
        };
        let url = build_announce_url("http://t.invalid/announce", &request);
        assert!(url.contains("info_hash=%FF%FF"));
        assert!(url.contains("&event=started"));
        assert!(url.contains("&left=30"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn interval_announce_has_no_event_param() {
        let request = AnnounceRequest {
            info_hash: InfoHash([0; 20]),
            peer_id: generate_peer_id(),
            port: 8500,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: AnnounceEvent::Interval,
        };
        let url = build_announce_url("http://t.invalid/a?key=1", &request);
        assert!(!url.contains("event="));
        assert!(url.contains("?key=1&info_hash="));
    }

    #[test]
    fn parses_compact_response() {
        let body = b"d8:completei4e10:incompletei2e8:intervali120e5:peers6:\x7f\x00\x00\x01\x1f\x90e";
        let resp = parse_announce_response(body).unwrap();
        assert_eq!(resp.seeders, 4);
        assert_eq!(resp.leechers, 2);
        assert_eq!(resp.interval, Duration::from_secs(120));
        assert_eq!(resp.peers, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn failure_reason_is_an_error() {
        let body = b"d14:failure reason9:not founde";
        assert!(parse_announce_response(body).is_err());
    }
}
