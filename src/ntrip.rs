//! NTRIP caster client.
//!
//! Flow:
//!   1. TCP connect, send the HTTP-like mount-point request
//!   2. Validate the `ICY 200 OK` / `HTTP/1.1 200 OK` status, strip headers
//!   3. Stream: feed the socket through the RTCM framer, forward verified
//!      frames in arrival order
//!
//! The client also fetches the caster source-table (request path `/`) and
//! picks the geographically closest mount point for `mountpoint = auto`.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::error::{Result, RoverError};
use crate::rtcm::{RtcmFrame, RtcmFramer};

const USER_AGENT: &str = concat!("rtk-rover/", env!("CARGO_PKG_VERSION"));

/// The caster ends the source-table with `Connection: close`; this bounds a
/// server that never does.
const SOURCE_TABLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A mount point further away than this is not worth subscribing to.
const MAX_DISTANCE_KM: f64 = 50.0;
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    HandshakePending,
    SourceTableFetch,
    Streaming,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::HandshakePending => "handshake-pending",
            ClientState::SourceTableFetch => "source-table-fetch",
            ClientState::Streaming => "streaming",
            ClientState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One `STR` record from the caster source-table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTableEntry {
    pub mountpoint: String,
    pub city: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

pub struct NtripClient {
    host: String,
    port: u16,
    username: String,
    password: String,
    state: ClientState,
    stream_task: Option<JoinHandle<()>>,
}

impl NtripClient {
    pub fn new(host: String, port: u16, username: String, password: String) -> NtripClient {
        NtripClient {
            host,
            port,
            username,
            password,
            state: ClientState::Disconnected,
            stream_task: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn set_state(&mut self, next: ClientState) {
        if self.state != next {
            debug!("NTRIP: state {} -> {next}", self.state);
            self.state = next;
        }
    }

    /// The request is byte-identical for a mount point and for the
    /// source-table (empty `path`).
    fn request_for(&self, path: &str) -> String {
        let auth = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!(
            "GET /{path} HTTP/1.1\r\n\
             Host: {host}:{port}\r\n\
             User-Agent: {USER_AGENT}\r\n\
             Authorization: Basic {auth}\r\n\
             Ntrip-Version: Ntrip/2.0\r\n\
             Connection: close\r\n\r\n",
            host = self.host,
            port = self.port,
        )
    }

    /// Subscribe to `mountpoint` and stream its corrections to `tx`.
    ///
    /// Returns once the handshake is complete; the streaming itself runs in
    /// a spawned task until the caster closes, an error occurs, or `stop`.
    pub async fn start(&mut self, mountpoint: &str, tx: UnboundedSender<RtcmFrame>) -> Result<()> {
        self.set_state(ClientState::Connecting);
        info!("NTRIP: connecting to {}:{}", self.host, self.port);

        let mut sock = match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(s) => s,
            Err(e) => {
                self.set_state(ClientState::Closed);
                return Err(RoverError::Handshake(format!(
                    "cannot connect to {}:{}: {e}",
                    self.host, self.port
                )));
            }
        };

        self.set_state(ClientState::HandshakePending);
        let result = handshake(&mut sock, &self.request_for(mountpoint)).await;
        let leftover = match result {
            Ok(leftover) => leftover,
            Err(e) => {
                self.set_state(ClientState::Closed);
                return Err(e);
            }
        };

        info!("NTRIP: subscribed to mount point {mountpoint}, receiving data");
        self.set_state(ClientState::Streaming);
        self.stream_task = Some(tokio::spawn(stream_loop(sock, leftover, tx)));
        Ok(())
    }

    /// Abort the streaming task and drop the socket.  Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        if self.state != ClientState::Closed {
            info!("NTRIP: stopped");
            self.set_state(ClientState::Closed);
        }
    }

    /// Fetch the source-table and return the closest mount point, if any is
    /// within range.
    pub async fn find_closest_mountpoint(&mut self, lat: f64, lon: f64) -> Result<String> {
        let entries = self.fetch_source_table().await?;
        info!(
            "NTRIP: {} proposes {} mount points, detecting the closest",
            self.host,
            entries.len()
        );
        match closest_entry(&entries, lat, lon) {
            Some((entry, distance)) => {
                info!(
                    "NTRIP: closest mount point {} in {} ({}) at {distance:.1} km",
                    entry.mountpoint, entry.city, entry.country
                );
                Ok(entry.mountpoint.clone())
            }
            None => Err(RoverError::AutoSelect(format!(
                "no mount point within {MAX_DISTANCE_KM} km"
            ))),
        }
    }

    /// Request path `/`, read to end-of-stream, keep the `STR` records.
    pub async fn fetch_source_table(&mut self) -> Result<Vec<SourceTableEntry>> {
        self.set_state(ClientState::SourceTableFetch);
        let result = timeout(SOURCE_TABLE_TIMEOUT, self.read_source_table()).await;
        self.set_state(ClientState::Disconnected);
        match result {
            Ok(entries) => entries,
            Err(_) => Err(RoverError::Stream("source-table fetch timed out".into())),
        }
    }

    async fn read_source_table(&self) -> Result<Vec<SourceTableEntry>> {
        let mut sock = TcpStream::connect((self.host.as_str(), self.port)).await?;
        sock.write_all(self.request_for("").as_bytes()).await?;
        let mut body = Vec::new();
        sock.read_to_end(&mut body).await?;
        Ok(parse_source_table(&String::from_utf8_lossy(&body)))
    }
}

/// Send `request` and consume the response header.  Returns any body bytes
/// that arrived after the blank line.
async fn handshake(sock: &mut TcpStream, request: &str) -> Result<Vec<u8>> {
    sock.write_all(request.as_bytes()).await?;

    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 2048];
    loop {
        let n = sock.read(&mut chunk).await?;
        if n == 0 {
            return Err(RoverError::Handshake(
                "caster closed the connection before a status line".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(header_end) = check_response(&buf)? {
            debug!("NTRIP: {}", status_line(&buf));
            return Ok(buf.split_off(header_end));
        }
        if buf.len() > 8192 {
            return Err(RoverError::Handshake("oversized response header".into()));
        }
    }
}

/// Check the accumulated response against the two accepted status lines.
///
/// `Ok(Some(n))` — accepted, header ends at byte `n` (past the blank line).
/// `Ok(None)` — not enough bytes to decide yet.
/// `Err` — the caster refused the request.
fn check_response(buf: &[u8]) -> Result<Option<usize>> {
    const ACCEPTED: [&[u8]; 2] = [b"ICY 200 OK", b"HTTP/1.1 200 OK"];

    let mut undecided = false;
    for status in ACCEPTED {
        if buf.len() < status.len() {
            if status.starts_with(buf) {
                undecided = true;
            }
            continue;
        }
        if buf.starts_with(status) {
            return Ok(buf
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|i| i + 4));
        }
    }
    if undecided {
        return Ok(None);
    }
    Err(RoverError::Handshake(format!(
        "caster refused the request: {}",
        status_line(buf)
    )))
}

fn status_line(buf: &[u8]) -> String {
    let line = buf.split(|&b| b == b'\r').next().unwrap_or(buf);
    String::from_utf8_lossy(line).into_owned()
}

/// Read the caster socket until it closes, pushing everything through the
/// framer and forwarding complete frames in order.
async fn stream_loop(mut sock: TcpStream, leftover: Vec<u8>, tx: UnboundedSender<RtcmFrame>) {
    let mut framer = RtcmFramer::new();
    if !forward_frames(&mut framer, &leftover, &tx) {
        return;
    }
    let mut chunk = [0u8; 4096];
    loop {
        match sock.read(&mut chunk).await {
            Ok(0) => {
                info!("NTRIP: caster closed the stream");
                return;
            }
            Ok(n) => {
                if !forward_frames(&mut framer, &chunk[..n], &tx) {
                    return;
                }
            }
            Err(e) => {
                error!("NTRIP: socket read error: {e}");
                return;
            }
        }
    }
}

fn forward_frames(framer: &mut RtcmFramer, data: &[u8], tx: &UnboundedSender<RtcmFrame>) -> bool {
    let frames = match framer.push(data) {
        Ok(frames) => frames,
        Err(e) => {
            error!("NTRIP: {e}");
            return false;
        }
    };
    for frame in frames {
        debug!(
            "NTRIP: RTCM message {} ({} bytes)",
            frame.message_type(),
            frame.len()
        );
        if tx.send(frame).is_err() {
            return false; // rover shut down
        }
    }
    true
}

/// Parse a source-table body: one record per `\r\n` line, `STR` records
/// carry the mount point name (field 1), city (2), country (7) and the
/// station coordinates in decimal degrees (fields 9/10).
fn parse_source_table(body: &str) -> Vec<SourceTableEntry> {
    let mut entries = Vec::new();
    for line in body.split("\r\n") {
        let fields: Vec<&str> = line.split(';').collect();
        if fields[0] != "STR" {
            continue;
        }
        if fields.len() < 11 {
            warn!("NTRIP: short STR record: {line}");
            continue;
        }
        let (latitude, longitude) = match (fields[9].parse(), fields[10].parse()) {
            (Ok(lat), Ok(lon)) => (lat, lon),
            _ => {
                warn!("NTRIP: unparsable coordinates in STR record: {line}");
                continue;
            }
        };
        entries.push(SourceTableEntry {
            mountpoint: fields[1].to_string(),
            city: fields[2].to_string(),
            country: fields[7].to_string(),
            latitude,
            longitude,
        });
    }
    entries
}

/// Closest entry strictly within [`MAX_DISTANCE_KM`], with its distance.
fn closest_entry(
    entries: &[SourceTableEntry],
    lat: f64,
    lon: f64,
) -> Option<(&SourceTableEntry, f64)> {
    let mut best: Option<(&SourceTableEntry, f64)> = None;
    for entry in entries {
        let distance = haversine_km(lat, lon, entry.latitude, entry.longitude);
        debug!("NTRIP: mount point {} at {distance:.1} km", entry.mountpoint);
        if distance < MAX_DISTANCE_KM && best.map_or(true, |(_, d)| distance < d) {
            best = Some((entry, distance));
        }
    }
    best
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1) = (lat1.to_radians(), lon1.to_radians());
    let (lat2, lon2) = (lat2.to_radians(), lon2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}
