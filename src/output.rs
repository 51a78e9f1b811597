//! Optional NMEA output fan-out.
//!
//! Re-emits each NMEA sentence, or a CSV/JSON record derived from the fix it
//! advances, to stdout, an append-only file, or every client of a local TCP
//! server.  Output failures never stop the rover: a method that cannot be
//! set up is disabled with a warning.

use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::{SecondsFormat, TimeZone, Timelike, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::{OutputMethod, OutputType, RoverConfig};
use crate::gnss::GpsFix;

const CSV_HEADER: &str =
    "timestamp,latitude,longitude,altitude,fix_quality,fix_mode,speed_ms,heading_degrees,hdop";

/// Fan-out capacity per TCP client before a slow one starts losing lines.
const CLIENT_BACKLOG: usize = 64;

#[derive(Serialize)]
struct FixRecord {
    timestamp: String,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    fix_quality: u8,
    fix_mode: u8,
    speed_ms: f64,
    heading_degrees: f64,
    hdop: f64,
}

impl FixRecord {
    fn from_fix(fix: &GpsFix) -> FixRecord {
        FixRecord {
            timestamp: timestamp(fix),
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.altitude,
            fix_quality: fix.fix_quality,
            fix_mode: fix.fix_mode,
            speed_ms: fix.speed_ms,
            heading_degrees: fix.heading_degrees,
            hdop: fix.hdop,
        }
    }
}

pub struct OutputHandler {
    method: OutputMethod,
    format: OutputType,
    fix: GpsFix,
    csv_header_written: bool,
    file: Option<File>,
    socket_tx: Option<broadcast::Sender<String>>,
}

impl OutputHandler {
    /// Set up the configured output method.  File-open and listener-bind
    /// failures disable output instead of failing startup.
    pub async fn bind(cfg: &RoverConfig) -> OutputHandler {
        let mut method = cfg.output_method;
        let mut file = None;
        let mut socket_tx = None;

        match method {
            OutputMethod::File => {
                match OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&cfg.output_file)
                {
                    Ok(f) => file = Some(f),
                    Err(e) => {
                        warn!(
                            "Output: cannot open {}: {e}; output disabled",
                            cfg.output_file.display()
                        );
                        method = OutputMethod::False;
                    }
                }
            }
            OutputMethod::Socket => {
                match TcpListener::bind(("0.0.0.0", cfg.output_port)).await {
                    Ok(listener) => {
                        info!("Output: TCP server listening on port {}", cfg.output_port);
                        let (tx, _) = broadcast::channel(CLIENT_BACKLOG);
                        tokio::spawn(serve_clients(listener, tx.clone()));
                        socket_tx = Some(tx);
                    }
                    Err(e) => {
                        warn!(
                            "Output: cannot listen on port {}: {e}; output disabled",
                            cfg.output_port
                        );
                        method = OutputMethod::False;
                    }
                }
            }
            OutputMethod::Stdout | OutputMethod::False => {}
        }

        OutputHandler {
            method,
            format: cfg.output_type,
            fix: GpsFix::default(),
            csv_header_written: false,
            file,
            socket_tx,
        }
    }

    /// Handle one NMEA sentence from the receiver.
    pub fn process(&mut self, sentence: &str) {
        if self.method == OutputMethod::False {
            return;
        }
        if let Some(line) = self.render(sentence) {
            self.write_line(&line);
        }
    }

    /// Format the sentence per the configured output type.  CSV and JSON
    /// only emit once the tracked fix is valid.
    fn render(&mut self, sentence: &str) -> Option<String> {
        match self.format {
            OutputType::Nmea => Some(sentence.to_string()),
            OutputType::Csv | OutputType::Json => {
                self.fix.ingest(sentence);
                if !self.fix.has_fix() {
                    return None;
                }
                match self.format {
                    OutputType::Csv => {
                        let row = csv_row(&self.fix);
                        if self.csv_header_written {
                            Some(row)
                        } else {
                            self.csv_header_written = true;
                            Some(format!("{CSV_HEADER}\n{row}"))
                        }
                    }
                    OutputType::Json => {
                        serde_json::to_string(&FixRecord::from_fix(&self.fix)).ok()
                    }
                    OutputType::Nmea => unreachable!(),
                }
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        match self.method {
            OutputMethod::Stdout => println!("{line}"),
            OutputMethod::File => {
                if let Some(file) = &mut self.file {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!("Output: file write failed: {e}");
                    }
                }
            }
            OutputMethod::Socket => {
                if let Some(tx) = &self.socket_tx {
                    // No receiver just means no client is connected.
                    let _ = tx.send(line.to_string());
                }
            }
            OutputMethod::False => {}
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = &mut self.file {
            if let Err(e) = file.flush() {
                warn!("Output: flush failed: {e}");
            }
        }
    }
}

/// Accept loop for the socket method; every client gets its own forwarder.
async fn serve_clients(listener: TcpListener, tx: broadcast::Sender<String>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Output: client connected: {peer}");
                let rx = tx.subscribe();
                tokio::spawn(forward_to_client(stream, rx));
            }
            Err(e) => {
                warn!("Output: accept failed: {e}");
            }
        }
    }
}

async fn forward_to_client(
    mut stream: tokio::net::TcpStream,
    mut rx: broadcast::Receiver<String>,
) {
    loop {
        let line = match rx.recv().await {
            Ok(line) => line,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Output: slow client skipped {n} lines");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if stream.write_all(line.as_bytes()).await.is_err()
            || stream.write_all(b"\n").await.is_err()
        {
            break;
        }
    }
    info!("Output: client disconnected");
}

fn csv_row(fix: &GpsFix) -> String {
    format!(
        "{},{:.8},{:.8},{:.3},{},{},{:.3},{:.2},{:.2}",
        timestamp(fix),
        fix.latitude,
        fix.longitude,
        fix.altitude,
        fix.fix_quality,
        fix.fix_mode,
        fix.speed_ms,
        fix.heading_degrees,
        fix.hdop
    )
}

/// ISO-8601 UTC timestamp from the fix date/time; empty until the receiver
/// has reported a date (RMC).
fn timestamp(fix: &GpsFix) -> String {
    let seconds = fix.seconds as u32;
    let millis = (((fix.seconds - seconds as f64) * 1000.0).round() as u32).min(999);
    Utc.with_ymd_and_hms(fix.year, fix.month, fix.day, fix.hours, fix.minutes, seconds)
        .single()
        .and_then(|dt| dt.with_nanosecond(millis * 1_000_000))
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    fn handler(format: OutputType) -> OutputHandler {
        OutputHandler {
            method: OutputMethod::Stdout,
            format,
            fix: GpsFix::default(),
            csv_header_written: false,
            file: None,
            socket_tx: None,
        }
    }

    #[test]
    fn nmea_passthrough_is_verbatim() {
        let mut out = handler(OutputType::Nmea);
        assert_eq!(out.render(GGA), Some(GGA.to_string()));
    }

    #[test]
    fn csv_emits_header_once() {
        let mut out = handler(OutputType::Csv);
        out.fix.ingest(RMC); // date for the timestamp
        let first = out.render(GGA).unwrap();
        let mut lines = first.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row = lines.next().unwrap();
        assert!(row.starts_with("1994-03-23T12:35:19.000Z,"));
        assert!(row.contains(",48.11730000,"));

        let second = out.render(GGA).unwrap();
        assert!(!second.contains("timestamp"));
        assert_eq!(second.lines().count(), 1);
    }

    #[test]
    fn csv_and_json_wait_for_a_fix() {
        let no_fix = "$GPGGA,123518,,,,,0,00,,,M,,M,,*7B";
        // Compute the real checksum rather than trusting the literal above.
        let body = &no_fix[1..no_fix.len() - 3];
        let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        let no_fix = format!("${body}*{sum:02X}");

        let mut out = handler(OutputType::Csv);
        assert_eq!(out.render(&no_fix), None);
        let mut out = handler(OutputType::Json);
        assert_eq!(out.render(&no_fix), None);
        assert!(out.render(GGA).is_some());
    }

    #[test]
    fn json_record_has_the_expected_keys() {
        let mut out = handler(OutputType::Json);
        out.fix.ingest(RMC);
        let line = out.render(GGA).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "timestamp",
            "latitude",
            "longitude",
            "altitude",
            "fix_quality",
            "fix_mode",
            "speed_ms",
            "heading_degrees",
            "hdop",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(object["fix_quality"], 1);
        assert_eq!(object["timestamp"], "1994-03-23T12:35:19.000Z");
        // Compact: one line, no pretty-printing.
        assert_eq!(line.lines().count(), 1);
        assert!(!line.contains("  "));
    }

    #[test]
    fn timestamp_is_empty_without_a_date() {
        let fix = GpsFix::default();
        assert_eq!(timestamp(&fix), "");
    }

    #[test]
    fn disabled_output_renders_nothing() {
        let mut out = handler(OutputType::Nmea);
        out.method = OutputMethod::False;
        out.process(GGA); // must not panic or write
    }
}
