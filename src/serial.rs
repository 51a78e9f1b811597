//! GNSS receiver serial link.
//!
//! Opens the receiver's serial device raw (8-N-1, no flow control), writes
//! RTCM correction frames to it verbatim, and feeds `\r\n`-terminated NMEA
//! lines back as events from a blocking reader task.  UBX configuration
//! frames (CFG-RATE, MON-VER) are sent before the reader starts so the
//! version query owns the read side of the port.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};

use log::{info, warn};
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::config::AUTO;
use crate::error::{Result, RoverError};
use crate::ubx;

/// Bounded wait for the MON-VER reply: at most 100 reads of up to 1 s.
const VERSION_QUERY_ATTEMPTS: u32 = 100;
const VERSION_QUERY_VTIME: u8 = 10; // deciseconds

pub struct SerialLink {
    port: File,
    path: String,
}

impl SerialLink {
    /// Open and configure the device.  The sentinel `"auto"` picks the first
    /// ttyACM/ttyUSB device present.
    pub fn open(path: &str, baud: u32) -> Result<SerialLink> {
        let path = if path == AUTO {
            autodetect()?
        } else {
            path.to_string()
        };
        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RoverError::Serial(format!("cannot open {path}: {e}")))?;
        configure_port(&port, baud)
            .map_err(|e| RoverError::Serial(format!("cannot configure {path}: {e}")))?;
        info!("Serial: opened {path} at {baud} baud");
        Ok(SerialLink { port, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Write one RTCM frame to the receiver, byte-exact.
    pub fn write_rtcm(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)
    }

    /// Request `rate_hz` measurements per second via CFG-RATE.
    pub fn set_rate(&mut self, rate_hz: u32) -> io::Result<()> {
        self.port.write_all(&ubx::cfg_rate(rate_hz))
    }

    /// Poll MON-VER and scan the replies for a frame with matching class/id.
    /// Returns `None` when the receiver did not answer within the bounded
    /// wait (non-UBX receivers simply stay silent).
    pub fn query_version(&mut self) -> Result<Option<String>> {
        self.port.write_all(&ubx::mon_ver())?;

        // Bounded reads while the query runs, blocking reads afterwards.
        set_read_timing(&self.port, 0, VERSION_QUERY_VTIME)
            .map_err(|e| RoverError::Serial(format!("cannot set read timeout: {e}")))?;
        let mut response = Vec::new();
        let mut chunk = [0u8; 512];
        let mut version = None;
        for _ in 0..VERSION_QUERY_ATTEMPTS {
            let n = self.port.read(&mut chunk)?;
            if n == 0 {
                continue;
            }
            response.extend_from_slice(&chunk[..n]);
            if let Some(v) = parse_mon_ver(&response) {
                version = Some(v);
                break;
            }
        }
        set_read_timing(&self.port, 1, 0)
            .map_err(|e| RoverError::Serial(format!("cannot restore read mode: {e}")))?;
        Ok(version)
    }

    /// Spawn the blocking line reader.  Every complete line starting with
    /// `$` is sent over `tx`; anything else on the wire is discarded.
    pub fn spawn_reader(&self, tx: UnboundedSender<String>) -> Result<()> {
        let port = self.port.try_clone()?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = reader_loop(port, tx) {
                warn!("Serial: reader on {path} exited: {e}");
            }
        });
        Ok(())
    }
}

fn reader_loop(port: File, tx: UnboundedSender<String>) -> io::Result<()> {
    let mut reader = BufReader::new(port);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(()); // EOF, device went away
        }
        if !line.starts_with(b"$") {
            continue;
        }
        let sentence = String::from_utf8_lossy(&line).trim_end().to_string();
        if tx.send(sentence).is_err() {
            return Ok(()); // rover shut down
        }
    }
}

/// Pick the first usable serial device for the `"auto"` port sentinel.
fn autodetect() -> Result<String> {
    let names = fs::read_dir("/dev")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok());
    pick_port(names).ok_or_else(|| {
        RoverError::Serial("no ttyACM/ttyUSB device found for port autodetection".into())
    })
}

fn pick_port(names: impl Iterator<Item = String>) -> Option<String> {
    let mut candidates: Vec<String> = names
        .filter(|n| n.starts_with("ttyACM") || n.starts_with("ttyUSB"))
        .collect();
    candidates.sort();
    candidates.into_iter().next().map(|n| format!("/dev/{n}"))
}

/// Map a configured line rate onto the termios constant.
pub fn baud_rate(baud: u32) -> Option<BaudRate> {
    match baud {
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        230400 => Some(BaudRate::B230400),
        460800 => Some(BaudRate::B460800),
        _ => None,
    }
}

/// Configure the port raw: 8 data bits, no parity, one stop bit, no flow
/// control, no echo, no line discipline processing.
fn configure_port(file: &File, baud: u32) -> io::Result<()> {
    let rate = baud_rate(baud).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported baud rate {baud}"),
        )
    })?;

    let mut t = termios::tcgetattr(file).map_err(io_error)?;

    t.local_flags &= !(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ISIG);
    t.output_flags &= !OutputFlags::OPOST;
    t.input_flags &= !(InputFlags::IXON
        | InputFlags::IXOFF
        | InputFlags::IXANY
        | InputFlags::ISTRIP
        | InputFlags::INPCK
        | InputFlags::ICRNL
        | InputFlags::INLCR);
    // Clear the size/parity/stop bits before selecting 8-N-1.
    t.control_flags &= !(ControlFlags::CSIZE
        | ControlFlags::CSTOPB
        | ControlFlags::PARENB
        | ControlFlags::CRTSCTS);
    t.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;

    // VMIN=1, VTIME=0: block until at least one byte is available.
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::cfsetospeed(&mut t, rate).map_err(io_error)?;
    termios::cfsetispeed(&mut t, rate).map_err(io_error)?;
    termios::tcsetattr(file, SetArg::TCSANOW, &t).map_err(io_error)?;

    Ok(())
}

fn set_read_timing(file: &File, vmin: u8, vtime: u8) -> io::Result<()> {
    let mut t = termios::tcgetattr(file).map_err(io_error)?;
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = vmin;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = vtime;
    termios::tcsetattr(file, SetArg::TCSANOW, &t).map_err(io_error)?;
    Ok(())
}

fn io_error(e: nix::errno::Errno) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Find a MON-VER reply in `data` and extract its version strings.
///
/// Payload layout: 30-byte zero-padded software version, 10-byte hardware
/// version, then optional 30-byte extension blocks (ignored).
fn parse_mon_ver(data: &[u8]) -> Option<String> {
    let header = [ubx::SYNC1, ubx::SYNC2, ubx::CLASS_MON, ubx::ID_MON_VER];
    let pos = data.windows(4).position(|w| w == header)?;
    let rest = &data[pos..];
    if rest.len() < 6 {
        return None;
    }
    let len = u16::from_le_bytes([rest[4], rest[5]]) as usize;
    if len < 40 || rest.len() < len + 8 {
        return None;
    }
    let (ck_a, ck_b) = ubx::fletcher8(&rest[2..6 + len]);
    if rest[6 + len] != ck_a || rest[7 + len] != ck_b {
        return None;
    }
    let payload = &rest[6..6 + len];
    let software = zero_terminated(&payload[..30]);
    let hardware = zero_terminated(&payload[30..40]);
    Some(format!("software {software}, hardware {hardware}"))
}

fn zero_terminated(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}
