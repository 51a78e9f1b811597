//! Rover configuration file parser.
//!
//! Parses the INI-style `config.ini` with `[ntrip]`, `[serial]` and
//! `[output]` sections.  Unknown keys are ignored; missing keys keep their
//! compiled-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, RoverError};
use crate::serial;

/// Sentinel value for `ntrip/mountpoint` and `serial/port`.
pub const AUTO: &str = "auto";

// Defaults
const NTRIP_HOST: &str = "crtk.net";
const NTRIP_PORT: u16 = 2101;
const NTRIP_CREDENTIAL: &str = "centipede";
const SERIAL_PORT: &str = "/dev/ttyACM0";
const SERIAL_BAUD: u32 = 115200;
const GPS_RATE_HZ: u32 = 10;
const OUTPUT_FILE: &str = "output.txt";
const OUTPUT_PORT: u16 = 1298;

/// Where NMEA output goes, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMethod {
    False,
    Stdout,
    File,
    Socket,
}

/// How NMEA output is formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Nmea,
    Csv,
    Json,
}

/// Full rover configuration.
#[derive(Debug, Clone)]
pub struct RoverConfig {
    // ── NTRIP caster ──────────────────────────────────────────────────────────
    /// Caster hostname or IP address.
    pub ntrip_host: String,
    /// Caster TCP port.
    pub ntrip_port: u16,
    /// Mount point id, or `auto` for geographic selection.
    pub mountpoint: String,
    pub username: String,
    pub password: String,
    // ── GNSS receiver ─────────────────────────────────────────────────────────
    /// Serial device path, or `auto` for autodetection.
    pub serial_port: String,
    pub serial_baud: u32,
    /// Requested measurement rate in Hz.
    pub gps_rate: u32,
    // ── Output fan-out ────────────────────────────────────────────────────────
    pub output_method: OutputMethod,
    pub output_type: OutputType,
    pub output_file: PathBuf,
    pub output_port: u16,
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self {
            ntrip_host:    NTRIP_HOST.to_string(),
            ntrip_port:    NTRIP_PORT,
            mountpoint:    AUTO.to_string(),
            username:      NTRIP_CREDENTIAL.to_string(),
            password:      NTRIP_CREDENTIAL.to_string(),
            serial_port:   SERIAL_PORT.to_string(),
            serial_baud:   SERIAL_BAUD,
            gps_rate:      GPS_RATE_HZ,
            output_method: OutputMethod::False,
            output_type:   OutputType::Nmea,
            output_file:   PathBuf::from(OUTPUT_FILE),
            output_port:   OUTPUT_PORT,
        }
    }
}

/// Parse `path` as an INI configuration file.
pub fn load_config(path: &Path) -> Result<RoverConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| RoverError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_config(&content))
}

fn parse_config(content: &str) -> RoverConfig {
    let mut cfg = RoverConfig::default();
    let mut section = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_ascii_lowercase();
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match (section.as_str(), key.as_str()) {
            ("ntrip", "host")        => cfg.ntrip_host  = val,
            ("ntrip", "port")        => cfg.ntrip_port  = val.parse().unwrap_or(NTRIP_PORT),
            ("ntrip", "mountpoint")  => cfg.mountpoint  = val,
            ("ntrip", "username")    => cfg.username    = val,
            ("ntrip", "password")    => cfg.password    = val,
            ("serial", "port")       => cfg.serial_port = val,
            ("serial", "baud")       => cfg.serial_baud = val.parse().unwrap_or(SERIAL_BAUD),
            ("serial", "frequency")  => cfg.gps_rate    = val.parse().unwrap_or(GPS_RATE_HZ),
            ("output", "output") => {
                cfg.output_method = match val.to_ascii_lowercase().as_str() {
                    "socket" => OutputMethod::Socket,
                    "file"   => OutputMethod::File,
                    "stdout" => OutputMethod::Stdout,
                    _        => OutputMethod::False,
                };
            }
            ("output", "output_type") => {
                cfg.output_type = match val.to_ascii_lowercase().as_str() {
                    "csv"  => OutputType::Csv,
                    "json" => OutputType::Json,
                    _      => OutputType::Nmea,
                };
            }
            ("output", "filename")   => cfg.output_file = PathBuf::from(&val),
            ("output", "port")       => cfg.output_port = val.parse().unwrap_or(OUTPUT_PORT),
            _ => {} // ignore unknown keys
        }
    }

    cfg
}

/// Validate that the configuration can actually start the rover.
pub fn validate_config(cfg: &RoverConfig) -> Result<()> {
    if cfg.ntrip_host.is_empty() {
        return Err(RoverError::Config("ntrip/host is required".into()));
    }
    if cfg.mountpoint.is_empty() {
        return Err(RoverError::Config(
            "ntrip/mountpoint is required (or \"auto\")".into(),
        ));
    }
    if cfg.gps_rate == 0 {
        return Err(RoverError::Config(
            "serial/frequency must be at least 1 Hz".into(),
        ));
    }
    if serial::baud_rate(cfg.serial_baud).is_none() {
        return Err(RoverError::Config(format!(
            "unsupported serial/baud {}",
            cfg.serial_baud
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file_content() {
        let cfg = parse_config("");
        assert_eq!(cfg.ntrip_host, "crtk.net");
        assert_eq!(cfg.ntrip_port, 2101);
        assert_eq!(cfg.mountpoint, "auto");
        assert_eq!(cfg.serial_baud, 115200);
        assert_eq!(cfg.gps_rate, 10);
        assert_eq!(cfg.output_method, OutputMethod::False);
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn full_file_is_parsed() {
        let cfg = parse_config(
            "# rover config\n\
             [ntrip]\n\
             host = caster.example.org\n\
             port = 2102\n\
             mountpoint = NEAR5\n\
             username = user\n\
             password = secret\n\
             \n\
             [serial]\n\
             port = /dev/ttyUSB1\n\
             baud = 38400\n\
             frequency = 5\n\
             \n\
             [output]\n\
             output = socket\n\
             output_type = json\n\
             port = 9000\n",
        );
        assert_eq!(cfg.ntrip_host, "caster.example.org");
        assert_eq!(cfg.ntrip_port, 2102);
        assert_eq!(cfg.mountpoint, "NEAR5");
        assert_eq!(cfg.username, "user");
        assert_eq!(cfg.password, "secret");
        assert_eq!(cfg.serial_port, "/dev/ttyUSB1");
        assert_eq!(cfg.serial_baud, 38400);
        assert_eq!(cfg.gps_rate, 5);
        assert_eq!(cfg.output_method, OutputMethod::Socket);
        assert_eq!(cfg.output_type, OutputType::Json);
        assert_eq!(cfg.output_port, 9000);
    }

    #[test]
    fn keys_outside_their_section_are_ignored() {
        let cfg = parse_config("[serial]\nhost = elsewhere\n[ntrip]\nbaud = 9600\n");
        assert_eq!(cfg.ntrip_host, "crtk.net");
        assert_eq!(cfg.serial_baud, 115200);
    }

    #[test]
    fn comments_and_unknown_keys_are_ignored() {
        let cfg = parse_config(
            "[ntrip]\n; legacy\n# comment\nhost = h\nnot_a_key = whatever\n",
        );
        assert_eq!(cfg.ntrip_host, "h");
    }

    #[test]
    fn output_file_settings() {
        let cfg = parse_config("[output]\noutput = file\noutput_type = csv\nfilename = /tmp/track.csv\n");
        assert_eq!(cfg.output_method, OutputMethod::File);
        assert_eq!(cfg.output_type, OutputType::Csv);
        assert_eq!(cfg.output_file, PathBuf::from("/tmp/track.csv"));
    }

    #[test]
    fn validation_rejects_broken_configs() {
        let mut cfg = RoverConfig::default();
        cfg.gps_rate = 0;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = RoverConfig::default();
        cfg.serial_baud = 12345;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = RoverConfig::default();
        cfg.mountpoint = String::new();
        assert!(validate_config(&cfg).is_err());
    }
}
