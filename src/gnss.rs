//! NMEA 0183 fix tracking for the GNSS receiver.
//!
//! Parses checksum-validated GGA, RMC and GSA sentences coming in over the
//! serial link and maintains the latest fix snapshot.  The rover gates
//! automatic mount-point selection on the first valid fix, so `ingest`
//! reports the no-fix to fix transition to its caller.

const KNOTS_TO_MS: f64 = 0.5144;

const FIX_QUALITY_NAMES: [&str; 6] = ["No fix", "GPS", "DGPS", "", "RTK/Fix", "RTK/Float"];

/// Human-readable label for a GGA fix-quality value.
pub fn quality_name(quality: u8) -> &'static str {
    match FIX_QUALITY_NAMES.get(quality as usize).copied() {
        Some(name) if !name.is_empty() => name,
        _ => "Unknown",
    }
}

/// Latest known receiver state, merged from GGA, RMC and GSA sentences.
///
/// Fields keep their previous value when a sentence omits them; a fix is
/// valid while `fix_quality` is greater than zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpsFix {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed_knots: f64,
    pub speed_ms: f64,
    pub heading_degrees: f64,
    pub hdop: f64,
    pub fix_quality: u8,
    pub fix_mode: u8,
}

impl GpsFix {
    pub fn has_fix(&self) -> bool {
        self.fix_quality > 0
    }

    /// Feed one NMEA sentence.  Returns true when this sentence took the
    /// receiver from no-fix to fix.
    pub fn ingest(&mut self, sentence: &str) -> bool {
        let had_fix = self.has_fix();
        self.parse(sentence);
        !had_fix && self.has_fix()
    }

    fn parse(&mut self, sentence: &str) {
        let sentence = sentence.trim();
        if !checksum_ok(sentence) {
            return;
        }
        // checksum_ok guarantees the leading '$' and the '*' separator
        let star = sentence.find('*').unwrap_or(sentence.len());
        let fields: Vec<&str> = sentence[1..star].split(',').collect();

        // Dispatch on the sentence type with the 2-char talker ID stripped.
        let kind = fields[0];
        if kind.len() > 2 && kind.ends_with("GGA") {
            self.parse_gga(&fields);
        } else if kind.len() > 2 && kind.ends_with("RMC") {
            self.parse_rmc(&fields);
        } else if kind.len() > 2 && kind.ends_with("GSA") {
            self.parse_gsa(&fields);
        }
    }

    fn parse_gga(&mut self, f: &[&str]) {
        if f.len() < 10 {
            return;
        }
        if let Some(lat) = parse_lat_lon(f[2], f[3]) {
            self.latitude = lat;
        }
        if let Some(lon) = parse_lat_lon(f[4], f[5]) {
            self.longitude = lon;
        }
        if let Ok(quality) = f[6].parse() {
            self.fix_quality = quality;
        }
        if let Ok(hdop) = f[8].parse() {
            self.hdop = hdop;
        }
        if let Ok(altitude) = f[9].parse() {
            self.altitude = altitude;
        }
    }

    fn parse_rmc(&mut self, f: &[&str]) {
        if f.len() < 10 {
            return;
        }
        if let Ok(time) = f[1].parse::<f64>() {
            self.hours = (time / 10000.0) as u32;
            self.minutes = ((time % 10000.0) / 100.0) as u32;
            self.seconds = time % 100.0;
        }
        // Receiver flags the solution invalid ("V"); quality comes back via
        // the next valid GGA.
        if f[2] != "A" {
            self.fix_quality = 0;
        }
        if let Some(lat) = parse_lat_lon(f[3], f[4]) {
            self.latitude = lat;
        }
        if let Some(lon) = parse_lat_lon(f[5], f[6]) {
            self.longitude = lon;
        }
        if let Ok(knots) = f[7].parse::<f64>() {
            self.speed_knots = knots;
            self.speed_ms = knots * KNOTS_TO_MS;
        }
        if let Ok(heading) = f[8].parse() {
            self.heading_degrees = heading;
        }
        if let Ok(date) = f[9].parse::<u32>() {
            self.day = date / 10000;
            self.month = (date / 100) % 100;
            self.year = (date % 100) as i32 + 2000;
        }
    }

    fn parse_gsa(&mut self, f: &[&str]) {
        if f.len() < 17 {
            return;
        }
        if let Ok(mode) = f[2].parse() {
            self.fix_mode = mode;
        }
        if let Ok(hdop) = f[15].parse() {
            self.hdop = hdop;
        }
    }
}

/// Convert an NMEA coordinate (`DDMM.mmmm` / `DDDMM.mmmm`) plus hemisphere
/// indicator to signed decimal degrees.
fn parse_lat_lon(value: &str, hemisphere: &str) -> Option<f64> {
    let raw: f64 = value.parse().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let mut decimal = degrees + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

/// Validate the XOR checksum between `$` and `*` against the trailing hex.
fn checksum_ok(sentence: &str) -> bool {
    if !sentence.starts_with('$') {
        return false;
    }
    let star = match sentence.rfind('*') {
        Some(i) => i,
        None => return false,
    };
    let received = match u8::from_str_radix(&sentence[star + 1..], 16) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let computed = sentence.as_bytes()[1..star]
        .iter()
        .fold(0u8, |acc, b| acc ^ b);
    computed == received
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    /// Append a valid checksum to a sentence body (no leading `$`).
    fn with_checksum(body: &str) -> String {
        let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${body}*{sum:02X}")
    }

    #[test]
    fn gga_updates_position_and_quality() {
        let mut fix = GpsFix::default();
        assert!(fix.ingest(GGA));
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        assert!((fix.longitude - 11.5167).abs() < 1e-4);
        assert_eq!(fix.fix_quality, 1);
        assert!((fix.hdop - 0.9).abs() < 1e-9);
        assert!((fix.altitude - 545.4).abs() < 1e-9);
        assert!(fix.has_fix());
    }

    #[test]
    fn rmc_updates_time_speed_and_date() {
        let mut fix = GpsFix::default();
        fix.ingest(RMC);
        assert_eq!((fix.hours, fix.minutes), (12, 35));
        assert!((fix.seconds - 19.0).abs() < 1e-9);
        assert!((fix.speed_knots - 22.4).abs() < 1e-9);
        assert!((fix.speed_ms - 22.4 * 0.5144).abs() < 1e-9);
        assert!((fix.heading_degrees - 84.4).abs() < 1e-9);
        assert_eq!((fix.year, fix.month, fix.day), (1994, 3, 23));
    }

    #[test]
    fn fix_acquisition_fires_once() {
        let no_fix = with_checksum("GPGGA,123518,,,,,0,00,,,M,,M,,");
        let mut fix = GpsFix::default();
        assert!(!fix.ingest(&no_fix));
        assert!(!fix.has_fix());
        assert!(fix.ingest(GGA));
        // Already fixed, so a further valid sentence is not a transition.
        assert!(!fix.ingest(GGA));
    }

    #[test]
    fn rmc_void_status_clears_fix() {
        let void = with_checksum("GNRMC,202521.36,V,,,,,,,090823,,,N");
        let mut fix = GpsFix::default();
        fix.ingest(GGA);
        assert!(fix.has_fix());
        fix.ingest(&void);
        assert!(!fix.has_fix());
        // Position survives the invalidation.
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        // The next valid GGA is a new acquisition event.
        assert!(fix.ingest(GGA));
    }

    #[test]
    fn gsa_updates_mode_and_hdop() {
        let gsa = with_checksum("GNGSA,A,3,05,07,09,13,14,17,19,30,,,,,1.8,1.2,0.9");
        let mut fix = GpsFix::default();
        fix.ingest(&gsa);
        assert_eq!(fix.fix_mode, 3);
        assert!((fix.hdop - 1.8).abs() < 1e-9);
    }

    #[test]
    fn bad_checksum_is_dropped() {
        let mut fix = GpsFix::default();
        let tampered = GGA.replace("*47", "*46");
        assert!(!fix.ingest(&tampered));
        assert_eq!(fix, GpsFix::default());
        assert!(!fix.ingest("$GPGGA,123519,4807.038,N"));
        assert!(!fix.ingest("no nmea at all"));
        assert_eq!(fix, GpsFix::default());
    }

    #[test]
    fn short_sentences_are_ignored() {
        let mut fix = GpsFix::default();
        fix.ingest(&with_checksum("GPGGA,123519,4807.038,N"));
        assert_eq!(fix, GpsFix::default());
        fix.ingest(&with_checksum("GNGSA,A,3"));
        assert_eq!(fix, GpsFix::default());
    }

    #[test]
    fn empty_fields_leave_state_unchanged() {
        let mut fix = GpsFix::default();
        fix.ingest(GGA);
        let sparse = with_checksum("GPGGA,123520,,,,,1,08,,,M,46.9,M,,");
        fix.ingest(&sparse);
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        assert!((fix.altitude - 545.4).abs() < 1e-9);
    }

    #[test]
    fn talker_id_is_ignored() {
        let mut fix = GpsFix::default();
        let gn = with_checksum("GNGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        assert!(fix.ingest(&gn));
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
    }

    #[test]
    fn lat_lon_boundaries() {
        assert_eq!(parse_lat_lon("0000.0000", "N"), Some(0.0));
        assert_eq!(parse_lat_lon("9000.0000", "S"), Some(-90.0));
        assert_eq!(parse_lat_lon("", "N"), None);
        let lon = parse_lat_lon("01131.000", "W").unwrap();
        assert!((lon + 11.5167).abs() < 1e-4);
    }

    #[test]
    fn quality_names() {
        assert_eq!(quality_name(0), "No fix");
        assert_eq!(quality_name(4), "RTK/Fix");
        assert_eq!(quality_name(3), "Unknown");
        assert_eq!(quality_name(9), "Unknown");
    }
}
