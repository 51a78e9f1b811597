//! UBX (u-blox binary protocol) frame encoding.
//!
//! Only the two configuration messages the rover sends: CFG-RATE to set the
//! measurement rate and MON-VER to query the receiver version.

pub const SYNC1: u8 = 0xB5;
pub const SYNC2: u8 = 0x62;

pub const CLASS_CFG: u8 = 0x06;
pub const ID_CFG_RATE: u8 = 0x08;
pub const CLASS_MON: u8 = 0x0A;
pub const ID_MON_VER: u8 = 0x04;

/// Encode a UBX frame: sync chars, class, id, little-endian payload length,
/// payload, Fletcher-8 checksum over everything between sync and checksum.
pub fn encode(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.push(SYNC1);
    frame.push(SYNC2);
    frame.push(class);
    frame.push(id);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    let (ck_a, ck_b) = fletcher8(&frame[2..]);
    frame.push(ck_a);
    frame.push(ck_b);
    frame
}

/// 8-bit Fletcher checksum (`ck_a += byte; ck_b += ck_a`, both wrapping).
pub fn fletcher8(data: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &b in data {
        ck_a = ck_a.wrapping_add(b);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

/// CFG-RATE: measurement period in milliseconds (little-endian at payload
/// offsets 0-1), one navigation solution per measurement, UTC time reference.
pub fn cfg_rate(rate_hz: u32) -> Vec<u8> {
    let period_ms = (1000 / rate_hz.max(1)) as u16;
    let mut payload = [0u8; 6];
    payload[0..2].copy_from_slice(&period_ms.to_le_bytes());
    payload[2..4].copy_from_slice(&1u16.to_le_bytes());
    encode(CLASS_CFG, ID_CFG_RATE, &payload)
}

/// MON-VER poll request (empty payload).
pub fn mon_ver() -> Vec<u8> {
    encode(CLASS_MON, ID_MON_VER, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Independent decoder: returns (class, id, payload) after validating
    /// the sync chars, length and checksum.
    fn decode(frame: &[u8]) -> Option<(u8, u8, Vec<u8>)> {
        if frame.len() < 8 || frame[0] != SYNC1 || frame[1] != SYNC2 {
            return None;
        }
        let len = u16::from_le_bytes([frame[4], frame[5]]) as usize;
        if frame.len() != len + 8 {
            return None;
        }
        let mut ck_a: u8 = 0;
        let mut ck_b: u8 = 0;
        for &b in &frame[2..6 + len] {
            ck_a = ck_a.wrapping_add(b);
            ck_b = ck_b.wrapping_add(ck_a);
        }
        if frame[6 + len..] != [ck_a, ck_b] {
            return None;
        }
        Some((frame[2], frame[3], frame[6..6 + len].to_vec()))
    }

    #[test]
    fn cfg_rate_payload_is_little_endian() {
        let frame = cfg_rate(10);
        let (class, id, payload) = decode(&frame).unwrap();
        assert_eq!((class, id), (CLASS_CFG, ID_CFG_RATE));
        // 10 Hz -> 100 ms period, navRate 1, timeRef UTC.
        assert_eq!(payload, vec![0x64, 0x00, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn cfg_rate_one_hertz() {
        let (_, _, payload) = decode(&cfg_rate(1)).unwrap();
        assert_eq!(&payload[0..2], &1000u16.to_le_bytes());
    }

    #[test]
    fn mon_ver_is_an_empty_poll() {
        let frame = mon_ver();
        assert_eq!(&frame[..6], &[SYNC1, SYNC2, CLASS_MON, ID_MON_VER, 0, 0]);
        let (class, id, payload) = decode(&frame).unwrap();
        assert_eq!((class, id), (CLASS_MON, ID_MON_VER));
        assert!(payload.is_empty());
    }

    #[test]
    fn encode_round_trips() {
        let cases: [(u8, u8, Vec<u8>); 4] = [
            (0x06, 0x08, vec![]),
            (0x0A, 0x04, vec![0xFF]),
            (0x01, 0x07, (0..92).collect()),
            (0xF0, 0x0F, vec![0x00; 300]),
        ];
        for (class, id, payload) in cases {
            let frame = encode(class, id, &payload);
            assert_eq!(decode(&frame), Some((class, id, payload)));
        }
    }

    #[test]
    fn checksum_catches_mutation() {
        let mut frame = cfg_rate(5);
        frame[7] ^= 0x10;
        assert_eq!(decode(&frame), None);
    }
}
