//! CRC-16/ARC checksum used for packet payloads.
//!
//! Reflected polynomial `0x8005` (`0xA001` reversed), initial value `0`, no
//! final xor. The lookup table is built at compile time.

const POLY: u16 = 0xA001;

static TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the CRC-16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        (crc >> 8) ^ TABLE[((crc ^ b as u16) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn test_empty() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_single_bit_change_detected() {
        let a = crc16(b"hello world");
        let b = crc16(b"hello worle");
        assert_ne!(a, b);
    }
}
