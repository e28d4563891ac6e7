//! CRC16 used by the wrapper handshake trailer.
//!
//! Reflected polynomial 0xA001, register preset to 0xFFFF, no final XOR.
//! The value is appended big-endian.

const INITIAL_CRC: u16 = 0xFFFF;
const POLY: u16 = 0xA001;

static CRC_TABLE: once_cell::sync::Lazy<[u16; 256]> = once_cell::sync::Lazy::new(|| {
    let mut table = [0u16; 256];
    for (b, slot) in table.iter_mut().enumerate() {
        let mut v = b as u16;
        for _ in 0..8 {
            if v & 1 == 1 {
                v = (v >> 1) ^ POLY;
            } else {
                v >>= 1;
            }
        }
        *slot = v;
    }
    table
});

pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(INITIAL_CRC, |crc, &byte| {
        (crc >> 8) ^ CRC_TABLE[((crc ^ u16::from(byte)) & 0xFF) as usize]
    })
}

pub fn crc16_be_bytes(data: &[u8]) -> [u8; 2] {
    crc16(data).to_be_bytes()
}
