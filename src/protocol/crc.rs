//! CCITT CRC-16 used as the serial frame check sequence.
//!
//! Reflected polynomial 0x8408, initial value 0xffff, no final XOR.

/// Initial FCS value.
pub const FCS_INIT: u16 = 0xffff;

/// Folds one byte into a running CRC.
#[must_use]
pub const fn crc_ccitt_update(crc: u16, byte: u8) -> u16 {
    let mut data = byte ^ (crc as u8);
    data ^= data << 4;
    let data = data as u16;
    ((data << 8) | (crc >> 8)) ^ (data >> 4) ^ (data << 3)
}

/// CRC over a whole slice, starting from [`FCS_INIT`].
#[must_use]
pub fn crc_ccitt(data: &[u8]) -> u16 {
    data.iter()
        .fold(FCS_INIT, |crc, &byte| crc_ccitt_update(crc, byte))
}
