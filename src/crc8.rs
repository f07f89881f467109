//! CRC-8/MAXIM (Dallas/iButton) checksum.
//!
//! Polynomial `x^8 + x^5 + x^4 + 1`, reflected input and output, initial value 0, no final XOR.
//! The lookup table is built by a `const fn`, so it exists once in the binary and is never
//! recomputed at run time.

/// Reflected form of the 0x31 polynomial.
const POLY_REFLECTED: u8 = 0x8C;

/// The 256-entry lookup table.
pub static TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the checksum of `bytes`.
pub fn compute(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |crc, &b| TABLE[(crc ^ b) as usize])
}
