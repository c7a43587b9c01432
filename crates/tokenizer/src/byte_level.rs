//! GPT-2 byte-to-unicode table.
//!
//! Byte-level BPE never sees raw bytes: every byte is first mapped to a
//! printable unicode character so that vocab entries stay valid JSON strings
//! and whitespace/control bytes survive the merge step.

use std::collections::HashMap;

/// Maps each byte to the character GPT-2 vocabularies use for it.
///
/// Printable latin-1 bytes map to themselves, the remaining 68 bytes are
/// shifted into the range starting at U+0100 in ascending byte order.
pub fn bytes_to_unicode() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut shifted = 0u32;
    for byte in 0..=255u8 {
        let printable = matches!(byte, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
        table[byte as usize] = if printable {
            char::from(byte)
        } else {
            let c = char::from_u32(256 + shifted).unwrap_or(char::REPLACEMENT_CHARACTER);
            shifted += 1;
            c
        };
    }
    table
}

pub fn unicode_to_bytes(table: &[char; 256]) -> HashMap<char, u8> {
    table
        .iter()
        .enumerate()
        .map(|(byte, &c)| (c, byte as u8))
        .collect()
}
