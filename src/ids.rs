//! Sortable, prefixed entity identifiers.
//!
//! An id is `{prefix}_{26 base32-hex chars}`: an 8-byte millisecond timestamp
//! followed by 8 random bytes, both base32-hex encoded (Crockford-style
//! alphabet, no padding). Two ids minted later always sort lexicographically
//! after ids minted earlier, which keeps `ORDER BY id` equivalent to
//! `ORDER BY created_at` without an extra column.

use rand::RngCore as _;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn encode_base32(data: [u8; 16]) -> String {
    // Prefix a zero byte so the buffer holds [2 zero pad bits][128 data bits]
    // starting at bit offset 6, then walk 26 groups of 5 bits to bit 136.
    let mut buf = [0u8; 17];
    buf[1..].copy_from_slice(&data);

    let mut out = String::with_capacity(26);
    let mut bit_offset = 6usize;
    for _ in 0..26 {
        let mut value: u16 = 0;
        for b in 0..5 {
            let bit_index = bit_offset + b;
            let byte_index = bit_index / 8;
            let bit_in_byte = 7 - (bit_index % 8);
            let bit = (buf[byte_index] >> bit_in_byte) & 1;
            value = (value << 1) | bit as u16;
        }
        out.push(ALPHABET[value as usize] as char);
        bit_offset += 5;
    }
    out
}

/// Generate a fresh sortable id with the given entity prefix, e.g. `job`,
/// `msg`, `agt`, `org`, `usr`, `chn`, `asg`.
pub fn generate(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut random = [0u8; 8];
    rand::rng().fill_bytes(&mut random);

    let mut payload = [0u8; 16];
    payload[0..8].copy_from_slice(&millis.to_be_bytes());
    payload[8..16].copy_from_slice(&random);

    format!("{prefix}_{}", encode_base32(payload))
}
