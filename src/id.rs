//! Sortable message identifiers.
//!
//! 26 characters over the Crockford base-32 alphabet: a 10-character
//! millisecond-timestamp prefix (MSB first) followed by 16 random characters
//! carrying 80 bits of entropy. Byte-wise lexicographic order agrees with
//! mint order on a non-retrograde clock; within a millisecond, collisions are
//! prevented only probabilistically.

use rand::RngCore as _;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const TIME_LEN: usize = 10;
const RAND_LEN: usize = 16;

/// Total identifier length in characters.
pub const ID_LEN: usize = TIME_LEN + RAND_LEN;

/// Mint a new identifier from the current wall clock.
pub fn mint() -> String {
    mint_at(chrono::Utc::now().timestamp_millis().max(0) as u64)
}

/// Mint an identifier for a specific millisecond timestamp.
pub fn mint_at(ms: u64) -> String {
    let mut out = Vec::with_capacity(ID_LEN);

    // 10 base-32 digits cover 50 bits, enough for any 48-bit ms timestamp.
    for position in (0..TIME_LEN).rev() {
        let index = ((ms >> (position * 5)) & 0x1f) as usize;
        out.push(ALPHABET[index]);
    }

    let mut entropy = [0u8; RAND_LEN];
    rand::rng().fill_bytes(&mut entropy);
    for byte in entropy {
        out.push(ALPHABET[(byte & 0x1f) as usize]);
    }

    String::from_utf8(out).expect("alphabet is ASCII")
}

/// Decode the millisecond timestamp prefix of an identifier.
///
/// Returns `None` when the input is not a well-formed 26-character id.
pub fn timestamp_ms(id: &str) -> Option<u64> {
    let bytes = id.as_bytes();
    if bytes.len() != ID_LEN {
        return None;
    }

    let mut ms: u64 = 0;
    for &byte in &bytes[..TIME_LEN] {
        ms = (ms << 5) | u64::from(digit_value(byte)?);
    }

    if bytes[TIME_LEN..].iter().all(|&b| digit_value(b).is_some()) {
        Some(ms)
    } else {
        None
    }
}

fn digit_value(byte: u8) -> Option<u8> {
    ALPHABET.iter().position(|&a| a == byte).map(|p| p as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_have_expected_shape() {
        let id = mint();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)), "bad id: {id}");
    }

    #[test]
    fn timestamp_prefix_round_trips() {
        let before = chrono::Utc::now().timestamp_millis() as u64;
        let id = mint();
        let after = chrono::Utc::now().timestamp_millis() as u64;

        let decoded = timestamp_ms(&id).expect("valid id");
        assert!(decoded >= before && decoded <= after);
    }

    #[test]
    fn explicit_timestamps_round_trip_exactly() {
        for ms in [0u64, 1, 1_700_000_000_000, (1 << 48) - 1] {
            let id = mint_at(ms);
            assert_eq!(timestamp_ms(&id), Some(ms));
        }
    }

    #[test]
    fn ids_sort_by_mint_time() {
        let earlier = mint_at(1_700_000_000_000);
        let later = mint_at(1_700_000_000_001);
        assert!(earlier < later);

        let first = mint();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = mint();
        assert!(first < second, "{first} should sort before {second}");
    }

    #[test]
    fn malformed_ids_do_not_decode() {
        assert_eq!(timestamp_ms(""), None);
        assert_eq!(timestamp_ms("short"), None);
        // 'U' is excluded from the Crockford alphabet.
        assert_eq!(timestamp_ms(&"U".repeat(ID_LEN)), None);
        assert_eq!(timestamp_ms(&"0".repeat(ID_LEN - 1)), None);
    }
}
