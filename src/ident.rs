//! Record identifiers: `c` followed by 24 lowercase base-36 characters.

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

pub const ID_LEN: usize = 25;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TIME_WIDTH: usize = 8;

static ID_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^c[a-z0-9]{24}$").expect("identifier pattern compiles"));

/// True when `id` already has the canonical shape.
pub fn is_canonical_id(id: &str) -> bool {
    ID_FORMAT.is_match(id)
}

/// Generate a fresh identifier: millisecond clock in base 36 (so ids sort
/// roughly by creation time) followed by random base-36 characters.
pub fn generate_id() -> String {
    let mut id = String::with_capacity(ID_LEN);
    id.push('c');

    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let clock = to_base36(millis);
    // Keep the low-order digits if the clock ever outgrows the slot.
    let clock = &clock[clock.len().saturating_sub(TIME_WIDTH)..];
    for _ in clock.len()..TIME_WIDTH {
        id.push('0');
    }
    id.push_str(clock);

    let mut rng = rand::thread_rng();
    while id.len() < ID_LEN {
        id.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    id
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}
