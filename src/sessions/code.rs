//! Session codes: the short identifiers students type in to join.

use rand::Rng;

/// Alphabet for generated codes. `0`, `O`, `1`, `I` and `L` are left out because they are
/// easily misread off a projector.
const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const GENERATED_LEN: usize = 6;

/// Length bounds for a code chosen by the host.
const SUPPLIED_LEN: std::ops::RangeInclusive<usize> = 4..=10;

/// Draw a fresh code from the thread-local RNG. Uniqueness is the registry's concern.
#[must_use]
pub fn generate_session_code() -> String {
    generate_with(&mut rand::thread_rng())
}

fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..GENERATED_LEN)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect()
}

/// Whether `code` is acceptable as a session code once normalized.
///
/// Host-chosen codes may use any ASCII letter or digit, so `ABC123` passes even though a
/// generated code never contains `1`.
#[must_use]
pub fn is_valid_session_code(code: &str) -> bool {
    SUPPLIED_LEN.contains(&code.len()) && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Canonical form of a code: surrounding whitespace dropped, letters uppercased.
#[must_use]
pub fn normalize_session_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
