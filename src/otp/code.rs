//! Code generation and comparison.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::OsRng;

/// Generate a numeric code of `length` digits.
///
/// Each digit is drawn independently from the operating system's CSPRNG
/// through a uniform distribution over `0..10`, so no digit is favoured.
pub fn generate_code(length: usize) -> String {
    let digits = Uniform::from(0u8..10);
    let mut rng = OsRng;
    (0..length)
        .map(|_| char::from(b'0' + digits.sample(&mut rng)))
        .collect()
}

/// Compare two codes without an early exit.
///
/// Every byte of equal-length inputs is inspected regardless of where the
/// first difference is. Length is not secret (it is fixed by configuration)
/// so a length mismatch returns immediately.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    std::hint::black_box(diff) == 0
}

/// Whether `code` is exactly `length` ASCII digits.
pub fn is_well_formed(code: &str, length: usize) -> bool {
    code.len() == length && code.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_code_shape() {
        for length in [4, 6, 8] {
            let code = generate_code(length);
            assert_eq!(code.len(), length);
            assert!(is_well_formed(&code, length));
        }
    }

    #[test]
    fn test_digits_are_uniform_per_position() {
        const SAMPLES: usize = 20_000;
        let mut counts = [[0usize; 10]; 6];
        for _ in 0..SAMPLES {
            for (position, b) in generate_code(6).bytes().enumerate() {
                counts[position][(b - b'0') as usize] += 1;
            }
        }

        // Expected 2000 per digit, standard deviation ~42.
        for (position, row) in counts.iter().enumerate() {
            for (digit, count) in row.iter().enumerate() {
                assert!(
                    (1700..=2300).contains(count),
                    "digit {} at position {} drawn {} times",
                    digit,
                    position,
                    count
                );
            }
        }
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"123456", b"123456"));
        assert!(!constant_time_eq(b"123456", b"123457"));
        assert!(!constant_time_eq(b"123456", b"923456"));
        assert!(!constant_time_eq(b"123456", b"12345"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_well_formed() {
        assert!(is_well_formed("012345", 6));
        assert!(!is_well_formed("01234", 6));
        assert!(!is_well_formed("01234a", 6));
        assert!(!is_well_formed("０12345", 6));
    }
}
