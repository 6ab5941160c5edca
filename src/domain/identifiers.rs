//! Card number, CVV and entry reference generation.
//!
//! Sampling is pure; checking a sample against the store is the caller's job,
//! bounded by [`RetryBudget`].

use chrono::{DateTime, Utc};
use rand::Rng;

pub const CARD_NUMBER_LEN: usize = 16;
pub const CVV_LEN: usize = 3;
pub const REFERENCE_PREFIX: &str = "TXN";
const REFERENCE_SUFFIX_LEN: usize = 8;
const REFERENCE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn digits<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

pub fn generate_card_number<R: Rng + ?Sized>(rng: &mut R) -> String {
    digits(rng, CARD_NUMBER_LEN)
}

pub fn generate_cvv<R: Rng + ?Sized>(rng: &mut R) -> String {
    digits(rng, CVV_LEN)
}

/// `TXN` + `YYYYmmddHHMMSS` + 8 characters of `[A-Z0-9]`.
pub fn generate_reference<R: Rng + ?Sized>(rng: &mut R, at: DateTime<Utc>) -> String {
    let suffix: String = (0..REFERENCE_SUFFIX_LEN)
        .map(|_| char::from(REFERENCE_CHARSET[rng.gen_range(0..REFERENCE_CHARSET.len())]))
        .collect();
    format!("{}{}{}", REFERENCE_PREFIX, at.format("%Y%m%d%H%M%S"), suffix)
}

/// Counts attempts at finding an unused identifier.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    limit: u32,
    used: u32,
}

/// All attempts were spent on values that were already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExhaustedRetries {
    pub attempts: u32,
}

impl std::fmt::Display for ExhaustedRetries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no free identifier after {} attempts", self.attempts)
    }
}

impl std::error::Error for ExhaustedRetries {}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Take one attempt, or fail once the limit is reached.
    pub fn attempt(&mut self) -> Result<u32, ExhaustedRetries> {
        if self.used >= self.limit {
            return Err(ExhaustedRetries {
                attempts: self.used,
            });
        }
        self.used += 1;
        Ok(self.used)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_card_number_shape() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let number = generate_card_number(&mut rng);
            assert_eq!(number.len(), CARD_NUMBER_LEN);
            assert!(number.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_cvv_shape() {
        let cvv = generate_cvv(&mut rand::thread_rng());
        assert_eq!(cvv.len(), CVV_LEN);
        assert!(cvv.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_reference_format() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap();
        let reference = generate_reference(&mut rand::thread_rng(), at);

        assert!(reference.starts_with("TXN20261018090507"));
        let suffix = &reference["TXN20261018090507".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_retry_budget_is_finite() {
        let mut budget = RetryBudget::new(3);
        assert_eq!(budget.attempt(), Ok(1));
        assert_eq!(budget.attempt(), Ok(2));
        assert_eq!(budget.attempt(), Ok(3));
        assert_eq!(budget.attempt(), Err(ExhaustedRetries { attempts: 3 }));
    }
}
