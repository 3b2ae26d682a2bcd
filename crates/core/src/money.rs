//! Money value object: signed minor units plus an explicit currency.
//!
//! Amounts are integers in the currency's smallest unit (kobo, cents),
//! never floats. All arithmetic is checked and requires both operands to
//! share a currency; there is no implicit conversion.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// ISO-4217-style currency: a short code plus its decimal scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    code: [u8; 3],
    scale: u8,
}

impl Currency {
    pub const NGN: Currency = Currency { code: *b"NGN", scale: 2 };
    pub const USD: Currency = Currency { code: *b"USD", scale: 2 };
    pub const EUR: Currency = Currency { code: *b"EUR", scale: 2 };

    /// Build a currency from a 3-letter code and decimal scale.
    pub fn new(code: &str, scale: u8) -> LedgerResult<Self> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(LedgerError::validation(format!(
                "currency code must be 3 uppercase ASCII letters, got '{code}'"
            )));
        }
        Ok(Self {
            code: [bytes[0], bytes[1], bytes[2]],
            scale,
        })
    }

    pub fn code(&self) -> &str {
        // Invariant: constructed from ASCII uppercase only.
        core::str::from_utf8(&self.code).unwrap_or("???")
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// A signed amount in minor units of one currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    minor: i64,
    currency: Currency,
}

impl Money {
    pub fn new(minor: i64, currency: Currency) -> Self {
        Self { minor, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self { minor: 0, currency }
    }

    pub fn minor(&self) -> i64 {
        self.minor
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_positive(&self) -> bool {
        self.minor > 0
    }

    pub fn is_negative(&self) -> bool {
        self.minor < 0
    }

    fn ensure_same_currency(&self, other: &Money) -> LedgerResult<()> {
        if self.currency != other.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: self.currency.code().to_string(),
                found: other.currency.code().to_string(),
            });
        }
        Ok(())
    }

    /// Checked addition; fails on currency mismatch or i64 overflow.
    pub fn checked_add(&self, other: &Money) -> LedgerResult<Money> {
        self.ensure_same_currency(other)?;
        let minor = self.minor.checked_add(other.minor).ok_or_else(|| {
            LedgerError::validation("amount overflow in addition")
        })?;
        Ok(Money::new(minor, self.currency))
    }

    /// Checked subtraction; fails on currency mismatch or i64 overflow.
    pub fn checked_sub(&self, other: &Money) -> LedgerResult<Money> {
        self.ensure_same_currency(other)?;
        let minor = self.minor.checked_sub(other.minor).ok_or_else(|| {
            LedgerError::validation("amount overflow in subtraction")
        })?;
        Ok(Money::new(minor, self.currency))
    }

    /// Apply a signed delta in minor units (checked).
    pub fn checked_add_minor(&self, delta: i64) -> LedgerResult<Money> {
        let minor = self.minor.checked_add(delta).ok_or_else(|| {
            LedgerError::validation("amount overflow applying delta")
        })?;
        Ok(Money::new(minor, self.currency))
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.minor, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn add_same_currency() {
        let a = Money::new(1_000, Currency::NGN);
        let b = Money::new(250, Currency::NGN);
        assert_eq!(a.checked_add(&b).unwrap().minor(), 1_250);
    }

    #[test]
    fn cross_currency_arithmetic_is_rejected() {
        let ngn = Money::new(1_000, Currency::NGN);
        let usd = Money::new(1_000, Currency::USD);

        let err = ngn.checked_add(&usd).unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
    }

    #[test]
    fn overflow_is_an_error_not_a_panic() {
        let a = Money::new(i64::MAX, Currency::NGN);
        let b = Money::new(1, Currency::NGN);
        assert!(a.checked_add(&b).is_err());
    }

    #[test]
    fn currency_code_round_trips() {
        let c = Currency::new("GBP", 2).unwrap();
        assert_eq!(c.code(), "GBP");
        assert_eq!(c.scale(), 2);
    }

    #[test]
    fn lowercase_currency_code_is_rejected() {
        assert!(Currency::new("ngn", 2).is_err());
        assert!(Currency::new("NGNX", 2).is_err());
    }

    proptest! {
        /// Property: whenever checked addition succeeds, subtracting the
        /// same operand restores the original amount.
        #[test]
        fn add_then_sub_round_trips(a in any::<i64>(), b in any::<i64>()) {
            let lhs = Money::new(a, Currency::NGN);
            let rhs = Money::new(b, Currency::NGN);
            if let Ok(sum) = lhs.checked_add(&rhs) {
                prop_assert_eq!(sum.checked_sub(&rhs).unwrap().minor(), a);
            }
        }

        /// Property: checked arithmetic never panics, even at the i64 edges.
        #[test]
        fn checked_delta_never_panics(a in any::<i64>(), delta in any::<i64>()) {
            let m = Money::new(a, Currency::USD);
            let _ = m.checked_add_minor(delta);
        }
    }
}
