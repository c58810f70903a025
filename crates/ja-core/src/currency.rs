//! # Currency Conversion
//!
//! Salaries are compared in a single reference currency. Rates are stored as
//! fixed-point integers (micro-units) and conversion is pure integer math,
//! so large aggregations never accumulate floating-point drift.

use crate::posting::normalize_currency;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Fractional digits carried by a [`Rate`].
pub const RATE_SCALE_DIGITS: u32 = 6;
const RATE_SCALE: u128 = 10u128.pow(RATE_SCALE_DIGITS);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurrencyError {
    #[error("invalid conversion rate '{0}'")]
    InvalidRate(String),
    #[error("conversion rate for {0} must be positive")]
    NonPositive(String),
}

/// Units of the reference currency per one unit of a source currency,
/// scaled by 10^6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Rate(u64);

impl Rate {
    pub const ONE: Rate = Rate(RATE_SCALE as u64);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn micros(&self) -> u64 {
        self.0
    }

    /// Parse a plain decimal such as `"92.5"` or `"0.0105"`. At most six
    /// fractional digits are accepted; no exponent notation.
    pub fn parse(text: &str) -> Result<Self, CurrencyError> {
        let text = text.trim();
        let invalid = || CurrencyError::InvalidRate(text.to_string());
        let (int_part, frac_part) = match text.split_once('.') {
            Some((i, f)) => (i, f),
            None => (text, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
            || frac_part.len() > RATE_SCALE_DIGITS as usize
        {
            return Err(invalid());
        }
        let whole: u64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let mut frac: u64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| invalid())?
        };
        for _ in frac_part.len()..RATE_SCALE_DIGITS as usize {
            frac *= 10;
        }
        whole
            .checked_mul(RATE_SCALE as u64)
            .and_then(|w| w.checked_add(frac))
            .map(Rate)
            .ok_or_else(invalid)
    }

    /// `amount * rate`, floored, saturating at `u64::MAX`.
    pub fn apply(&self, amount: u64) -> u64 {
        let scaled = amount as u128 * self.0 as u128 / RATE_SCALE;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}

/// Conversion table into a reference currency. The reference currency
/// always converts at 1:1 and never needs an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyTable {
    reference: String,
    rates: BTreeMap<String, Rate>,
}

impl CurrencyTable {
    pub fn new(reference: &str) -> Self {
        Self {
            reference: normalize_currency(reference),
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, currency: &str, rate: Rate) -> Self {
        self.insert(currency, rate);
        self
    }

    pub fn insert(&mut self, currency: &str, rate: Rate) {
        self.rates.insert(normalize_currency(currency), rate);
    }

    /// Build from `(code, decimal string)` pairs, as found in config files.
    pub fn from_decimal_rates<'a, I>(reference: &str, rates: I) -> Result<Self, CurrencyError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut table = Self::new(reference);
        for (code, text) in rates {
            let rate = Rate::parse(text)?;
            if rate.micros() == 0 {
                return Err(CurrencyError::NonPositive(code.to_string()));
            }
            table.insert(code, rate);
        }
        Ok(table)
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn rate(&self, currency: &str) -> Option<Rate> {
        let code = normalize_currency(currency);
        if code == self.reference {
            Some(Rate::ONE)
        } else {
            self.rates.get(&code).copied()
        }
    }

    /// Convert `amount` of `currency` into the reference currency.
    /// `None` when the currency is not in the table.
    pub fn convert(&self, amount: u64, currency: &str) -> Option<u64> {
        self.rate(currency).map(|r| r.apply(amount))
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

impl Default for CurrencyTable {
    fn default() -> Self {
        Self::new("USD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rates() {
        assert_eq!(Rate::parse("1").unwrap(), Rate::ONE);
        assert_eq!(Rate::parse("92.5").unwrap().micros(), 92_500_000);
        assert_eq!(Rate::parse("0.000001").unwrap().micros(), 1);
        assert_eq!(Rate::parse(".5").unwrap().micros(), 500_000);
        assert!(Rate::parse("1.0000001").is_err());
        assert!(Rate::parse("-3").is_err());
        assert!(Rate::parse("1e3").is_err());
        assert!(Rate::parse(".").is_err());
    }

    #[test]
    fn test_conversion_is_exact_integer_math() {
        let table = CurrencyTable::new("RUB").with_rate("USD", Rate::parse("92.5").unwrap());
        assert_eq!(table.convert(1_000, "usd"), Some(92_500));
        assert_eq!(table.convert(3, "USD"), Some(277));
        assert_eq!(table.convert(150_000, "RUR"), Some(150_000));
        assert_eq!(table.convert(10, "GBP"), None);
    }

    #[test]
    fn test_repeated_conversion_does_not_drift() {
        let rate = Rate::parse("0.1").unwrap();
        let total: u64 = (0..1_000_000).map(|_| rate.apply(10)).sum();
        assert_eq!(total, 1_000_000);
    }

    #[test]
    fn test_zero_rate_rejected_from_config() {
        let err = CurrencyTable::from_decimal_rates("USD", [("EUR", "0")]).unwrap_err();
        assert_eq!(err, CurrencyError::NonPositive("EUR".into()));
    }

    #[test]
    fn test_apply_saturates() {
        let rate = Rate::parse("1000").unwrap();
        assert_eq!(rate.apply(u64::MAX), u64::MAX);
    }
}
