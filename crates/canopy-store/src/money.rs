//! Fixed-point monetary amounts with an explicit currency.
//!
//! Amounts never convert implicitly: adding or comparing two amounts in
//! different currencies is an error, not a silent coercion.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Three-letter currency code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    pub const USD: Self = Self(*b"USD");

    /// Parse an uppercase ASCII three-letter code.
    pub fn new(code: &str) -> Result<Self> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(Error::InvalidCurrency(code.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        // Constructed only from ASCII uppercase bytes.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.as_str().to_string()
    }
}

/// A decimal amount in a specific currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub const fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub const fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    fn same_currency(&self, other: &Self) -> Result<()> {
        if self.currency != other.currency {
            return Err(Error::CurrencyMismatch {
                expected: self.currency,
                actual: other.currency,
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self> {
        self.same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| Error::Invariant(format!("overflow adding {} to {}", other, self)))?;
        Ok(Self::new(amount, self.currency))
    }

    /// Subtract, allowing a negative result; callers decide whether that is valid.
    pub fn checked_sub(&self, other: &Self) -> Result<Self> {
        self.same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| Error::Invariant(format!("overflow subtracting {} from {}", other, self)))?;
        Ok(Self::new(amount, self.currency))
    }

    /// `self >= other`, refusing to compare across currencies.
    pub fn covers(&self, other: &Self) -> Result<bool> {
        self.same_currency(other)?;
        Ok(self.amount >= other.amount)
    }

    /// This amount scaled by a fraction in `[0, 1]`.
    pub fn scale(&self, fraction: Decimal) -> Result<Self> {
        let amount = self
            .amount
            .checked_mul(fraction)
            .ok_or_else(|| Error::Invariant(format!("overflow scaling {} by {}", self, fraction)))?;
        Ok(Self::new(amount, self.currency))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn currency_codes_are_validated() {
        assert_eq!(Currency::new("USD").unwrap(), Currency::USD);
        assert!(Currency::new("usd").is_err());
        assert!(Currency::new("US").is_err());
        assert!(Currency::new("EURO").is_err());
    }

    #[test]
    fn arithmetic_within_one_currency() {
        let a = Money::new(dec!(11.00), Currency::USD);
        let sum = a.checked_add(&a).unwrap().checked_add(&a).unwrap();
        assert_eq!(sum.amount, dec!(33.00));
        assert!(sum.covers(&Money::new(dec!(33), Currency::USD)).unwrap());
        assert!(sum.checked_sub(&Money::new(dec!(40), Currency::USD)).unwrap().is_negative());
    }

    #[test]
    fn no_implicit_conversion() {
        let usd = Money::new(dec!(1), Currency::USD);
        let eur = Money::new(dec!(1), Currency::new("EUR").unwrap());
        assert!(matches!(
            usd.checked_add(&eur),
            Err(Error::CurrencyMismatch { .. })
        ));
        assert!(usd.covers(&eur).is_err());
    }

    #[test]
    fn scaling_by_fraction() {
        let fee = Money::new(dec!(20), Currency::USD);
        assert_eq!(fee.scale(dec!(0.25)).unwrap().amount, dec!(5.00));
        assert!(fee.scale(Decimal::ZERO).unwrap().is_zero());
    }
}
