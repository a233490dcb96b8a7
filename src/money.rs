//! Fixed-point money in integer minor units (hundredths).
//!
//! Every balance and every amount moved through the ledger is an `i64` count
//! of minor units, so sums over any sequence of transfers are exact.

use crate::error::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional digits carried by an amount.
pub const DECIMALS: u32 = 2;
/// Minor units per whole unit.
pub const MINOR_PER_UNIT: i64 = 10_i64.pow(DECIMALS);

/// A strictly positive quantity of money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "AmountInput", into = "String")]
pub struct Amount(i64);

impl Amount {
    pub fn from_minor(minor: i64) -> Result<Self> {
        if minor <= 0 {
            return Err(WalletError::InvalidAmount(format!(
                "amount must be greater than zero, got {}",
                format_minor(minor)
            )));
        }
        Ok(Amount(minor))
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Amount) -> Result<Amount> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or_else(|| WalletError::InvalidAmount("amount overflow".to_string()))
    }

    /// Sum of a non-empty list of amounts.
    pub fn sum<I: IntoIterator<Item = Amount>>(amounts: I) -> Result<Amount> {
        let mut iter = amounts.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| WalletError::InvalidAmount("no amounts to sum".to_string()))?;
        iter.try_fold(first, Amount::checked_add)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&format_minor(self.0))
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}

impl FromStr for Amount {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        Amount::from_minor(parse_minor(s)?)
    }
}

/// Wire form: either a decimal string (`"12.50"`) or a JSON number (`12.5`).
#[derive(Deserialize)]
#[serde(untagged)]
enum AmountInput {
    Text(String),
    Number(serde_json::Number),
}

impl TryFrom<AmountInput> for Amount {
    type Error = WalletError;

    fn try_from(input: AmountInput) -> Result<Self> {
        match input {
            AmountInput::Text(s) => s.parse(),
            AmountInput::Number(n) => n.to_string().parse(),
        }
    }
}

/// Parse a decimal string into signed minor units.
///
/// Accepts an optional leading `-`, digits, and at most [`DECIMALS`]
/// fractional digits. Exponents, `NaN` and `inf` are rejected.
pub fn parse_minor(input: &str) -> Result<i64> {
    let invalid = || WalletError::InvalidAmount(format!("'{}' is not a decimal amount", input));

    let s = input.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > DECIMALS as usize {
        return Err(WalletError::InvalidAmount(format!(
            "'{}' has more than {} decimal places",
            input, DECIMALS
        )));
    }

    let overflow = || WalletError::InvalidAmount(format!("'{}' is too large", input));
    let whole_value: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };
    let mut frac_value: i64 = if frac.is_empty() {
        0
    } else {
        frac.parse().map_err(|_| invalid())?
    };
    for _ in frac.len()..DECIMALS as usize {
        frac_value *= 10;
    }

    let minor = whole_value
        .checked_mul(MINOR_PER_UNIT)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or_else(overflow)?;

    Ok(if negative { -minor } else { minor })
}

/// Render minor units as a fixed two-decimal string.
pub fn format_minor(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    let per_unit = MINOR_PER_UNIT as u64;
    format!(
        "{}{}.{:0width$}",
        sign,
        abs / per_unit,
        abs % per_unit,
        width = DECIMALS as usize
    )
}
