// Copyright 2024 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::currency::CurrencyRef;
use crate::unit::UnitRef;
use alloy_primitives::U256;
use std::cmp::Ordering;
use thiserror::Error as ThisError;

/// Error returned by [Amount] construction and arithmetic.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum AmountError {
    /// The magnitude does not fit in 256 bits.
    #[error("amount overflow")]
    Overflow,
    /// Arithmetic or comparison across two different currencies.
    #[error("incompatible currencies")]
    IncompatibleCurrencies,
    /// The value was not a parseable decimal number.
    #[error("invalid decimal string")]
    InvalidDecimal,
}

/// 2^53, the largest power of two at which every integer is exact in an f64.
const TWO_POW_53: f64 = 9007199254740992.0;
/// 2^256 as an f64; any magnitude at or above this overflows.
const TWO_POW_256: f64 = 1.157920892373162e77;

pub(crate) fn u256_from_f64(value: f64) -> Option<U256> {
    if !value.is_finite() || value < 0.0 || value >= TWO_POW_256 {
        return None;
    }
    let mut mantissa = value;
    let mut shift = 0usize;
    while mantissa >= TWO_POW_53 {
        mantissa /= 2.0;
        shift += 1;
    }
    Some(U256::from(mantissa as u64) << shift)
}

pub(crate) fn u256_to_f64(value: U256) -> f64 {
    let limbs = value.as_limbs();
    let mut out = 0.0f64;
    for (index, limb) in limbs.iter().enumerate() {
        out += (*limb as f64) * 2.0f64.powi(64 * index as i32);
    }
    out
}

fn pow10(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}

/// A currency-bound quantity: a 256-bit magnitude counted in the currency's
/// base unit, plus a sign and the unit it was created in (which fixes the
/// default display scaling).
#[derive(Clone, Debug, PartialEq)]
pub struct Amount {
    unit: UnitRef,
    negative: bool,
    value: U256,
}

impl Amount {
    /// Creates an amount from a magnitude already counted in base units.
    pub fn from_base(unit: UnitRef, negative: bool, value: U256) -> Self {
        Self {
            unit,
            negative,
            value,
        }
    }

    /// Creates an amount of `value` units, scaling into base units.
    pub fn from_integer(value: i64, unit: UnitRef) -> Result<Self, AmountError> {
        let magnitude = U256::from(value.unsigned_abs());
        let scaled = magnitude
            .checked_mul(pow10(unit.decimals()))
            .ok_or(AmountError::Overflow)?;
        Ok(Self {
            unit,
            negative: value < 0,
            value: scaled,
        })
    }

    /// Creates an amount of `value` units. The scaled magnitude must fit in
    /// 256 bits; fractional base units truncate.
    pub fn from_f64(value: f64, unit: UnitRef) -> Result<Self, AmountError> {
        let scaled = value.abs() * 10f64.powi(i32::from(unit.decimals()));
        let magnitude = u256_from_f64(scaled).ok_or(AmountError::Overflow)?;
        Ok(Self {
            unit,
            negative: value.is_sign_negative() && magnitude != U256::ZERO,
            value: magnitude,
        })
    }

    /// Creates an amount from a decimal string such as `"5968.77"`, exactly.
    ///
    /// Unlike [Amount::from_f64] no binary rounding occurs: the digits are
    /// scaled in integer arithmetic. More fractional digits than the unit's
    /// decimals is an error, not a truncation.
    pub fn from_decimal(text: &str, unit: UnitRef) -> Result<Self, AmountError> {
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::InvalidDecimal);
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(AmountError::InvalidDecimal);
        }
        let decimals = usize::from(unit.decimals());
        if frac_part.len() > decimals {
            return Err(AmountError::InvalidDecimal);
        }

        let mut value = U256::ZERO;
        for b in int_part.bytes().chain(frac_part.bytes()) {
            value = value
                .checked_mul(U256::from(10u64))
                .and_then(|v| v.checked_add(U256::from(b - b'0')))
                .ok_or(AmountError::Overflow)?;
        }
        let rescale = pow10((decimals - frac_part.len()) as u8);
        value = value.checked_mul(rescale).ok_or(AmountError::Overflow)?;

        Ok(Self {
            unit,
            negative: negative && value != U256::ZERO,
            value,
        })
    }

    pub fn unit(&self) -> &UnitRef {
        &self.unit
    }

    pub fn currency(&self) -> &CurrencyRef {
        self.unit.currency()
    }

    /// Magnitude in base units.
    pub fn base_value(&self) -> U256 {
        self.value
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.value == U256::ZERO
    }

    /// The same quantity, displayed in another unit of the same currency.
    pub fn with_unit(&self, unit: UnitRef) -> Result<Self, AmountError> {
        if !self.unit.is_compatible(&unit) {
            return Err(AmountError::IncompatibleCurrencies);
        }
        Ok(Self {
            unit,
            negative: self.negative,
            value: self.value,
        })
    }

    /// The value expressed in `unit`, as an f64.
    pub fn to_f64(&self, unit: &UnitRef) -> Result<f64, AmountError> {
        if !self.unit.is_compatible(unit) {
            return Err(AmountError::IncompatibleCurrencies);
        }
        let magnitude = u256_to_f64(self.value) / 10f64.powi(i32::from(unit.decimals()));
        Ok(if self.negative { -magnitude } else { magnitude })
    }

    pub fn neg(&self) -> Self {
        Self {
            unit: self.unit.clone(),
            negative: !self.negative && !self.is_zero(),
            value: self.value,
        }
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Self, AmountError> {
        if !self.unit.is_compatible(&other.unit) {
            return Err(AmountError::IncompatibleCurrencies);
        }
        let (negative, value) = if self.negative == other.negative {
            let sum = self
                .value
                .checked_add(other.value)
                .ok_or(AmountError::Overflow)?;
            (self.negative, sum)
        } else if self.value >= other.value {
            (self.negative, self.value - other.value)
        } else {
            (other.negative, other.value - self.value)
        };
        Ok(Self {
            unit: self.unit.clone(),
            negative: negative && value != U256::ZERO,
            value,
        })
    }

    pub fn checked_sub(&self, other: &Amount) -> Result<Self, AmountError> {
        self.checked_add(&other.neg())
    }

    /// Signed comparison; only within a compatible currency.
    pub fn compare(&self, other: &Amount) -> Result<Ordering, AmountError> {
        if !self.unit.is_compatible(&other.unit) {
            return Err(AmountError::IncompatibleCurrencies);
        }
        Ok(match (self.negative, other.negative) {
            (false, false) => self.value.cmp(&other.value),
            (true, true) => other.value.cmp(&self.value),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
        })
    }
}
