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
use std::sync::Arc;

/// A denomination of a [crate::currency::Currency].
///
/// A *base* unit has zero decimals (satoshi, wei, drop); a *derived* unit
/// carries a power-of-ten offset from its base (BTC = 10^8 satoshi,
/// ETH = 10^18 wei). Two units are compatible iff they share a currency and
/// identical iff their uids match.
#[derive(Debug, PartialEq)]
pub struct Unit {
    currency: CurrencyRef,
    uids: String,
    name: String,
    symbol: String,
    base: Option<UnitRef>,
    decimals: u8,
}

pub type UnitRef = Arc<Unit>;

impl Unit {
    /// Creates the base unit of `currency`.
    pub fn base(
        currency: CurrencyRef,
        uids: impl Into<String>,
        name: impl Into<String>,
        symbol: impl Into<String>,
    ) -> UnitRef {
        Arc::new(Self {
            currency,
            uids: uids.into(),
            name: name.into(),
            symbol: symbol.into(),
            base: None,
            decimals: 0,
        })
    }

    /// Creates a unit of `10^decimals` base units.
    pub fn derived(
        currency: CurrencyRef,
        uids: impl Into<String>,
        name: impl Into<String>,
        symbol: impl Into<String>,
        base: &UnitRef,
        decimals: u8,
    ) -> UnitRef {
        debug_assert!(Arc::ptr_eq(&base.currency, &currency) || base.currency == currency);
        Arc::new(Self {
            currency,
            uids: uids.into(),
            name: name.into(),
            symbol: symbol.into(),
            base: Some(base.clone()),
            decimals,
        })
    }

    pub fn currency(&self) -> &CurrencyRef {
        &self.currency
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Power-of-ten offset from the base unit; zero for a base unit.
    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn is_base(&self) -> bool {
        self.base.is_none()
    }

    /// Units are compatible when they denominate the same currency.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.currency.as_ref() == other.currency.as_ref()
    }

    /// Units are identical when their unique-ids match.
    pub fn is_identical(&self, other: &Unit) -> bool {
        self.uids == other.uids
    }
}
