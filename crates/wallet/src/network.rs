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

use crate::amount::Amount;
use crate::currency::CurrencyRef;
use crate::unit::UnitRef;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The three chain families the core dispatches over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainFamily {
    Utxo,
    Ethereum,
    Generic,
}

/// Chain-family-specific network descriptor.
#[derive(Clone, Debug)]
pub enum NativeNetwork {
    Bitcoin {
        chain: bitcoin::Network,
        /// Distinguishes Bitcoin from its cash fork, which shares address
        /// payload bytes but not address display rules.
        is_bitcoin: bool,
    },
    Ethereum {
        chain_id: u64,
    },
    Generic {
        /// Key into the chain handler registry, e.g. `"xrp"`.
        code: String,
    },
}

impl NativeNetwork {
    pub fn family(&self) -> ChainFamily {
        match self {
            NativeNetwork::Bitcoin { .. } => ChainFamily::Utxo,
            NativeNetwork::Ethereum { .. } => ChainFamily::Ethereum,
            NativeNetwork::Generic { .. } => ChainFamily::Generic,
        }
    }
}

/// One fee tier: the price buying an expected confirmation time.
#[derive(Clone, Debug)]
pub struct NetworkFee {
    pub confirmation_time_ms: u64,
    pub price_per_cost_factor: Amount,
}

/// A currency listed on a network, with its unit set.
#[derive(Clone, Debug)]
pub struct NetworkCurrency {
    pub currency: CurrencyRef,
    pub base_unit: UnitRef,
    pub default_unit: UnitRef,
    pub units: Vec<UnitRef>,
}

/// Immutable descriptor of one blockchain network.
///
/// Only the known block height mutates, and it is monotonic non-decreasing.
#[derive(Debug)]
pub struct Network {
    uids: String,
    name: String,
    native: NativeNetwork,
    is_mainnet: bool,
    confirmations_until_final: u32,
    height: AtomicU64,
    currency: CurrencyRef,
    currencies: Vec<NetworkCurrency>,
    fees: Vec<NetworkFee>,
}

pub type NetworkRef = Arc<Network>;

impl Network {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uids: impl Into<String>,
        name: impl Into<String>,
        native: NativeNetwork,
        is_mainnet: bool,
        confirmations_until_final: u32,
        height: u64,
        currency: CurrencyRef,
        currencies: Vec<NetworkCurrency>,
        fees: Vec<NetworkFee>,
    ) -> NetworkRef {
        debug_assert!(currencies
            .iter()
            .any(|entry| entry.currency.as_ref() == currency.as_ref()));
        Arc::new(Self {
            uids: uids.into(),
            name: name.into(),
            native,
            is_mainnet,
            confirmations_until_final,
            height: AtomicU64::new(height),
            currency,
            currencies,
            fees,
        })
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn native(&self) -> &NativeNetwork {
        &self.native
    }

    pub fn family(&self) -> ChainFamily {
        self.native.family()
    }

    pub fn is_mainnet(&self) -> bool {
        self.is_mainnet
    }

    pub fn confirmations_until_final(&self) -> u32 {
        self.confirmations_until_final
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    /// Raises the known height; a lower value is ignored.
    pub fn update_height(&self, height: u64) {
        self.height.fetch_max(height, Ordering::AcqRel);
    }

    /// The network's native currency.
    pub fn currency(&self) -> &CurrencyRef {
        &self.currency
    }

    pub fn currencies(&self) -> &[NetworkCurrency] {
        &self.currencies
    }

    pub fn fees(&self) -> &[NetworkFee] {
        &self.fees
    }

    pub fn has_currency(&self, currency: &CurrencyRef) -> bool {
        self.entry_for(currency).is_some()
    }

    pub fn entry_for(&self, currency: &CurrencyRef) -> Option<&NetworkCurrency> {
        self.currencies
            .iter()
            .find(|entry| entry.currency.as_ref() == currency.as_ref())
    }

    pub fn default_unit_for(&self, currency: &CurrencyRef) -> Option<UnitRef> {
        self.entry_for(currency).map(|e| e.default_unit.clone())
    }

    pub fn base_unit_for(&self, currency: &CurrencyRef) -> Option<UnitRef> {
        self.entry_for(currency).map(|e| e.base_unit.clone())
    }
}
