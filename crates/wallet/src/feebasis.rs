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

use crate::amount::{u256_from_f64, u256_to_f64};
use crate::network::ChainFamily;
use alloy_primitives::U256;

/// The pricing model of a transfer's fee, per chain family.
///
/// Total fee is always price × cost; the families differ in what prices and
/// costs are.
#[derive(Clone, Debug, PartialEq)]
pub enum FeeBasis {
    /// Bitcoin-style: satoshis per kilobyte times transaction size.
    Utxo { fee_per_kb: u64, size_in_bytes: u64 },
    /// Ethereum: gas price in wei times gas limit.
    Ethereum { gas_limit: u64, gas_price_wei: U256 },
    /// Generic chains: an integer price times a real cost factor.
    Generic {
        price_per_cost_factor: U256,
        cost_factor: f64,
    },
}

impl FeeBasis {
    pub fn family(&self) -> ChainFamily {
        match self {
            FeeBasis::Utxo { .. } => ChainFamily::Utxo,
            FeeBasis::Ethereum { .. } => ChainFamily::Ethereum,
            FeeBasis::Generic { .. } => ChainFamily::Generic,
        }
    }

    /// The total fee in the chain's base unit, or `None` on overflow.
    pub fn fee(&self) -> Option<U256> {
        match self {
            FeeBasis::Utxo {
                fee_per_kb,
                size_in_bytes,
            } => {
                let product = u128::from(*fee_per_kb).checked_mul(u128::from(*size_in_bytes))?;
                Some(U256::from(product.div_ceil(1000)))
            }
            FeeBasis::Ethereum {
                gas_limit,
                gas_price_wei,
            } => gas_price_wei.checked_mul(U256::from(*gas_limit)),
            FeeBasis::Generic {
                price_per_cost_factor,
                cost_factor,
            } => u256_from_f64(u256_to_f64(*price_per_cost_factor) * cost_factor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utxo_fee_rounds_up_per_kb() {
        let basis = FeeBasis::Utxo {
            fee_per_kb: 1000,
            size_in_bytes: 1501,
        };
        assert_eq!(basis.fee(), Some(U256::from(1501)));

        let basis = FeeBasis::Utxo {
            fee_per_kb: 2000,
            size_in_bytes: 250,
        };
        assert_eq!(basis.fee(), Some(U256::from(500)));
    }

    #[test]
    fn ethereum_fee_is_gas_times_price() {
        let basis = FeeBasis::Ethereum {
            gas_limit: 74858,
            gas_price_wei: U256::from(50_000_000_000u64), // 50 Gwei
        };
        assert_eq!(basis.fee(), Some(U256::from(3_742_900_000_000_000u64)));
    }

    #[test]
    fn generic_fee_scales_by_cost_factor() {
        let basis = FeeBasis::Generic {
            price_per_cost_factor: U256::from(10),
            cost_factor: 1.0,
        };
        assert_eq!(basis.fee(), Some(U256::from(10)));
    }

    #[test]
    fn ethereum_fee_overflow_detected() {
        let basis = FeeBasis::Ethereum {
            gas_limit: u64::MAX,
            gas_price_wei: U256::MAX,
        };
        assert_eq!(basis.fee(), None);
    }
}
