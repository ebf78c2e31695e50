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

use crate::network::ChainFamily;
use std::fmt;

/// A generic-chain address: the handler's chain code plus opaque payload
/// bytes, with the display string the handler rendered at creation.
#[derive(Clone, Debug)]
pub struct GenericAddress {
    pub chain: String,
    pub bytes: Vec<u8>,
    pub display: String,
}

impl PartialEq for GenericAddress {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain && self.bytes == other.bytes
    }
}

impl Eq for GenericAddress {}

/// An address in one of the three chain families.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Bitcoin {
        address: bitcoin::Address,
        /// False for the cash fork, whose display rules differ.
        is_bitcoin: bool,
    },
    /// EIP-55 checksummed on display.
    Ethereum(alloy_primitives::Address),
    Generic(GenericAddress),
}

impl Address {
    pub fn bitcoin(address: bitcoin::Address) -> Self {
        Address::Bitcoin {
            address,
            is_bitcoin: true,
        }
    }

    pub fn ethereum(address: alloy_primitives::Address) -> Self {
        Address::Ethereum(address)
    }

    pub fn generic(chain: impl Into<String>, bytes: Vec<u8>, display: impl Into<String>) -> Self {
        Address::Generic(GenericAddress {
            chain: chain.into(),
            bytes,
            display: display.into(),
        })
    }

    pub fn family(&self) -> ChainFamily {
        match self {
            Address::Bitcoin { .. } => ChainFamily::Utxo,
            Address::Ethereum(_) => ChainFamily::Ethereum,
            Address::Generic(_) => ChainFamily::Generic,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Bitcoin { address, .. } => write!(f, "{address}"),
            Address::Ethereum(address) => write!(f, "{}", address.to_checksum(None)),
            Address::Generic(address) => f.write_str(&address.display),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::str::FromStr;

    #[test]
    fn ethereum_display_is_checksummed() {
        let inner = address!("932a27e1bc84f5b74c29af3d888926b1307f4a5c");
        let display = Address::ethereum(inner).to_string();
        assert_eq!(
            display.to_lowercase(),
            "0x932a27e1bc84f5b74c29af3d888926b1307f4a5c"
        );
        // The mixed-case form must itself pass checksum validation.
        assert_eq!(
            alloy_primitives::Address::parse_checksummed(&display, None).unwrap(),
            inner
        );
    }

    #[test]
    fn bitcoin_display_roundtrips() {
        let parsed = bitcoin::Address::from_str("mm7DDqVkFd35XcWecFipfTYM5dByBzn7nq")
            .unwrap()
            .require_network(bitcoin::Network::Testnet)
            .unwrap();
        let addr = Address::bitcoin(parsed);
        assert_eq!(addr.to_string(), "mm7DDqVkFd35XcWecFipfTYM5dByBzn7nq");
        assert_eq!(addr.family(), ChainFamily::Utxo);
    }

    #[test]
    fn generic_equality_ignores_display() {
        let a = Address::generic("xrp", vec![1, 2, 3], "rAAA");
        let b = Address::generic("xrp", vec![1, 2, 3], "rBBB");
        let c = Address::generic("xrp", vec![9], "rAAA");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
