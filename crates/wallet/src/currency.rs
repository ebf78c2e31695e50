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

use std::sync::Arc;

/// Currency type tag for a chain's native asset.
pub const CURRENCY_KIND_NATIVE: &str = "native";
/// Currency type tag for an ERC-20 token; such currencies carry the token
/// contract as their issuer.
pub const CURRENCY_KIND_ERC20: &str = "erc20";

/// A currency: the abstract asset that [crate::unit::Unit]s denominate and
/// [crate::amount::Amount]s count.
///
/// Identity is the unique-id string; two currencies with the same uids are the
/// same currency everywhere in the system.
#[derive(Debug)]
pub struct Currency {
    uids: String,
    name: String,
    code: String,
    kind: String,
    issuer: Option<String>,
}

pub type CurrencyRef = Arc<Currency>;

impl Currency {
    pub fn new(
        uids: impl Into<String>,
        name: impl Into<String>,
        code: impl Into<String>,
        kind: impl Into<String>,
        issuer: Option<String>,
    ) -> CurrencyRef {
        Arc::new(Self {
            uids: uids.into(),
            name: name.into(),
            code: code.into(),
            kind: kind.into(),
            issuer,
        })
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The issuing contract address, for token currencies.
    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    pub fn is_native(&self) -> bool {
        self.kind == CURRENCY_KIND_NATIVE
    }
}

impl PartialEq for Currency {
    fn eq(&self, other: &Self) -> bool {
        self.uids == other.uids
    }
}

impl Eq for Currency {}
