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

//! The generic-chain handler registry.
//!
//! Every pluggable account-model chain supplies one [ChainHandler]; the
//! process-wide table maps its chain code to the handler. Installation is
//! idempotent and safe under concurrent calls; after first use the table is
//! effectively read-only.

use crate::address::Address;
use crate::amount::Amount;
use crate::chains::gen::{GenAccount, GenTransferPayload};
use crate::feebasis::FeeBasis;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error as ThisError;
use walletkit_primitives::key::Key;
use walletkit_primitives::phrase::Seed;
use walletkit_primitives::TxHash;

/// Error returned by generic-chain handler operations.
#[derive(Debug, ThisError)]
pub enum HandlerError {
    #[error("no handler installed for chain {0:?}")]
    UnknownChain(String),
    #[error("invalid account serialization")]
    InvalidAccount,
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("signing requires private material")]
    MissingSecret,
    #[error("operation not supported by chain {0:?}")]
    Unsupported(String),
}

/// The per-chain vtable. One implementation per generic chain; the built-in
/// instance is [crate::chains::xrp::XrpHandler].
pub trait ChainHandler: Send + Sync {
    /// The registry key, e.g. `"xrp"`.
    fn chain_type(&self) -> &'static str;

    // Account
    fn account_create(&self, seed: &Seed) -> Result<GenAccount, HandlerError>;
    fn account_create_with_public_key(&self, key: Key) -> Result<GenAccount, HandlerError>;
    fn account_create_with_serialization(&self, bytes: &[u8]) -> Result<GenAccount, HandlerError>;
    fn account_address(&self, account: &GenAccount) -> Address;
    fn account_serialize(&self, account: &GenAccount) -> Vec<u8>;

    // Address
    fn address_parse(&self, text: &str) -> Result<Address, HandlerError>;

    // Transfer
    fn transfer_create(
        &self,
        account: &GenAccount,
        target: &Address,
        amount: &Amount,
        fee_basis: &FeeBasis,
    ) -> Result<GenTransferPayload, HandlerError>;
    fn transfer_sign(
        &self,
        payload: &mut GenTransferPayload,
        seed: &Seed,
    ) -> Result<TxHash, HandlerError>;
    /// The raw bytes handed to the network on submission.
    fn transfer_serialize(&self, payload: &GenTransferPayload) -> Vec<u8>;

    // Wallet
    fn default_fee_basis(&self) -> FeeBasis;
}

static REGISTRY: Lazy<RwLock<HashMap<&'static str, Arc<dyn ChainHandler>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Installs a handler. A handler already present for the chain type is kept;
/// repeated installs are no-ops.
pub fn install(handler: Arc<dyn ChainHandler>) {
    let mut registry = REGISTRY.write().unwrap();
    registry.entry(handler.chain_type()).or_insert(handler);
}

/// Installs the built-in handlers. Called by every account construction path.
pub fn install_builtin() {
    install(Arc::new(crate::chains::xrp::XrpHandler));
}

pub fn lookup(chain: &str) -> Result<Arc<dyn ChainHandler>, HandlerError> {
    REGISTRY
        .read()
        .unwrap()
        .get(chain)
        .cloned()
        .ok_or_else(|| HandlerError::UnknownChain(chain.to_string()))
}

/// All installed chain types, for account construction.
pub fn installed() -> Vec<Arc<dyn ChainHandler>> {
    let mut handlers: Vec<_> = REGISTRY.read().unwrap().values().cloned().collect();
    handlers.sort_by_key(|h| h.chain_type());
    handlers
}
