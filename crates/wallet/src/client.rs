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

//! The embedder-implemented network client.
//!
//! Every call carries a [CallbackState] cookie; the embedder performs the
//! request asynchronously and echoes the cookie back through the manager's
//! matching `announce_*` entry point, which couples the response to its
//! request. Announcing with a stale or foreign cookie is ignored.

use walletkit_primitives::TxHash;

/// Opaque request cookie, echoed verbatim by the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackState(pub u64);

/// One transfer as the API backend reports it, JSON-shaped.
#[derive(Clone, Debug)]
pub struct AnnouncedTransfer {
    pub hash: String,
    pub uids: String,
    pub source: String,
    pub target: String,
    /// Base-unit amount, decimal string.
    pub amount: String,
    pub currency: String,
    /// Base-unit fee, decimal string; empty when unknown.
    pub fee: String,
    pub timestamp: u64,
    pub block_height: u64,
    pub errored: bool,
}

/// The client callback interface. Chain families use the subset that applies
/// to them; unused callbacks keep their default no-op.
#[allow(unused_variables)]
pub trait Client: Send + Sync {
    /// Fetch the current block height; answer via `announce_block_number`.
    fn get_block_number(&self, state: CallbackState);

    /// Fetch transfers touching `addresses` in `[begin, end]`; answer via
    /// `announce_transfers` (account chains) or `announce_transaction_bytes`
    /// (UTXO chains, raw transactions).
    fn get_transactions(
        &self,
        state: CallbackState,
        addresses: Vec<String>,
        begin: u64,
        end: u64,
    );

    /// Submit a signed transaction; answer via `announce_submit`.
    fn submit_transaction(&self, state: CallbackState, raw: Vec<u8>, hash: Option<TxHash>);

    /// Ethereum: fetch logs for `address` under `contract`; answer via
    /// `announce_transfers`.
    fn get_logs(
        &self,
        state: CallbackState,
        contract: Option<String>,
        address: String,
        event: String,
        begin: u64,
        end: u64,
    ) {
    }

    /// Ethereum: fetch the ether or token balance; answer via
    /// `announce_balance`.
    fn get_balance(&self, state: CallbackState, address: String, token: Option<String>) {}

    /// Ethereum: fetch the gas price in wei; answer via
    /// `announce_gas_price`.
    fn get_gas_price(&self, state: CallbackState) {}

    /// Ethereum: estimate gas; answer via `announce_gas_estimate`.
    fn estimate_gas(
        &self,
        state: CallbackState,
        from: String,
        to: String,
        amount: String,
        data: String,
    ) {
    }

    /// Ethereum: fetch the account nonce; answer via `announce_nonce`.
    fn get_nonce(&self, state: CallbackState, address: String) {}
}

/// A client that performs no I/O; lifecycle tests and P2P-only managers use
/// it where the callback interface is never exercised.
#[derive(Debug, Default)]
pub struct NullClient;

impl Client for NullClient {
    fn get_block_number(&self, _state: CallbackState) {}
    fn get_transactions(
        &self,
        _state: CallbackState,
        _addresses: Vec<String>,
        _begin: u64,
        _end: u64,
    ) {
    }
    fn submit_transaction(&self, _state: CallbackState, _raw: Vec<u8>, _hash: Option<TxHash>) {}
}
