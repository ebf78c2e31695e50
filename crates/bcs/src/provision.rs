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

//! The provision protocol: the uniform request/result unit between the sync
//! core and the LES peer pool. The pool itself is an external collaborator
//! behind [ProvisionIssuer].

use crate::block::{AccountState, BcsLog, BcsTransaction, BlockHeader, TransactionStatus};
use alloy_primitives::{Address as EthAddress, U256};
use thiserror::Error as ThisError;
use walletkit_primitives::{BlockHash, TxHash};

/// Identifies one peer in the pool.
pub type PeerId = u64;

/// What a provision asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisionRequest {
    /// `count` headers from `start`, each `skip` apart.
    Headers { start: u64, skip: u64, count: u64 },
    /// Block bodies, for transaction matching.
    Bodies { hashes: Vec<BlockHash> },
    /// Transaction receipts, for log matching.
    Receipts { hashes: Vec<BlockHash> },
    /// Account state at each listed block.
    Accounts {
        address: EthAddress,
        blocks: Vec<(BlockHash, u64)>,
    },
    /// Header proofs for CHT roots.
    Proofs { numbers: Vec<u64> },
    /// Status of each listed transaction.
    Statuses { hashes: Vec<TxHash> },
    /// Submit a signed raw transaction.
    Submit { raw: Vec<u8>, hash: TxHash },
}

/// An issued provision: the request plus its correlation identifier and the
/// peer it was directed to (None = any peer).
#[derive(Clone, Debug)]
pub struct Provision {
    pub identifier: u64,
    pub peer: Option<PeerId>,
    pub request: ProvisionRequest,
}

/// Why a provision failed.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ProvisionError {
    /// The chosen peer went inactive; the provision is transparently
    /// re-issued to another peer.
    #[error("node inactive")]
    NodeInactive,
    /// The peer answered but could not serve the request.
    #[error("data unavailable")]
    Unavailable,
    /// The response failed validation.
    #[error("invalid response")]
    Invalid,
}

/// The typed payload of a successful provision.
#[derive(Clone, Debug)]
pub enum ProvisionPayload {
    Headers(Vec<BlockHeader>),
    /// Per block: the transactions of interest found in its body.
    Bodies(Vec<(BlockHash, Vec<BcsTransaction>)>),
    /// Per block: the logs of interest found in its receipts.
    Receipts(Vec<(BlockHash, Vec<BcsLog>)>),
    Accounts(Vec<(BlockHash, u64, AccountState)>),
    /// Per block number: the proved total difficulty, None when the proof
    /// failed. A legitimate zero difficulty is `Some(U256::ZERO)`.
    Proofs(Vec<(u64, Option<U256>)>),
    Statuses(Vec<(TxHash, TransactionStatus)>),
    Submit { hash: TxHash, error: Option<String> },
}

/// A completed provision, success or failure.
#[derive(Clone, Debug)]
pub struct ProvisionResult {
    pub identifier: u64,
    pub peer: PeerId,
    pub result: Result<ProvisionPayload, ProvisionError>,
}

/// The outbound half: the LES node (external) receives provisions here.
pub trait ProvisionIssuer: Send + Sync {
    fn issue(&self, provision: Provision);
    /// Currently connected peers; status queries go to all of them.
    fn peers(&self) -> Vec<PeerId>;
}

/// An issuer that drops everything; stands in when no peer pool is attached
/// (API-only modes, lifecycle tests).
#[derive(Debug, Default)]
pub struct NullIssuer;

impl ProvisionIssuer for NullIssuer {
    fn issue(&self, _provision: Provision) {}

    fn peers(&self) -> Vec<PeerId> {
        Vec::new()
    }
}
