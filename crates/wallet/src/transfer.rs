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

use crate::address::Address;
use crate::amount::Amount;
use crate::chains::btc::BtcTransferPayload;
use crate::chains::eth::EthTransferPayload;
use crate::chains::gen::GenTransferPayload;
use crate::feebasis::FeeBasis;
use crate::network::ChainFamily;
use crate::unit::UnitRef;
use std::sync::{Arc, Mutex};
use walletkit_primitives::TxHash;

/// Who moved value, from this wallet's point of view.
///
/// Recovered marks a transfer whose source and target are both ours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Sent,
    Received,
    Recovered,
}

/// Lifecycle state of a transfer.
///
/// Included and Errored carry payloads; the discriminants are wire values
/// fixed by the callback contract.
#[derive(Clone, Debug, PartialEq)]
pub enum TransferState {
    Created,
    Signed,
    Submitted,
    Included {
        block_number: u64,
        transaction_index: u64,
        timestamp: u64,
        fee: Option<Amount>,
    },
    Errored {
        message: String,
    },
    Deleted,
}

impl TransferState {
    /// The wire discriminant: CREATED=0 through DELETED=5.
    pub fn tag(&self) -> u8 {
        match self {
            TransferState::Created => 0,
            TransferState::Signed => 1,
            TransferState::Submitted => 2,
            TransferState::Included { .. } => 3,
            TransferState::Errored { .. } => 4,
            TransferState::Deleted => 5,
        }
    }

    pub fn is_included(&self) -> bool {
        matches!(self, TransferState::Included { .. })
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, TransferState::Errored { .. })
    }
}

/// Chain-specific transaction record inside a transfer; owned exclusively by
/// the wrapping transfer and released with it.
#[derive(Debug)]
pub enum TransferPayload {
    Bitcoin(BtcTransferPayload),
    Ethereum(EthTransferPayload),
    Generic(GenTransferPayload),
}

impl TransferPayload {
    pub fn family(&self) -> ChainFamily {
        match self {
            TransferPayload::Bitcoin(_) => ChainFamily::Utxo,
            TransferPayload::Ethereum(_) => ChainFamily::Ethereum,
            TransferPayload::Generic(_) => ChainFamily::Generic,
        }
    }
}

struct TransferShared {
    state: TransferState,
    hash: Option<TxHash>,
    confirmed_fee_basis: Option<FeeBasis>,
}

/// One movement of value, tracked from creation through inclusion.
pub struct Transfer {
    source: Address,
    target: Address,
    amount: Amount,
    fee_unit: UnitRef,
    estimated_fee_basis: FeeBasis,
    direction: TransferDirection,
    shared: Mutex<TransferShared>,
    payload: Mutex<TransferPayload>,
}

pub type TransferRef = Arc<Transfer>;

impl Transfer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Address,
        target: Address,
        amount: Amount,
        fee_unit: UnitRef,
        estimated_fee_basis: FeeBasis,
        direction: TransferDirection,
        hash: Option<TxHash>,
        payload: TransferPayload,
    ) -> TransferRef {
        Arc::new(Self {
            source,
            target,
            amount,
            fee_unit,
            estimated_fee_basis,
            direction,
            shared: Mutex::new(TransferShared {
                state: TransferState::Created,
                hash,
                confirmed_fee_basis: None,
            }),
            payload: Mutex::new(payload),
        })
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn amount(&self) -> &Amount {
        &self.amount
    }

    /// The signed amount: negative when sent, positive when received, zero
    /// net for a recovered (self) transfer.
    pub fn signed_amount(&self) -> Amount {
        match self.direction {
            TransferDirection::Sent => self.amount.neg(),
            TransferDirection::Received => self.amount.clone(),
            TransferDirection::Recovered => {
                Amount::from_base(self.amount.unit().clone(), false, Default::default())
            }
        }
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn unit_for_fee(&self) -> &UnitRef {
        &self.fee_unit
    }

    pub fn state(&self) -> TransferState {
        self.shared.lock().unwrap().state.clone()
    }

    /// Replaces the state, returning the previous one. Event emission is the
    /// caller's job; a lock is never held across a listener callback.
    pub fn set_state(&self, next: TransferState) -> TransferState {
        let mut shared = self.shared.lock().unwrap();
        std::mem::replace(&mut shared.state, next)
    }

    pub fn hash(&self) -> Option<TxHash> {
        self.shared.lock().unwrap().hash
    }

    pub fn set_hash(&self, hash: TxHash) {
        self.shared.lock().unwrap().hash = Some(hash);
    }

    pub fn estimated_fee_basis(&self) -> &FeeBasis {
        &self.estimated_fee_basis
    }

    pub fn confirmed_fee_basis(&self) -> Option<FeeBasis> {
        self.shared.lock().unwrap().confirmed_fee_basis.clone()
    }

    pub fn confirm_fee_basis(&self, basis: FeeBasis) {
        self.shared.lock().unwrap().confirmed_fee_basis = Some(basis);
    }

    /// The fee as an amount in the unit-for-fee: the included fee when final,
    /// else the confirmed basis, else the estimate.
    pub fn fee(&self) -> Option<Amount> {
        let shared = self.shared.lock().unwrap();
        if let TransferState::Included { fee: Some(fee), .. } = &shared.state {
            return Some(fee.clone());
        }
        let basis = shared
            .confirmed_fee_basis
            .as_ref()
            .unwrap_or(&self.estimated_fee_basis);
        basis
            .fee()
            .map(|value| Amount::from_base(self.fee_unit.clone(), false, value))
    }

    pub fn family(&self) -> ChainFamily {
        self.payload.lock().unwrap().family()
    }

    pub fn with_payload<R>(&self, f: impl FnOnce(&TransferPayload) -> R) -> R {
        f(&self.payload.lock().unwrap())
    }

    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut TransferPayload) -> R) -> R {
        f(&mut self.payload.lock().unwrap())
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("source", &self.source.to_string())
            .field("target", &self.target.to_string())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("hash", &self.hash())
            .finish()
    }
}
