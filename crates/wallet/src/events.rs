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

//! Event types delivered to the embedder's listener.
//!
//! Events from one manager arrive in creation order, on the manager's event
//! thread, with no lock held. The ordering contracts (a transfer's ADD before
//! its first CHANGED; a wallet's TRANSFER_ADDED before the following
//! BALANCE_UPDATED) are load-bearing for embedders.

use crate::amount::Amount;
use crate::feebasis::FeeBasis;
use crate::transfer::{TransferRef, TransferState};
use crate::wallet::{WalletRef, WalletState};

/// Lifecycle of a wallet manager.
#[derive(Clone, Debug, PartialEq)]
pub enum ManagerState {
    Created,
    Connected,
    Syncing,
    Disconnected { reason: String },
    Deleted,
}

#[derive(Clone, Debug)]
pub enum ManagerEvent {
    Created,
    Changed {
        old: ManagerState,
        new: ManagerState,
    },
    Deleted,
    WalletAdded(WalletRef),
    WalletChanged(WalletRef),
    WalletDeleted(WalletRef),
    SyncStarted,
    SyncContinues {
        percent: f32,
    },
    SyncStopped {
        error: Option<String>,
    },
    SyncRecommended {
        depth: u64,
    },
    BlockHeightUpdated {
        height: u64,
    },
}

#[derive(Clone, Debug)]
pub enum WalletEvent {
    Created,
    Changed {
        old: WalletState,
        new: WalletState,
    },
    Deleted,
    TransferAdded(TransferRef),
    TransferChanged(TransferRef),
    TransferSubmitted(TransferRef),
    TransferDeleted(TransferRef),
    BalanceUpdated(Amount),
    FeeBasisUpdated(FeeBasis),
    FeeBasisEstimated {
        cookie: u64,
        basis: Option<FeeBasis>,
    },
}

#[derive(Clone, Debug)]
pub enum TransferEvent {
    Created,
    Changed {
        old: TransferState,
        new: TransferState,
    },
    Deleted,
}

/// The embedder's listener trio. Callbacks run on the manager's event
/// thread; implementations must not call back into the manager while
/// handling one.
pub trait Listener: Send + Sync {
    fn manager_event(&self, event: ManagerEvent);
    fn wallet_event(&self, wallet: &WalletRef, event: WalletEvent);
    fn transfer_event(&self, wallet: &WalletRef, transfer: &TransferRef, event: TransferEvent);
}

/// A listener that ignores everything.
#[derive(Debug, Default)]
pub struct NullListener;

impl Listener for NullListener {
    fn manager_event(&self, _event: ManagerEvent) {}
    fn wallet_event(&self, _wallet: &WalletRef, _event: WalletEvent) {}
    fn transfer_event(
        &self,
        _wallet: &WalletRef,
        _transfer: &TransferRef,
        _event: TransferEvent,
    ) {
    }
}
