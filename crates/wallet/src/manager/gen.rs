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

//! The generic sub-manager: a periodic dispatcher over the client callbacks
//! plus transfer recovery from JSON-shaped records, persisted through the
//! file service and replayed at start.

use crate::address::Address;
use crate::amount::Amount;
use crate::chains::gen::{GenTransferBlob, GenTransferPayload, GenWallet};
use crate::client::AnnouncedTransfer;
use crate::handlers::ChainHandler;
use crate::manager::WalletManager;
use crate::storage::{entity, FileService};
use crate::transfer::{Transfer, TransferDirection, TransferPayload, TransferRef, TransferState};
use crate::wallet::{WalletPayload, WalletRef};
use alloy_primitives::U256;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use walletkit_primitives::TxHash;

/// Period of the block-height / transfers / submissions poll.
pub const GEN_DISPATCH_PERIOD_SECONDS: u64 = 10;

/// The pluggable sub-manager for single-currency account chains.
pub struct GenManager {
    pub handler: Arc<dyn ChainHandler>,
    pub wallet: Arc<GenWallet>,
    storage: Arc<dyn FileService>,
    last_dispatch: Mutex<Option<Instant>>,
}

impl GenManager {
    pub fn new(
        handler: Arc<dyn ChainHandler>,
        wallet: Arc<GenWallet>,
        storage: Arc<dyn FileService>,
    ) -> Self {
        Self {
            handler,
            wallet,
            storage,
            last_dispatch: Mutex::new(None),
        }
    }

    /// True once per dispatch period; the first call after connect fires
    /// immediately.
    pub fn dispatch_due(&self) -> bool {
        let mut last = self.last_dispatch.lock().unwrap();
        let due = match *last {
            None => true,
            Some(at) => at.elapsed() >= Duration::from_secs(GEN_DISPATCH_PERIOD_SECONDS),
        };
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// Replays transfers persisted in earlier sessions into the wallet,
    /// behind the creation events.
    pub fn replay_persisted(&self, manager: &WalletManager, wallet: &WalletRef) {
        for (key, blob) in self.storage.load_all(entity::TRANSFER) {
            match serde_json::from_slice::<GenTransferBlob>(&blob) {
                Ok(blob) => {
                    handle_transfer(
                        manager,
                        wallet,
                        AnnouncedTransfer {
                            hash: blob.hash,
                            uids: blob.uids,
                            source: blob.source,
                            target: blob.target,
                            amount: blob.amount,
                            currency: blob.currency,
                            fee: blob.fee,
                            timestamp: blob.timestamp,
                            block_height: blob.block_height,
                            errored: blob.errored,
                        },
                    );
                }
                Err(error) => warn!("persisted transfer {key} unreadable: {error}"),
            }
        }
    }

    /// Files the transfer for replay at the next start.
    pub fn persist_transfer(&self, wallet: &WalletRef, transfer: &TransferRef) {
        let Some(hash) = transfer.hash() else { return };
        let (block_height, timestamp, errored) = match transfer.state() {
            TransferState::Included {
                block_number,
                timestamp,
                ..
            } => (block_number, timestamp, false),
            TransferState::Errored { .. } => (0, 0, true),
            _ => (0, 0, false),
        };
        let blob = GenTransferBlob {
            uids: transfer.with_payload(|payload| match payload {
                TransferPayload::Generic(inner) => inner.uids.clone(),
                _ => String::new(),
            }),
            hash: hash.to_string(),
            source: transfer.source().to_string(),
            target: transfer.target().to_string(),
            amount: transfer.amount().base_value().to_string(),
            currency: wallet.currency().code().to_string(),
            fee: transfer
                .fee()
                .map(|fee| fee.base_value().to_string())
                .unwrap_or_default(),
            timestamp,
            block_height,
            errored,
        };
        match serde_json::to_vec(&blob) {
            Ok(bytes) => self.storage.save(entity::TRANSFER, &blob.hash, &bytes),
            Err(error) => warn!("transfer {hash} not persisted: {error}"),
        }
    }
}

fn parse_hash(text: &str) -> Option<TxHash> {
    let digits = text.trim_start_matches("0x");
    let bytes = alloy_primitives::hex::decode(digits).ok()?;
    (bytes.len() == 32).then(|| TxHash::from_slice(&bytes))
}

/// Recovers one announced transfer into `wallet`: find-or-create by hash,
/// state from the reported fields, events in the contract order, then the
/// balance update.
pub fn handle_transfer(manager: &WalletManager, wallet: &WalletRef, announced: AnnouncedTransfer) {
    let Some(hash) = parse_hash(&announced.hash) else {
        warn!("announced transfer with undecodable hash {:?}", announced.hash);
        return;
    };
    if wallet.find_transfer_by_hash(&hash).is_some() {
        debug!("announced transfer {hash} already known");
        return;
    }

    let our_address = wallet
        .address(match wallet.payload() {
            WalletPayload::Generic(_) => crate::wallet::AddressScheme::GenDefault,
            WalletPayload::Ethereum(_) => crate::wallet::AddressScheme::EthDefault,
            WalletPayload::Bitcoin(_) => crate::wallet::AddressScheme::BtcLegacy,
        })
        .map(|address| address.to_string())
        .unwrap_or_default();

    let sent = announced.source.eq_ignore_ascii_case(&our_address);
    let received = announced.target.eq_ignore_ascii_case(&our_address);
    let direction = match (sent, received) {
        (true, true) => TransferDirection::Recovered,
        (true, false) => TransferDirection::Sent,
        _ => TransferDirection::Received,
    };

    let amount_value = U256::from_str_radix(&announced.amount, 10).unwrap_or(U256::ZERO);
    let fee_value = U256::from_str_radix(&announced.fee, 10).ok();
    let amount = Amount::from_base(wallet.base_unit().clone(), false, amount_value);

    let (source, target, payload) = match wallet.payload() {
        WalletPayload::Generic(gen) => {
            let parse = |text: &str| {
                manager_handler(manager)
                    .and_then(|handler| handler.address_parse(text).ok())
                    .unwrap_or_else(|| Address::generic(gen.account.chain, vec![], text))
            };
            let source = parse(&announced.source);
            let target = parse(&announced.target);
            let payload = TransferPayload::Generic(GenTransferPayload {
                chain: gen.account.chain,
                uids: announced.uids.clone(),
                source: match &source {
                    Address::Generic(inner) => inner.clone(),
                    _ => gen.account.address.clone(),
                },
                target: match &target {
                    Address::Generic(inner) => inner.clone(),
                    _ => gen.account.address.clone(),
                },
                amount: amount_value,
                fee: fee_value,
                hash: Some(hash),
                raw: None,
            });
            (source, target, payload)
        }
        WalletPayload::Ethereum(eth) => {
            let parse = |text: &str| {
                text.parse::<alloy_primitives::Address>()
                    .map(Address::ethereum)
                    .unwrap_or_else(|_| Address::generic("eth", vec![], text))
            };
            let payload = TransferPayload::Ethereum(crate::chains::eth::EthTransferPayload {
                nonce: 0,
                gas_price_wei: U256::ZERO,
                gas_limit: 0,
                to: announced.target.parse().unwrap_or_default(),
                value: amount_value,
                data: Vec::new(),
                chain_id: eth.chain_id,
                signature: None,
            });
            (parse(&announced.source), parse(&announced.target), payload)
        }
        WalletPayload::Bitcoin(_) => {
            warn!("announced JSON transfer on a UTXO wallet, ignoring");
            return;
        }
    };

    let transfer = Transfer::new(
        source,
        target,
        amount,
        wallet.unit_for_fee().clone(),
        wallet.default_fee_basis(),
        direction,
        Some(hash),
        payload,
    );

    // The reported state: INCLUDED with its position, ERRORED, or still
    // in flight.
    let new_state = if announced.errored {
        Some(TransferState::Errored {
            message: "reported failed".to_string(),
        })
    } else if announced.block_height > 0 {
        Some(TransferState::Included {
            block_number: announced.block_height,
            transaction_index: 0,
            timestamp: announced.timestamp,
            fee: fee_value
                .map(|value| Amount::from_base(wallet.unit_for_fee().clone(), false, value)),
        })
    } else {
        Some(TransferState::Submitted)
    };

    if !wallet.add_transfer(transfer.clone()) {
        return;
    }
    manager.emit_transfer_created(wallet, &transfer);
    if let Some(new_state) = new_state {
        let old = transfer.set_state(new_state.clone());
        if old != new_state {
            manager.emit_transfer_changed(wallet, &transfer, old, new_state);
        }
    }

    // Generic balances follow the directional sum of the transfer set.
    if let WalletPayload::Generic(gen) = wallet.payload() {
        gen.set_balance(directional_balance(wallet));
    }
    manager.emit_balance_updated(wallet);
}

fn manager_handler(manager: &WalletManager) -> Option<Arc<dyn ChainHandler>> {
    match manager.sub_manager() {
        crate::manager::SubManager::Generic(gen) => Some(gen.handler.clone()),
        _ => None,
    }
}

/// The net directional sum of the wallet's non-errored transfers.
fn directional_balance(wallet: &WalletRef) -> U256 {
    let mut balance = U256::ZERO;
    for transfer in wallet.transfers() {
        if transfer.state().is_errored() {
            continue;
        }
        let value = transfer.amount().base_value();
        match transfer.direction() {
            TransferDirection::Received => balance = balance.saturating_add(value),
            TransferDirection::Sent => balance = balance.saturating_sub(value),
            TransferDirection::Recovered => {}
        }
    }
    balance
}
