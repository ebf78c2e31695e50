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

//! Per-currency wallet: the transfer index, the balance, and transfer
//! creation delegating to the chain-specific builders.
//!
//! The wallet's collections sit behind one mutex; internal helpers suffixed
//! `_locked` run under it, public methods acquire it, and no listener
//! callback ever runs while it is held. Transfer references removed from the
//! wallet are returned to the caller and dropped outside the lock.

use crate::address::Address;
use crate::amount::{Amount, AmountError};
use crate::chains::btc::{BtcError, BtcWallet};
use crate::chains::eth::{erc20_transfer_data, EthTransferPayload, EthWallet};
use crate::chains::gen::GenWallet;
use crate::currency::CurrencyRef;
use crate::feebasis::FeeBasis;
use crate::handlers::{self, HandlerError};
use crate::network::ChainFamily;
use crate::transfer::{Transfer, TransferDirection, TransferPayload, TransferRef};
use crate::unit::UnitRef;
use alloy_primitives::U256;
use std::sync::{Arc, Mutex};
use thiserror::Error as ThisError;
use walletkit_primitives::TxHash;

/// Receive-address formats selectable per wallet family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressScheme {
    BtcLegacy,
    BtcSegwit,
    EthDefault,
    GenDefault,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletState {
    Created,
    Deleted,
}

/// Error returned by wallet operations.
#[derive(Debug, ThisError)]
pub enum WalletError {
    #[error("amount overflow")]
    AmountOverflow,
    #[error("incompatible currencies")]
    IncompatibleCurrencies,
    #[error("address scheme does not fit this wallet")]
    BadScheme,
    #[error("address or fee basis from another chain family")]
    WrongFamily,
    #[error("bad address")]
    BadAddress,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("output below the dust limit")]
    OutputBelowDust,
    #[error("wallet is deleted")]
    Deleted,
    #[error("operation unsupported for this chain")]
    Unsupported,
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl From<BtcError> for WalletError {
    fn from(error: BtcError) -> Self {
        match error {
            BtcError::InsufficientFunds => WalletError::InsufficientFunds,
            BtcError::OutputBelowDust => WalletError::OutputBelowDust,
            _ => WalletError::BadAddress,
        }
    }
}

impl From<AmountError> for WalletError {
    fn from(error: AmountError) -> Self {
        match error {
            AmountError::IncompatibleCurrencies => WalletError::IncompatibleCurrencies,
            _ => WalletError::AmountOverflow,
        }
    }
}

/// The chain-family sub-wallet inside a wallet.
#[derive(Debug)]
pub enum WalletPayload {
    Bitcoin(Arc<BtcWallet>),
    Ethereum(Arc<EthWallet>),
    Generic(Arc<GenWallet>),
}

impl WalletPayload {
    pub fn family(&self) -> ChainFamily {
        match self {
            WalletPayload::Bitcoin(_) => ChainFamily::Utxo,
            WalletPayload::Ethereum(_) => ChainFamily::Ethereum,
            WalletPayload::Generic(_) => ChainFamily::Generic,
        }
    }
}

/// Result of [Wallet::estimate_limit].
#[derive(Clone, Debug)]
pub struct EstimatedLimit {
    pub amount: Amount,
    /// The caller must follow up with an asynchronous fee estimation.
    pub needs_estimate: bool,
    /// The balance cannot cover the fee; the amount was clamped to zero.
    pub zero_if_insufficient: bool,
}

struct WalletInner {
    transfers: Vec<TransferRef>,
    default_fee_basis: FeeBasis,
}

/// One currency's holdings and transfer history within a manager.
pub struct Wallet {
    currency: CurrencyRef,
    unit: UnitRef,
    base_unit: UnitRef,
    fee_unit: UnitRef,
    state: Mutex<WalletState>,
    inner: Mutex<WalletInner>,
    payload: WalletPayload,
}

pub type WalletRef = Arc<Wallet>;

impl Wallet {
    pub fn new(
        currency: CurrencyRef,
        unit: UnitRef,
        base_unit: UnitRef,
        fee_unit: UnitRef,
        default_fee_basis: FeeBasis,
        payload: WalletPayload,
    ) -> WalletRef {
        Arc::new(Self {
            currency,
            unit,
            base_unit,
            fee_unit,
            state: Mutex::new(WalletState::Created),
            inner: Mutex::new(WalletInner {
                transfers: Vec::new(),
                default_fee_basis,
            }),
            payload,
        })
    }

    pub fn currency(&self) -> &CurrencyRef {
        &self.currency
    }

    pub fn unit(&self) -> &UnitRef {
        &self.unit
    }

    pub fn base_unit(&self) -> &UnitRef {
        &self.base_unit
    }

    pub fn unit_for_fee(&self) -> &UnitRef {
        &self.fee_unit
    }

    pub fn family(&self) -> ChainFamily {
        self.payload.family()
    }

    pub fn payload(&self) -> &WalletPayload {
        &self.payload
    }

    pub fn state(&self) -> WalletState {
        self.state.lock().unwrap().clone()
    }

    /// Marks the wallet deleted, returning the previous state.
    pub fn set_state(&self, next: WalletState) -> WalletState {
        std::mem::replace(&mut self.state.lock().unwrap(), next)
    }

    /// Balance in the wallet's default unit: the UTXO set for Bitcoin, the
    /// ether or token quantity for Ethereum, the handler's number for
    /// generic chains.
    pub fn balance(&self) -> Amount {
        let value = match &self.payload {
            WalletPayload::Bitcoin(btc) => U256::from(btc.balance_sats()),
            WalletPayload::Ethereum(eth) => eth.balance(),
            WalletPayload::Generic(gen) => gen.balance(),
        };
        Amount::from_base(self.unit.clone(), false, value)
    }

    fn is_member_locked(inner: &WalletInner, transfer: &TransferRef) -> bool {
        inner.transfers.iter().any(|held| {
            Arc::ptr_eq(held, transfer)
                || match (held.hash(), transfer.hash()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
        })
    }

    pub fn has_transfer(&self, transfer: &TransferRef) -> bool {
        Self::is_member_locked(&self.inner.lock().unwrap(), transfer)
    }

    /// Adds a transfer; a duplicate (by identity or hash) is a no-op.
    /// Returns whether the transfer was added.
    pub fn add_transfer(&self, transfer: TransferRef) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if Self::is_member_locked(&inner, &transfer) {
            return false;
        }
        inner.transfers.push(transfer);
        true
    }

    /// Detaches the transfer under the lock and hands the reference back so
    /// the caller releases it after the lock is gone.
    #[must_use = "drop the returned reference outside any wallet lock"]
    pub fn rem_transfer(&self, transfer: &TransferRef) -> Option<TransferRef> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner
            .transfers
            .iter()
            .position(|held| Arc::ptr_eq(held, transfer))?;
        Some(inner.transfers.remove(index))
    }

    pub fn transfers(&self) -> Vec<TransferRef> {
        self.inner.lock().unwrap().transfers.clone()
    }

    pub fn find_transfer_by_hash(&self, hash: &TxHash) -> Option<TransferRef> {
        self.inner
            .lock()
            .unwrap()
            .transfers
            .iter()
            .find(|held| held.hash().as_ref() == Some(hash))
            .cloned()
    }

    pub fn default_fee_basis(&self) -> FeeBasis {
        self.inner.lock().unwrap().default_fee_basis.clone()
    }

    /// Replaces the default fee basis; the basis must belong to this
    /// wallet's chain family. The caller emits FEE_BASIS_UPDATED.
    pub fn set_default_fee_basis(&self, basis: FeeBasis) -> Result<(), WalletError> {
        if basis.family() != self.family() {
            return Err(WalletError::WrongFamily);
        }
        self.inner.lock().unwrap().default_fee_basis = basis;
        Ok(())
    }

    /// The receive address under `scheme`. The scheme must fit the wallet's
    /// family.
    pub fn address(&self, scheme: AddressScheme) -> Result<Address, WalletError> {
        match (&self.payload, scheme) {
            (WalletPayload::Bitcoin(btc), AddressScheme::BtcLegacy) => Ok(Address::Bitcoin {
                address: btc.receive_address(false).map_err(|_| WalletError::BadAddress)?,
                is_bitcoin: btc.is_bitcoin(),
            }),
            (WalletPayload::Bitcoin(btc), AddressScheme::BtcSegwit) => Ok(Address::Bitcoin {
                address: btc.receive_address(true).map_err(|_| WalletError::BadAddress)?,
                is_bitcoin: btc.is_bitcoin(),
            }),
            (WalletPayload::Ethereum(eth), AddressScheme::EthDefault) => {
                Ok(Address::ethereum(eth.account.address()))
            }
            (WalletPayload::Generic(gen), AddressScheme::GenDefault) => {
                let handler = handlers::lookup(gen.account.chain)?;
                Ok(handler.account_address(&gen.account))
            }
            _ => Err(WalletError::BadScheme),
        }
    }

    /// Builds an unsigned transfer of `amount` to `target`, priced by
    /// `estimated_fee_basis`. The transfer is not yet part of the wallet;
    /// submission adds it.
    pub fn create_transfer(
        &self,
        target: &Address,
        amount: &Amount,
        estimated_fee_basis: &FeeBasis,
    ) -> Result<TransferRef, WalletError> {
        if self.state() == WalletState::Deleted {
            return Err(WalletError::Deleted);
        }
        if target.family() != self.family() || estimated_fee_basis.family() != self.family() {
            return Err(WalletError::WrongFamily);
        }
        if amount.currency().as_ref() != self.currency.as_ref() {
            return Err(WalletError::IncompatibleCurrencies);
        }

        match &self.payload {
            WalletPayload::Bitcoin(btc) => {
                let sats =
                    u64::try_from(amount.base_value()).map_err(|_| WalletError::AmountOverflow)?;
                let FeeBasis::Utxo { fee_per_kb, .. } = estimated_fee_basis else {
                    return Err(WalletError::WrongFamily);
                };
                let Address::Bitcoin { address, .. } = target else {
                    return Err(WalletError::BadAddress);
                };
                let payload = btc.create_transaction(address, sats, *fee_per_kb)?;
                let source = Address::Bitcoin {
                    address: btc.receive_address(false).map_err(|_| WalletError::BadAddress)?,
                    is_bitcoin: btc.is_bitcoin(),
                };
                Ok(Transfer::new(
                    source,
                    target.clone(),
                    amount.clone(),
                    self.fee_unit.clone(),
                    estimated_fee_basis.clone(),
                    TransferDirection::Sent,
                    None,
                    TransferPayload::Bitcoin(payload),
                ))
            }
            WalletPayload::Ethereum(eth) => {
                let FeeBasis::Ethereum {
                    gas_limit,
                    gas_price_wei,
                } = estimated_fee_basis
                else {
                    return Err(WalletError::WrongFamily);
                };
                let Address::Ethereum(to) = target else {
                    return Err(WalletError::BadAddress);
                };
                let (to, value, data) = match &eth.token {
                    Some(token) => (
                        token.contract,
                        U256::ZERO,
                        erc20_transfer_data(*to, amount.base_value()),
                    ),
                    None => (*to, amount.base_value(), Vec::new()),
                };
                let payload = EthTransferPayload {
                    nonce: eth.account.nonce(),
                    gas_price_wei: *gas_price_wei,
                    gas_limit: *gas_limit,
                    to,
                    value,
                    data,
                    chain_id: eth.chain_id,
                    signature: None,
                };
                Ok(Transfer::new(
                    Address::ethereum(eth.account.address()),
                    target.clone(),
                    amount.clone(),
                    self.fee_unit.clone(),
                    estimated_fee_basis.clone(),
                    TransferDirection::Sent,
                    None,
                    TransferPayload::Ethereum(payload),
                ))
            }
            WalletPayload::Generic(gen) => {
                let handler = handlers::lookup(gen.account.chain)?;
                let payload =
                    handler.transfer_create(&gen.account, target, amount, estimated_fee_basis)?;
                let source = handler.account_address(&gen.account);
                Ok(Transfer::new(
                    source,
                    target.clone(),
                    amount.clone(),
                    self.fee_unit.clone(),
                    estimated_fee_basis.clone(),
                    TransferDirection::Sent,
                    None,
                    TransferPayload::Generic(payload),
                ))
            }
        }
    }

    /// The minimum (dust) or maximum (everything minus fees) sendable
    /// amount under `fee_basis`.
    pub fn estimate_limit(
        &self,
        as_maximum: bool,
        fee_basis: &FeeBasis,
    ) -> Result<EstimatedLimit, WalletError> {
        match &self.payload {
            WalletPayload::Bitcoin(btc) => {
                let FeeBasis::Utxo { fee_per_kb, .. } = fee_basis else {
                    return Err(WalletError::WrongFamily);
                };
                let (sats, zero_if_insufficient) = btc.estimate_limit(as_maximum, *fee_per_kb);
                Ok(EstimatedLimit {
                    amount: Amount::from_base(self.unit.clone(), false, U256::from(sats)),
                    needs_estimate: false,
                    zero_if_insufficient,
                })
            }
            WalletPayload::Ethereum(eth) => {
                let value = if as_maximum { eth.balance() } else { U256::ZERO };
                Ok(EstimatedLimit {
                    amount: Amount::from_base(self.unit.clone(), false, value),
                    // The true maximum depends on gas; the caller follows up
                    // with an asynchronous estimate.
                    needs_estimate: true,
                    zero_if_insufficient: false,
                })
            }
            WalletPayload::Generic(_) => Err(WalletError::Unsupported),
        }
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("currency", &self.currency.code())
            .field("family", &self.family())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::{Currency, CURRENCY_KIND_NATIVE};
    use crate::unit::Unit;
    use walletkit_primitives::mpk::MasterPublicKey;
    use walletkit_primitives::phrase;

    const PAPER_KEY: &str =
        "ginger settle marine tissue robot crane night number ramp coast roast critic";

    fn btc_wallet() -> WalletRef {
        let seed = phrase::derive_seed(PAPER_KEY).unwrap();
        let mpk = MasterPublicKey::from_seed(seed.as_bytes(), bitcoin::Network::Testnet).unwrap();
        let currency = Currency::new("bitcoin-testnet:btc", "Bitcoin", "BTC", CURRENCY_KIND_NATIVE, None);
        let sat = Unit::base(currency.clone(), "btc-sat", "Satoshi", "SAT");
        let btc = Unit::derived(currency.clone(), "btc-btc", "Bitcoin", "BTC", &sat, 8);
        Wallet::new(
            currency,
            btc,
            sat.clone(),
            sat,
            FeeBasis::Utxo {
                fee_per_kb: 5000,
                size_in_bytes: 0,
            },
            WalletPayload::Bitcoin(Arc::new(BtcWallet::new(
                bitcoin::Network::Testnet,
                true,
                mpk,
            ))),
        )
    }

    #[test]
    fn address_scheme_must_fit() {
        let wallet = btc_wallet();
        assert!(wallet.address(AddressScheme::BtcLegacy).is_ok());
        assert!(wallet.address(AddressScheme::BtcSegwit).is_ok());
        assert!(matches!(
            wallet.address(AddressScheme::EthDefault),
            Err(WalletError::BadScheme)
        ));
    }

    #[test]
    fn fee_basis_family_is_enforced() {
        let wallet = btc_wallet();
        assert!(matches!(
            wallet.set_default_fee_basis(FeeBasis::Ethereum {
                gas_limit: 21000,
                gas_price_wei: U256::from(1),
            }),
            Err(WalletError::WrongFamily)
        ));
        assert!(wallet
            .set_default_fee_basis(FeeBasis::Utxo {
                fee_per_kb: 1000,
                size_in_bytes: 0,
            })
            .is_ok());
    }

    #[test]
    fn cross_currency_transfer_rejected() {
        let wallet = btc_wallet();
        let eth_currency = Currency::new("ethereum:eth", "Ether", "ETH", CURRENCY_KIND_NATIVE, None);
        let wei = Unit::base(eth_currency, "eth-wei", "Wei", "WEI");
        let amount = Amount::from_integer(1, wei).unwrap();
        let target = wallet.address(AddressScheme::BtcLegacy).unwrap();
        assert!(matches!(
            wallet.create_transfer(&target, &amount, &wallet.default_fee_basis()),
            Err(WalletError::IncompatibleCurrencies)
        ));
    }

    #[test]
    fn add_transfer_is_idempotent() {
        let wallet = btc_wallet();
        let transfer = Transfer::new(
            wallet.address(AddressScheme::BtcLegacy).unwrap(),
            wallet.address(AddressScheme::BtcLegacy).unwrap(),
            Amount::from_integer(1, wallet.base_unit().clone()).unwrap(),
            wallet.unit_for_fee().clone(),
            wallet.default_fee_basis(),
            TransferDirection::Sent,
            Some(TxHash::with_last_byte(1)),
            TransferPayload::Bitcoin(crate::chains::btc::BtcTransferPayload {
                tx: bitcoin::Transaction {
                    version: bitcoin::transaction::Version::ONE,
                    lock_time: bitcoin::absolute::LockTime::ZERO,
                    input: vec![],
                    output: vec![],
                },
                fee_sats: None,
            }),
        );
        assert!(wallet.add_transfer(transfer.clone()));
        assert!(!wallet.add_transfer(transfer.clone()));
        assert_eq!(wallet.transfers().len(), 1);

        let removed = wallet.rem_transfer(&transfer).expect("present");
        drop(removed);
        assert!(!wallet.has_transfer(&transfer));
    }

    #[test]
    fn estimate_limit_minimum_is_dust() {
        let wallet = btc_wallet();
        let limit = wallet
            .estimate_limit(false, &wallet.default_fee_basis())
            .unwrap();
        assert!(!limit.needs_estimate);
        assert_eq!(
            limit.amount.base_value(),
            U256::from(crate::chains::btc::DUST_LIMIT_SATS)
        );
    }
}
