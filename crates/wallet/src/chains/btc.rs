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

//! The UTXO chain family: a sub-wallet tracking the address space derived
//! from the master public key, the registered transaction set, and the UTXO
//! set both imply.
//!
//! Balance and ownership are pure functions of the registered transaction
//! set, so registration order never changes the result.

use bitcoin::absolute::LockTime;
use bitcoin::bip32::ChildNumber;
use bitcoin::hashes::Hash;
use bitcoin::key::CompressedPublicKey;
use bitcoin::script::{Instruction, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address as BtcAddress, Amount as BtcAmount, EcdsaSighashType, Network, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error as ThisError;
use walletkit_primitives::mpk::{account_signing_key, MasterPublicKey};
use walletkit_primitives::phrase::Seed;

/// Unused receive addresses kept derived beyond the highest used index.
pub const GAP_LIMIT_EXTERNAL: u32 = 10;
/// Unused change addresses kept derived beyond the highest used index.
pub const GAP_LIMIT_INTERNAL: u32 = 5;

/// Outputs below this are uneconomical to spend.
pub const DUST_LIMIT_SATS: u64 = 546;

// Conservative legacy size estimates for fee sizing.
const TX_BASE_SIZE: u64 = 10;
const TX_INPUT_SIZE: u64 = 148;
const TX_OUTPUT_SIZE: u64 = 34;

/// Error returned by UTXO wallet operations.
#[derive(Debug, ThisError)]
pub enum BtcError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("output below the dust limit")]
    OutputBelowDust,
    #[error("input spends an unknown output")]
    MissingPrevout,
    #[error("key derivation failed")]
    Derivation,
    #[error("signing requires private material")]
    Signing,
}

/// Derivation position of an owned script: chain 0 receive, chain 1 change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyPath {
    pub chain: u32,
    pub index: u32,
}

/// A registered transaction with its chain position.
#[derive(Clone, Debug)]
pub struct TxRecord {
    pub tx: Transaction,
    pub block_height: u32,
    pub timestamp: u32,
}

/// Direction and principal of one registered transaction, as a transfer.
#[derive(Clone, Debug)]
pub struct BtcTransferParts {
    pub source: Option<BtcAddress>,
    pub target: Option<BtcAddress>,
    /// The principal in satoshis: owned outputs when receiving, non-owned
    /// outputs when sending.
    pub amount_sats: u64,
    /// Known only when every spent output is in the wallet's set.
    pub fee_sats: Option<u64>,
    pub sent: bool,
    pub received: bool,
}

/// The underlying transaction of a UTXO transfer.
#[derive(Clone, Debug)]
pub struct BtcTransferPayload {
    pub tx: Transaction,
    pub fee_sats: Option<u64>,
}

struct Snapshot {
    /// script → derivation path, for every derived script within gap limits.
    scripts: HashMap<ScriptBuf, KeyPath>,
    /// outpoint → (output, path) for outputs paying an owned script.
    owned: HashMap<OutPoint, (TxOut, KeyPath)>,
    /// Outpoints consumed by a registered input.
    spent: HashSet<OutPoint>,
    /// Highest used index + 1, per chain.
    used: [u32; 2],
}

struct Inner {
    txs: BTreeMap<Txid, TxRecord>,
}

/// Per-currency UTXO sub-wallet.
pub struct BtcWallet {
    network: Network,
    is_bitcoin: bool,
    mpk: MasterPublicKey,
    inner: Mutex<Inner>,
}

impl BtcWallet {
    pub fn new(network: Network, is_bitcoin: bool, mpk: MasterPublicKey) -> Self {
        Self {
            network,
            is_bitcoin,
            mpk,
            inner: Mutex::new(Inner {
                txs: BTreeMap::new(),
            }),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_bitcoin(&self) -> bool {
        self.is_bitcoin
    }

    fn scripts_for(&self, chain: u32, index: u32) -> Option<(ScriptBuf, ScriptBuf)> {
        let pubkey = self.mpk.pubkey_at(chain, index).ok()?;
        let p2pkh = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
        let p2wpkh = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
        Some((p2pkh, p2wpkh))
    }

    /// Derives the address space to a fixpoint against the transaction set:
    /// deriving more addresses can reveal more used ones, which widens the
    /// gap window again.
    fn snapshot_locked(&self, inner: &Inner) -> Snapshot {
        let mut scripts: HashMap<ScriptBuf, KeyPath> = HashMap::new();
        let mut derived = [0u32; 2];
        let mut used = [0u32; 2];

        loop {
            let limits = [used[0] + GAP_LIMIT_EXTERNAL, used[1] + GAP_LIMIT_INTERNAL];
            let mut grew = false;
            for chain in 0..2u32 {
                while derived[chain as usize] < limits[chain as usize] {
                    let index = derived[chain as usize];
                    if let Some((p2pkh, p2wpkh)) = self.scripts_for(chain, index) {
                        scripts.insert(p2pkh, KeyPath { chain, index });
                        scripts.insert(p2wpkh, KeyPath { chain, index });
                    }
                    derived[chain as usize] += 1;
                    grew = true;
                }
            }

            let mut widened = false;
            for record in inner.txs.values() {
                for output in &record.tx.output {
                    if let Some(path) = scripts.get(&output.script_pubkey) {
                        let next = path.index + 1;
                        if next > used[path.chain as usize] {
                            used[path.chain as usize] = next;
                            widened = true;
                        }
                    }
                }
            }
            if !grew && !widened {
                break;
            }
        }

        let mut owned = HashMap::new();
        let mut spent = HashSet::new();
        for (txid, record) in &inner.txs {
            for input in &record.tx.input {
                spent.insert(input.previous_output);
            }
            for (vout, output) in record.tx.output.iter().enumerate() {
                if let Some(path) = scripts.get(&output.script_pubkey) {
                    owned.insert(
                        OutPoint::new(*txid, vout as u32),
                        (output.clone(), *path),
                    );
                }
            }
        }

        Snapshot {
            scripts,
            owned,
            spent,
            used,
        }
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshot_locked(&self.inner.lock().unwrap())
    }

    /// Registers a transaction; idempotent by txid. Returns false when the
    /// transaction was already present.
    pub fn register_transaction(&self, tx: Transaction, block_height: u32, timestamp: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let txid = tx.compute_txid();
        if inner.txs.contains_key(&txid) {
            return false;
        }
        inner.txs.insert(
            txid,
            TxRecord {
                tx,
                block_height,
                timestamp,
            },
        );
        true
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.inner.lock().unwrap().txs.contains_key(txid)
    }

    pub fn transaction(&self, txid: &Txid) -> Option<TxRecord> {
        self.inner.lock().unwrap().txs.get(txid).cloned()
    }

    pub fn transactions(&self) -> Vec<TxRecord> {
        self.inner.lock().unwrap().txs.values().cloned().collect()
    }

    /// Confirmed-plus-pending balance in satoshis: owned outputs not spent by
    /// any registered input.
    pub fn balance_sats(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let snapshot = self.snapshot_locked(&inner);
        snapshot
            .owned
            .iter()
            .filter(|(outpoint, _)| !snapshot.spent.contains(outpoint))
            .map(|(_, (output, _))| output.value.to_sat())
            .sum()
    }

    fn unspent(&self, snapshot: &Snapshot) -> Vec<(OutPoint, TxOut, KeyPath)> {
        let mut utxos: Vec<_> = snapshot
            .owned
            .iter()
            .filter(|(outpoint, _)| !snapshot.spent.contains(outpoint))
            .map(|(outpoint, (output, path))| (*outpoint, output.clone(), *path))
            .collect();
        utxos.sort_by_key(|(outpoint, _, _)| (outpoint.txid, outpoint.vout));
        utxos
    }

    fn address_at(&self, path: KeyPath, segwit: bool) -> Result<BtcAddress, BtcError> {
        let pubkey = self
            .mpk
            .pubkey_at(path.chain, path.index)
            .map_err(|_| BtcError::Derivation)?;
        Ok(if segwit {
            BtcAddress::p2wpkh(&pubkey, self.network)
        } else {
            BtcAddress::p2pkh(pubkey.pubkey_hash(), self.network)
        })
    }

    /// The first unused receive address.
    pub fn receive_address(&self, segwit: bool) -> Result<BtcAddress, BtcError> {
        let used = self.snapshot().used[0];
        self.address_at(
            KeyPath {
                chain: 0,
                index: used,
            },
            segwit,
        )
    }

    fn change_address(&self, snapshot: &Snapshot) -> Result<BtcAddress, BtcError> {
        self.address_at(
            KeyPath {
                chain: 1,
                index: snapshot.used[1],
            },
            false,
        )
    }

    pub fn is_owned_script(&self, script: &ScriptBuf) -> bool {
        self.snapshot().scripts.contains_key(script)
    }

    fn estimated_fee(fee_per_kb: u64, inputs: u64, outputs: u64) -> u64 {
        let size = TX_BASE_SIZE + inputs * TX_INPUT_SIZE + outputs * TX_OUTPUT_SIZE;
        (fee_per_kb * size).div_ceil(1000)
    }

    /// Builds an unsigned transaction paying `amount_sats` to `target`.
    pub fn create_transaction(
        &self,
        target: &BtcAddress,
        amount_sats: u64,
        fee_per_kb: u64,
    ) -> Result<BtcTransferPayload, BtcError> {
        if amount_sats < DUST_LIMIT_SATS {
            return Err(BtcError::OutputBelowDust);
        }
        let inner = self.inner.lock().unwrap();
        let snapshot = self.snapshot_locked(&inner);
        let utxos = self.unspent(&snapshot);

        let mut selected: Vec<(OutPoint, TxOut, KeyPath)> = Vec::new();
        let mut total = 0u64;
        let mut fee = 0u64;
        let mut funded = false;
        for utxo in utxos {
            total += utxo.1.value.to_sat();
            selected.push(utxo);
            fee = Self::estimated_fee(fee_per_kb, selected.len() as u64, 2);
            if total >= amount_sats.saturating_add(fee) {
                funded = true;
                break;
            }
        }
        if !funded {
            return Err(BtcError::InsufficientFunds);
        }

        let mut output = vec![TxOut {
            value: BtcAmount::from_sat(amount_sats),
            script_pubkey: target.script_pubkey(),
        }];
        let change = total - amount_sats - fee;
        if change >= DUST_LIMIT_SATS {
            output.push(TxOut {
                value: BtcAmount::from_sat(change),
                script_pubkey: self.change_address(&snapshot)?.script_pubkey(),
            });
        } else {
            // Change folds into the fee.
            fee += change;
        }

        let input = selected
            .iter()
            .map(|(outpoint, _, _)| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();

        Ok(BtcTransferPayload {
            tx: Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input,
                output,
            },
            fee_sats: Some(fee),
        })
    }

    /// Signs every input of `tx` with keys re-derived from `seed`.
    pub fn sign_transaction(&self, tx: &mut Transaction, seed: &Seed) -> Result<Txid, BtcError> {
        let snapshot = self.snapshot();
        let secp = Secp256k1::new();
        let account =
            account_signing_key(seed.as_bytes(), self.network).map_err(|_| BtcError::Derivation)?;

        let mut plans = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let (prev_out, path) = snapshot
                .owned
                .get(&input.previous_output)
                .ok_or(BtcError::MissingPrevout)?;
            plans.push((prev_out.clone(), *path));
        }

        let cache_tx = tx.clone();
        let mut cache = SighashCache::new(&cache_tx);
        for (index, (prev_out, path)) in plans.into_iter().enumerate() {
            let child = account
                .derive_priv(
                    &secp,
                    &[
                        ChildNumber::from_normal_idx(path.chain).map_err(|_| BtcError::Derivation)?,
                        ChildNumber::from_normal_idx(path.index).map_err(|_| BtcError::Derivation)?,
                    ],
                )
                .map_err(|_| BtcError::Derivation)?;
            let secret = child.private_key;
            let pubkey = secret.public_key(&secp);

            if prev_out.script_pubkey.is_p2wpkh() {
                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &prev_out.script_pubkey,
                        prev_out.value,
                        EcdsaSighashType::All,
                    )
                    .map_err(|_| BtcError::Signing)?;
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: secp.sign_ecdsa(&message, &secret),
                    sighash_type: EcdsaSighashType::All,
                };
                tx.input[index].script_sig = ScriptBuf::new();
                tx.input[index].witness = Witness::p2wpkh(&signature, &pubkey);
            } else {
                let sighash = cache
                    .legacy_signature_hash(
                        index,
                        &prev_out.script_pubkey,
                        EcdsaSighashType::All.to_u32(),
                    )
                    .map_err(|_| BtcError::Signing)?;
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: secp.sign_ecdsa(&message, &secret),
                    sighash_type: EcdsaSighashType::All,
                };
                let sig_push =
                    PushBytesBuf::try_from(signature.to_vec()).map_err(|_| BtcError::Signing)?;
                let key_push = PushBytesBuf::try_from(pubkey.serialize().to_vec())
                    .map_err(|_| BtcError::Signing)?;
                tx.input[index].script_sig = bitcoin::script::Builder::new()
                    .push_slice(sig_push)
                    .push_slice(key_push)
                    .into_script();
                tx.input[index].witness = Witness::new();
            }
        }
        Ok(tx.compute_txid())
    }

    /// Splits a registered transaction into transfer parts: direction,
    /// principal, source and target addresses.
    pub fn transfer_parts(&self, tx: &Transaction) -> BtcTransferParts {
        let inner = self.inner.lock().unwrap();
        let snapshot = self.snapshot_locked(&inner);

        let input_owned = |input: &TxIn| -> bool {
            if snapshot.owned.contains_key(&input.previous_output) {
                return true;
            }
            input_address(input, self.network)
                .map(|address| snapshot.scripts.contains_key(&address.script_pubkey()))
                .unwrap_or(false)
        };

        let sent = tx.input.iter().any(input_owned);
        let owned_out: u64 = tx
            .output
            .iter()
            .filter(|o| snapshot.scripts.contains_key(&o.script_pubkey))
            .map(|o| o.value.to_sat())
            .sum();
        let foreign_out: u64 = tx
            .output
            .iter()
            .filter(|o| !snapshot.scripts.contains_key(&o.script_pubkey))
            .map(|o| o.value.to_sat())
            .sum();
        let received = owned_out > 0;

        let source = tx
            .input
            .first()
            .and_then(|input| input_address(input, self.network));
        let target = if sent {
            tx.output
                .iter()
                .find(|o| !snapshot.scripts.contains_key(&o.script_pubkey))
                .and_then(|o| BtcAddress::from_script(&o.script_pubkey, self.network).ok())
        } else {
            tx.output
                .iter()
                .find(|o| snapshot.scripts.contains_key(&o.script_pubkey))
                .and_then(|o| BtcAddress::from_script(&o.script_pubkey, self.network).ok())
        };

        // Fee requires every spent output.
        let fee_sats = tx
            .input
            .iter()
            .map(|input| {
                inner
                    .txs
                    .get(&input.previous_output.txid)
                    .and_then(|record| {
                        record
                            .tx
                            .output
                            .get(input.previous_output.vout as usize)
                            .map(|o| o.value.to_sat())
                    })
            })
            .sum::<Option<u64>>()
            .and_then(|in_total| {
                in_total.checked_sub(tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>())
            });

        let amount_sats = if sent { foreign_out } else { owned_out };

        BtcTransferParts {
            source,
            target,
            amount_sats,
            fee_sats,
            sent,
            received,
        }
    }

    /// The maximum sendable amount at `fee_per_kb` (spending every UTXO into
    /// one output), or the dust minimum. The flag reports a balance that
    /// cannot cover its own fee.
    pub fn estimate_limit(&self, as_maximum: bool, fee_per_kb: u64) -> (u64, bool) {
        if !as_maximum {
            return (DUST_LIMIT_SATS, false);
        }
        let snapshot = self.snapshot();
        let utxos = self.unspent(&snapshot);
        let total: u64 = utxos.iter().map(|(_, o, _)| o.value.to_sat()).sum();
        let fee = Self::estimated_fee(fee_per_kb, utxos.len() as u64, 1);
        if total <= fee {
            (0, true)
        } else {
            (total - fee, false)
        }
    }
}

impl std::fmt::Debug for BtcWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtcWallet")
            .field("network", &self.network)
            .field("is_bitcoin", &self.is_bitcoin)
            .finish()
    }
}

/// Recovers the spending address of an input: p2pkh from its pushed public
/// key, nested p2wpkh from its redeem script, native p2wpkh from its witness.
pub fn input_address(input: &TxIn, network: Network) -> Option<BtcAddress> {
    let pushes: Vec<Vec<u8>> = input
        .script_sig
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect();

    match pushes.as_slice() {
        // p2pkh: [signature, pubkey]
        [_, pubkey] if pubkey.len() == 33 || pubkey.len() == 65 => {
            let key = bitcoin::PublicKey::from_slice(pubkey).ok()?;
            Some(BtcAddress::p2pkh(key.pubkey_hash(), network))
        }
        // p2sh-wrapped segwit: [redeem script]
        [redeem] if !redeem.is_empty() => {
            let script = ScriptBuf::from_bytes(redeem.clone());
            BtcAddress::p2sh(&script, network).ok()
        }
        // native segwit: empty script_sig, pubkey in the witness
        [] => {
            let witness = &input.witness;
            if witness.len() == 2 {
                let key = CompressedPublicKey::from_slice(witness.nth(1)?).ok()?;
                Some(BtcAddress::p2wpkh(&key, network))
            } else {
                None
            }
        }
        _ => None,
    }
}
