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

//! Block-chain sync for one Ethereum address.
//!
//! [Bcs] keeps a truthful view of the chain with every transaction and log
//! affecting the managed address: peer announcements extend (or reorganize)
//! the chain, the N-ary [sync] locates historic blocks of interest, and the
//! [provision] protocol completes each block's data. Transaction status is
//! reconciled across peers with a two-of-a-kind rule, so a single broken or
//! malicious peer cannot thrash visible state.

pub mod block;
pub mod chain;
pub mod provision;
pub mod sync;

use crate::block::{
    AccountState, BcsLog, BcsTransaction, Block, BlockHeader, DataState, LogKey, TransactionStatus,
};
use crate::chain::{ChainState, Extension};
use crate::provision::{
    PeerId, Provision, ProvisionError, ProvisionPayload, ProvisionRequest, ProvisionResult,
    ProvisionIssuer,
};
use crate::sync::{Sync, SyncEffect};
use alloy_primitives::Address as EthAddress;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use walletkit_primitives::{BlockHash, TxHash};

/// Period of the pending-status dispatcher.
pub const BCS_TRANSACTION_CHECK_STATUS_SECONDS: u64 = 7;
/// Chain blocks reclaimed to storage once this many accumulate.
pub const BCS_SAVE_BLOCKS_COUNT: u64 = 500;
/// Deepest reorg honored from an announcement.
pub const BCS_REORG_LIMIT: u64 = 10;

/// Sync lifecycle, as reported to the listener.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    Started,
    Continues { percent: f32 },
    Stopped { error: Option<String> },
}

/// Persistence operation tags for the transaction/log save callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    Add,
    Rem,
    Upd,
}

/// The sink for everything BCS discovers or wants persisted.
pub trait BcsListener: Send + core::marker::Sync {
    fn chain_extended(&self, head_hash: BlockHash, head_number: u64, head_timestamp: u64);
    fn account_updated(&self, state: AccountState, block_number: u64);
    fn transaction_updated(&self, transaction: BcsTransaction);
    fn log_updated(&self, log: BcsLog);
    fn sync_event(&self, event: SyncEvent);
    fn save_blocks(&self, headers: Vec<BlockHeader>);
    fn save_peers(&self, peers: Vec<PeerId>);
    fn update_transaction(&self, op: ChangeOp, transaction: BcsTransaction);
    fn update_log(&self, op: ChangeOp, log: BcsLog);
}

/// Why a provision was issued; routes its result.
#[derive(Clone, Debug)]
enum Purpose {
    AnnouncedHeaders,
    SyncHeaders { node: usize },
    SyncAccounts { node: usize },
    Bodies,
    Receipts,
    Proofs,
    Statuses,
    Submit { hash: TxHash },
}

/// State re-supplied by the embedder at startup.
#[derive(Debug, Default)]
pub struct InitialState {
    pub headers: Vec<BlockHeader>,
    pub transactions: Vec<BcsTransaction>,
    pub logs: Vec<BcsLog>,
    pub peers: Vec<PeerId>,
}

/// The sync core. Single-threaded: the owner feeds announcements, provision
/// results, and periodic ticks from its event loop.
pub struct Bcs {
    address: EthAddress,
    listener: Arc<dyn BcsListener>,
    issuer: Arc<dyn ProvisionIssuer>,
    chain: ChainState,
    transactions: HashMap<TxHash, BcsTransaction>,
    logs: HashMap<LogKey, BcsLog>,
    pending_transactions: HashSet<TxHash>,
    pending_logs: HashSet<LogKey>,
    account: Option<(u64, AccountState)>,
    sync: Option<Sync>,
    provisions: HashMap<u64, (Provision, Purpose)>,
    next_identifier: u64,
    chained_since_save: u64,
    stopped: bool,
}

impl Bcs {
    pub fn new(
        address: EthAddress,
        listener: Arc<dyn BcsListener>,
        issuer: Arc<dyn ProvisionIssuer>,
        initial: InitialState,
    ) -> Self {
        let mut bcs = Self {
            address,
            listener,
            issuer,
            chain: ChainState::new(),
            transactions: HashMap::new(),
            logs: HashMap::new(),
            pending_transactions: HashSet::new(),
            pending_logs: HashSet::new(),
            account: None,
            sync: None,
            provisions: HashMap::new(),
            next_identifier: 0,
            chained_since_save: 0,
            stopped: false,
        };
        // Startup re-supply; duplicates (by hash) collapse into the maps.
        for header in initial.headers {
            bcs.chain.extend(Block::new(header));
        }
        for transaction in initial.transactions {
            bcs.transactions.insert(transaction.hash, transaction);
        }
        for log in initial.logs {
            bcs.logs.insert(log.key(), log);
        }
        if !initial.peers.is_empty() {
            bcs.listener.save_peers(initial.peers);
        }
        bcs
    }

    pub fn address(&self) -> EthAddress {
        self.address
    }

    pub fn is_sync_active(&self) -> bool {
        self.sync.as_ref().is_some_and(Sync::is_active)
    }

    pub fn chain_head_number(&self) -> Option<u64> {
        self.chain.head().map(|block| block.header.number)
    }

    pub fn is_pending(&self, hash: &TxHash) -> bool {
        self.pending_transactions.contains(hash)
    }

    pub fn transaction(&self, hash: &TxHash) -> Option<&BcsTransaction> {
        self.transactions.get(hash)
    }

    /// Stops all work; provisions that arrive later are dropped silently.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.provisions.clear();
        if self.sync.take().is_some() {
            self.listener.sync_event(SyncEvent::Stopped { error: None });
        }
    }

    fn issue(&mut self, peer: Option<PeerId>, request: ProvisionRequest, purpose: Purpose) {
        let identifier = self.next_identifier;
        self.next_identifier += 1;
        let provision = Provision {
            identifier,
            peer,
            request,
        };
        self.provisions
            .insert(identifier, (provision.clone(), purpose));
        self.issuer.issue(provision);
    }

    /// Entry for a peer's head announcement.
    pub fn handle_announce(
        &mut self,
        peer: PeerId,
        _head_hash: BlockHash,
        head_number: u64,
        _total_difficulty: alloy_primitives::U256,
        reorg_depth: u64,
    ) {
        if self.stopped {
            return;
        }
        let reorg_depth = reorg_depth.min(BCS_REORG_LIMIT);

        // A reorg unwinds the chain before the replacement headers arrive,
        // but never while a sync is rebuilding it.
        if reorg_depth > 0 && !self.is_sync_active() {
            let orphaned = self.chain.unwind(reorg_depth);
            if !orphaned.is_empty() {
                info!("announce unwound {} blocks (reorg)", orphaned.len());
                self.pend_orphaned();
            }
        }

        let start = head_number.saturating_sub(reorg_depth);
        self.issue(
            Some(peer),
            ProvisionRequest::Headers {
                start,
                skip: 0,
                count: head_number - start + 1,
            },
            Purpose::AnnouncedHeaders,
        );
    }

    /// Begins a sync over `[tail, head]`; a no-op while one is active.
    pub fn sync_range(&mut self, tail: u64, head: u64) {
        if self.stopped || self.is_sync_active() || head <= tail {
            return;
        }
        info!("sync [{tail}, {head}] started");
        self.listener.sync_event(SyncEvent::Started);
        let (sync, effects) = Sync::new(self.address, tail, head);
        self.sync = Some(sync);
        self.run_sync_effects(effects);
    }

    /// Submits a signed transaction and tracks its status.
    pub fn submit_transaction(&mut self, transaction: BcsTransaction, raw: Vec<u8>) {
        if self.stopped {
            return;
        }
        let hash = transaction.hash;
        self.transactions.insert(hash, transaction.clone());
        self.listener.update_transaction(ChangeOp::Add, transaction);
        self.issue(
            None,
            ProvisionRequest::Submit { raw, hash },
            Purpose::Submit { hash },
        );
    }

    /// The 7-second tick: asks every peer for the status of every pending
    /// hash, deduplicated (pending logs contribute their owning transaction).
    pub fn periodic_dispatch(&mut self) {
        if self.stopped {
            return;
        }
        let mut hashes: HashSet<TxHash> = self.pending_transactions.iter().copied().collect();
        hashes.extend(self.pending_logs.iter().map(|key| key.transaction_hash));
        if hashes.is_empty() {
            return;
        }
        let hashes: Vec<TxHash> = hashes.into_iter().collect();
        for peer in self.issuer.peers() {
            self.issue(
                Some(peer),
                ProvisionRequest::Statuses {
                    hashes: hashes.clone(),
                },
                Purpose::Statuses,
            );
        }
    }

    /// Entry for every completed provision.
    pub fn handle_provision(&mut self, result: ProvisionResult) {
        if self.stopped {
            return;
        }
        let Some((provision, purpose)) = self.provisions.remove(&result.identifier) else {
            debug!("provision {} unknown or cancelled", result.identifier);
            return;
        };

        let payload = match result.result {
            Ok(payload) => payload,
            // An inactive node is not an error: re-issue to any peer,
            // transparently to the rest of the logic.
            Err(ProvisionError::NodeInactive) => {
                debug!("provision {} re-issued, node inactive", provision.identifier);
                self.issue(None, provision.request, purpose);
                return;
            }
            Err(error) => {
                warn!("provision {} failed: {error}", provision.identifier);
                match purpose {
                    Purpose::SyncHeaders { node } | Purpose::SyncAccounts { node } => {
                        if let Some(mut sync) = self.sync.take() {
                            let effects = sync.handle_failure(node);
                            self.sync = Some(sync);
                            self.run_sync_effects(effects);
                        }
                    }
                    Purpose::Submit { hash } => {
                        self.apply_submit_result(hash, Some(error.to_string()));
                    }
                    _ => {}
                }
                return;
            }
        };

        match (purpose, payload) {
            (Purpose::AnnouncedHeaders, ProvisionPayload::Headers(headers)) => {
                for header in headers {
                    self.handle_header(header, false);
                }
            }
            (Purpose::SyncHeaders { node }, ProvisionPayload::Headers(headers)) => {
                if let Some(mut sync) = self.sync.take() {
                    let effects = sync.handle_headers(node, headers);
                    self.sync = Some(sync);
                    self.run_sync_effects(effects);
                }
            }
            (Purpose::SyncAccounts { node }, ProvisionPayload::Accounts(accounts)) => {
                // Remember the newest account snapshot seen.
                if let Some((_, number, state)) =
                    accounts.iter().max_by_key(|(_, number, _)| *number)
                {
                    self.update_account(*number, state.clone());
                }
                if let Some(mut sync) = self.sync.take() {
                    let effects = sync.handle_accounts(node, accounts);
                    self.sync = Some(sync);
                    self.run_sync_effects(effects);
                }
            }
            (Purpose::Bodies, ProvisionPayload::Bodies(bodies)) => {
                for (hash, transactions) in bodies {
                    self.complete_block_data(hash, |block| {
                        block.transactions = DataState::Complete(transactions);
                    });
                }
            }
            (Purpose::Receipts, ProvisionPayload::Receipts(receipts)) => {
                for (hash, logs) in receipts {
                    self.complete_block_data(hash, |block| {
                        block.logs = DataState::Complete(logs);
                    });
                }
            }
            (Purpose::Proofs, ProvisionPayload::Proofs(proofs)) => {
                for (number, difficulty) in proofs {
                    if difficulty.is_none() {
                        warn!("header proof failed for block {number}");
                    }
                }
            }
            (Purpose::Statuses, ProvisionPayload::Statuses(statuses)) => {
                for (hash, status) in statuses {
                    self.handle_transaction_status(result.peer, hash, status);
                }
            }
            (Purpose::Submit { hash }, ProvisionPayload::Submit { error, .. }) => {
                self.apply_submit_result(hash, error);
            }
            (purpose, payload) => {
                warn!("provision payload mismatch: {purpose:?} vs {payload:?}");
            }
        }
    }

    fn run_sync_effects(&mut self, effects: Vec<SyncEffect>) {
        for effect in effects {
            match effect {
                SyncEffect::Issue { node, request } => {
                    let purpose = match &request {
                        ProvisionRequest::Headers { .. } => Purpose::SyncHeaders { node },
                        ProvisionRequest::Accounts { .. } => Purpose::SyncAccounts { node },
                        other => {
                            warn!("sync issued unexpected request {other:?}");
                            continue;
                        }
                    };
                    self.issue(None, request, purpose);
                }
                SyncEffect::Chain { headers } => {
                    for header in headers {
                        self.handle_header(header, true);
                    }
                }
                SyncEffect::Progress { percent } => {
                    self.listener.sync_event(SyncEvent::Continues { percent });
                }
                SyncEffect::Done => {
                    info!("sync complete");
                    self.sync = None;
                    self.listener.sync_event(SyncEvent::Stopped { error: None });
                }
                SyncEffect::Failed => {
                    self.sync = None;
                    self.listener.sync_event(SyncEvent::Stopped {
                        error: Some("sync interrupted".to_string()),
                    });
                }
            }
        }
    }

    /// Decides the needed data for a fresh header, offers the block to the
    /// chain, and reacts to the outcome.
    fn handle_header(&mut self, header: BlockHeader, from_sync: bool) {
        if self.chain.get(&header.hash).is_some() {
            return;
        }
        let number = header.number;
        let timestamp = header.timestamp;
        let hash = header.hash;
        let interesting = header.may_contain_address(&self.address);

        let mut block = Block::new(header.clone());
        if interesting {
            block.transactions = DataState::Needed;
            block.logs = DataState::Needed;
        }

        // A sync delivering blocks above a disjoint chain restarts the view
        // from there instead of orphaning every header.
        let adopt = from_sync
            && self.chain.head().is_some()
            && self.chain.get(&header.parent_hash).is_none()
            && self
                .chain
                .head()
                .map(|head| number > head.header.number)
                .unwrap_or(false);

        let extension = if adopt {
            let reclaimed = self.chain.adopt(block);
            if !reclaimed.is_empty() {
                self.listener
                    .save_blocks(reclaimed.into_iter().map(|b| b.header).collect());
            }
            Extension::Extended
        } else {
            self.chain.extend(block)
        };

        match extension {
            Extension::Extended | Extension::Reorganized { .. } => {
                if matches!(extension, Extension::Reorganized { .. }) {
                    self.pend_orphaned();
                }
                self.listener.chain_extended(hash, number, timestamp);
                self.chained_since_save += 1;
            }
            Extension::Orphaned { sync_back_to } => {
                // A gap is developing; sync back to recover it.
                if !from_sync && sync_back_to != u64::MAX {
                    if let Some(head) = self.chain_head_number() {
                        if sync_back_to > head {
                            self.sync_range(head, sync_back_to);
                        }
                    }
                }
            }
            Extension::Duplicate => return,
        }

        if interesting {
            self.issue(
                None,
                ProvisionRequest::Bodies { hashes: vec![hash] },
                Purpose::Bodies,
            );
            self.issue(
                None,
                ProvisionRequest::Receipts { hashes: vec![hash] },
                Purpose::Receipts,
            );
        } else {
            // Complete and chained with nothing needed: nothing to extract.
            self.extract_if_ready(hash);
        }

        self.reclaim_and_save();
    }

    /// Applies `fill` to the block and extracts its objects when it has
    /// become both complete and chained.
    fn complete_block_data(&mut self, hash: BlockHash, fill: impl FnOnce(&mut Block)) {
        match self.chain.get_mut(&hash) {
            Some(block) => fill(block),
            None => return,
        }
        self.extract_if_ready(hash);
    }

    /// Block processing produces transactions and logs only once the block is
    /// complete *and* chained.
    fn extract_if_ready(&mut self, hash: BlockHash) {
        let ready = self
            .chain
            .get(&hash)
            .map(|block| block.is_complete() && self.chain.is_chained(&hash))
            .unwrap_or(false);
        if !ready {
            return;
        }

        let (header, transactions, logs) = {
            let block = self.chain.get_mut(&hash).expect("block present");
            let transactions = match std::mem::replace(&mut block.transactions, DataState::Irrelevant)
            {
                DataState::Complete(transactions) => transactions,
                other => {
                    block.transactions = other;
                    Vec::new()
                }
            };
            let logs = match std::mem::replace(&mut block.logs, DataState::Irrelevant) {
                DataState::Complete(logs) => logs,
                other => {
                    block.logs = other;
                    Vec::new()
                }
            };
            (block.header.clone(), transactions, logs)
        };

        for mut transaction in transactions {
            transaction.status = TransactionStatus::Included {
                block_hash: header.hash,
                block_number: header.number,
                transaction_index: 0,
                block_timestamp: header.timestamp,
            };
            self.adopt_transaction(transaction);
        }
        for mut log in logs {
            log.status = TransactionStatus::Included {
                block_hash: header.hash,
                block_number: header.number,
                transaction_index: log.transaction_index,
                block_timestamp: header.timestamp,
            };
            self.adopt_log(log);
        }
    }

    fn adopt_transaction(&mut self, transaction: BcsTransaction) {
        let hash = transaction.hash;
        let known = self.transactions.contains_key(&hash);
        self.transactions.insert(hash, transaction.clone());
        // Definitive inclusion: the chain said so; stop status queries.
        self.pending_transactions.remove(&hash);
        self.listener.update_transaction(
            if known { ChangeOp::Upd } else { ChangeOp::Add },
            transaction.clone(),
        );
        self.listener.transaction_updated(transaction);
    }

    fn adopt_log(&mut self, log: BcsLog) {
        let key = log.key();
        let known = self.logs.contains_key(&key);
        self.logs.insert(key, log.clone());
        self.pending_logs.remove(&key);
        self.listener
            .update_log(if known { ChangeOp::Upd } else { ChangeOp::Add }, log.clone());
        self.listener.log_updated(log);
    }

    /// Demotes to pending every included transaction and log whose block has
    /// become an orphan; their status will be re-queried.
    fn pend_orphaned(&mut self) {
        let mut demoted_txs = Vec::new();
        for (hash, transaction) in &self.transactions {
            if let TransactionStatus::Included { block_hash, .. } = &transaction.status {
                if self.chain.is_orphan(block_hash) {
                    demoted_txs.push(*hash);
                }
            }
        }
        for hash in demoted_txs {
            if let Some(transaction) = self.transactions.get_mut(&hash) {
                transaction.status = TransactionStatus::Pending;
                self.pending_transactions.insert(hash);
                let snapshot = transaction.clone();
                self.listener.update_transaction(ChangeOp::Upd, snapshot.clone());
                self.listener.transaction_updated(snapshot);
            }
        }

        let mut demoted_logs = Vec::new();
        for (key, log) in &self.logs {
            if let TransactionStatus::Included { block_hash, .. } = &log.status {
                if self.chain.is_orphan(block_hash) {
                    demoted_logs.push(*key);
                }
            }
        }
        for key in demoted_logs {
            if let Some(log) = self.logs.get_mut(&key) {
                log.status = TransactionStatus::Pending;
                self.pending_logs.insert(key);
                let snapshot = log.clone();
                self.listener.update_log(ChangeOp::Upd, snapshot.clone());
                self.listener.log_updated(snapshot);
            }
        }
    }

    /// The two-of-a-kind reconciliation for one peer-reported status.
    pub fn handle_transaction_status(
        &mut self,
        _peer: PeerId,
        hash: TxHash,
        status: TransactionStatus,
    ) {
        if self.stopped {
            return;
        }
        let Some(transaction) = self.transactions.get_mut(&hash) else {
            return;
        };
        let old = transaction.status.clone();

        let needs_update = match &status {
            // A peer with nothing to offer is ignored entirely.
            TransactionStatus::Unknown => {
                debug!("status for {hash}: unknown, ignored");
                return;
            }
            TransactionStatus::Queued => matches!(old, TransactionStatus::Unknown),
            TransactionStatus::Pending => matches!(
                old,
                TransactionStatus::Unknown | TransactionStatus::Queued
            ),
            // Advisory only: two consecutive reports stop the queries, but
            // inclusion becomes definitive solely through a chained header.
            TransactionStatus::Included { .. } => {
                if old.same_kind(&status) {
                    self.pending_transactions.remove(&hash);
                    false
                } else {
                    true
                }
            }
            TransactionStatus::Errored(_) => {
                if old.same_kind(&status) {
                    self.pending_transactions.remove(&hash);
                    false
                } else {
                    true
                }
            }
        };

        if needs_update {
            transaction.status = status.clone();
            let snapshot = transaction.clone();
            debug!(
                "status for {hash}: {:?}, pending: {}",
                snapshot.status,
                self.pending_transactions.contains(&hash)
            );
            self.listener.transaction_updated(snapshot);

            // Logs riding on this transaction follow its status.
            let keys: Vec<LogKey> = self
                .logs
                .keys()
                .filter(|key| key.transaction_hash == hash)
                .copied()
                .collect();
            for key in keys {
                if let Some(log) = self.logs.get_mut(&key) {
                    log.status = status.clone();
                    let snapshot = log.clone();
                    self.listener.log_updated(snapshot);
                }
            }
        }
    }

    fn apply_submit_result(&mut self, hash: TxHash, error: Option<String>) {
        let Some(transaction) = self.transactions.get_mut(&hash) else {
            return;
        };
        match error {
            Some(message) => {
                transaction.status = TransactionStatus::Errored(message);
                self.pending_transactions.remove(&hash);
            }
            None => {
                transaction.status = TransactionStatus::Pending;
                self.pending_transactions.insert(hash);
            }
        }
        let snapshot = transaction.clone();
        self.listener.update_transaction(ChangeOp::Upd, snapshot.clone());
        self.listener.transaction_updated(snapshot);
    }

    fn update_account(&mut self, block_number: u64, state: AccountState) {
        let newer = self
            .account
            .as_ref()
            .map(|(number, _)| block_number >= *number)
            .unwrap_or(true);
        if newer {
            self.account = Some((block_number, state.clone()));
            self.listener.account_updated(state, block_number);
        }
    }

    fn reclaim_and_save(&mut self) {
        if self.chained_since_save < BCS_SAVE_BLOCKS_COUNT {
            return;
        }
        self.chained_since_save = 0;
        let reclaimed = self.chain.reclaim_tail(BCS_SAVE_BLOCKS_COUNT);
        if !reclaimed.is_empty() {
            info!("reclaiming {} blocks", reclaimed.len());
            self.listener
                .save_blocks(reclaimed.into_iter().map(|block| block.header).collect());
        }
    }

    /// The chain invariants, for tests: the tail reachable from the head,
    /// orphans off-path, and nothing Included in an orphaned block.
    pub fn check_invariants(&self) -> bool {
        if !self.chain.check_invariant() {
            return false;
        }
        self.transactions.values().all(|transaction| {
            match &transaction.status {
                TransactionStatus::Included { block_hash, .. } => !self.chain.is_orphan(block_hash),
                _ => true,
            }
        })
    }

    /// Test and diagnostics access to the chain view.
    pub fn chain(&self) -> &ChainState {
        &self.chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bloom, U256};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        transactions: Mutex<Vec<BcsTransaction>>,
    }

    impl BcsListener for Recorder {
        fn chain_extended(&self, _hash: BlockHash, number: u64, _timestamp: u64) {
            self.events.lock().unwrap().push(format!("chain:{number}"));
        }
        fn account_updated(&self, _state: AccountState, number: u64) {
            self.events.lock().unwrap().push(format!("account:{number}"));
        }
        fn transaction_updated(&self, transaction: BcsTransaction) {
            self.events
                .lock()
                .unwrap()
                .push(format!("tx:{:?}", transaction.status));
            self.transactions.lock().unwrap().push(transaction);
        }
        fn log_updated(&self, _log: BcsLog) {}
        fn sync_event(&self, event: SyncEvent) {
            self.events.lock().unwrap().push(format!("sync:{event:?}"));
        }
        fn save_blocks(&self, _headers: Vec<BlockHeader>) {}
        fn save_peers(&self, _peers: Vec<PeerId>) {}
        fn update_transaction(&self, _op: ChangeOp, _transaction: BcsTransaction) {}
        fn update_log(&self, _op: ChangeOp, _log: BcsLog) {}
    }

    #[derive(Default)]
    struct CapturingIssuer {
        provisions: Mutex<Vec<Provision>>,
        peer_list: Vec<PeerId>,
    }

    impl ProvisionIssuer for CapturingIssuer {
        fn issue(&self, provision: Provision) {
            self.provisions.lock().unwrap().push(provision);
        }
        fn peers(&self) -> Vec<PeerId> {
            self.peer_list.clone()
        }
    }

    fn header(number: u64, salt: u8, parent: BlockHash) -> BlockHeader {
        let mut hash = [salt; 32];
        hash[24..].copy_from_slice(&number.to_be_bytes());
        BlockHeader {
            hash: BlockHash::from(hash),
            parent_hash: parent,
            number,
            timestamp: number * 15,
            total_difficulty: U256::from(number),
            logs_bloom: Bloom::ZERO,
        }
    }

    fn transaction(byte: u8, status: TransactionStatus) -> BcsTransaction {
        BcsTransaction {
            hash: TxHash::with_last_byte(byte),
            source: EthAddress::ZERO,
            target: None,
            amount: U256::from(1),
            gas_used: None,
            status,
        }
    }

    fn bcs_with(
        initial: InitialState,
    ) -> (Bcs, Arc<Recorder>, Arc<CapturingIssuer>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let recorder = Arc::new(Recorder::default());
        let issuer = Arc::new(CapturingIssuer {
            provisions: Mutex::new(Vec::new()),
            peer_list: vec![1, 2],
        });
        let bcs = Bcs::new(EthAddress::ZERO, recorder.clone(), issuer.clone(), initial);
        (bcs, recorder, issuer)
    }

    fn extend_headers(bcs: &mut Bcs, from: u64, to: u64, parent: BlockHash) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut parent = parent;
        for number in from..=to {
            let h = header(number, 0, parent);
            parent = h.hash;
            bcs.handle_header(h.clone(), false);
            headers.push(h);
        }
        headers
    }

    #[test]
    fn announce_requests_reorg_window() {
        let (mut bcs, _recorder, issuer) = bcs_with(InitialState::default());
        extend_headers(&mut bcs, 1, 5, BlockHash::ZERO);
        bcs.handle_announce(1, BlockHash::with_last_byte(9), 100, U256::from(100), 3);
        let provisions = issuer.provisions.lock().unwrap();
        let last = provisions.last().unwrap();
        assert_eq!(last.peer, Some(1));
        assert_eq!(
            last.request,
            ProvisionRequest::Headers {
                start: 97,
                skip: 0,
                count: 4
            }
        );
    }

    #[test]
    fn chain_invariant_survives_mixed_inputs() {
        let (mut bcs, _recorder, _issuer) = bcs_with(InitialState::default());
        let headers = extend_headers(&mut bcs, 1, 8, BlockHash::ZERO);
        // A stray orphan, a reorg announcement, a rival block.
        bcs.handle_header(header(20, 9, BlockHash::with_last_byte(0xAA)), false);
        bcs.handle_announce(1, headers[7].hash, 8, U256::from(8), 2);
        bcs.handle_header(header(7, 5, headers[5].hash), false);
        assert!(bcs.check_invariants());
    }

    #[test]
    fn two_of_a_kind_unpends() {
        let (mut bcs, _recorder, _issuer) = bcs_with(InitialState {
            transactions: vec![transaction(1, TransactionStatus::Pending)],
            ..Default::default()
        });
        let hash = TxHash::with_last_byte(1);
        bcs.pending_transactions.insert(hash);

        let included = TransactionStatus::Included {
            block_hash: BlockHash::with_last_byte(7),
            block_number: 10,
            transaction_index: 0,
            block_timestamp: 0,
        };

        // Alternating INCLUDED / UNKNOWN never un-pends.
        for _ in 0..4 {
            bcs.handle_transaction_status(1, hash, included.clone());
            bcs.handle_transaction_status(2, hash, TransactionStatus::Unknown);
            // Unknown is ignored outright, so the old status stays INCLUDED;
            // reset to Pending to model a fresh alternation.
            bcs.transactions.get_mut(&hash).unwrap().status = TransactionStatus::Pending;
            assert!(bcs.is_pending(&hash));
        }

        // Two consecutive INCLUDED reports do un-pend.
        bcs.handle_transaction_status(1, hash, included.clone());
        assert!(bcs.is_pending(&hash));
        bcs.handle_transaction_status(2, hash, included);
        assert!(!bcs.is_pending(&hash));
    }

    #[test]
    fn unknown_is_always_ignored() {
        let (mut bcs, recorder, _issuer) = bcs_with(InitialState {
            transactions: vec![transaction(1, TransactionStatus::Pending)],
            ..Default::default()
        });
        let hash = TxHash::with_last_byte(1);
        bcs.pending_transactions.insert(hash);
        let before = recorder.events.lock().unwrap().len();
        bcs.handle_transaction_status(1, hash, TransactionStatus::Unknown);
        assert_eq!(recorder.events.lock().unwrap().len(), before);
        assert!(bcs.is_pending(&hash));
    }

    #[test]
    fn two_errors_unpend() {
        let (mut bcs, _recorder, _issuer) = bcs_with(InitialState {
            transactions: vec![transaction(2, TransactionStatus::Pending)],
            ..Default::default()
        });
        let hash = TxHash::with_last_byte(2);
        bcs.pending_transactions.insert(hash);
        bcs.handle_transaction_status(1, hash, TransactionStatus::Errored("gas".into()));
        assert!(bcs.is_pending(&hash));
        bcs.handle_transaction_status(2, hash, TransactionStatus::Errored("gas".into()));
        assert!(!bcs.is_pending(&hash));
    }

    #[test]
    fn reorg_demotes_included_to_pending() {
        let (mut bcs, recorder, _issuer) = bcs_with(InitialState::default());
        let headers = extend_headers(&mut bcs, 1, 6, BlockHash::ZERO);

        // A transaction included in block 5.
        let hash = TxHash::with_last_byte(3);
        bcs.transactions.insert(
            hash,
            transaction(
                3,
                TransactionStatus::Included {
                    block_hash: headers[4].hash,
                    block_number: 5,
                    transaction_index: 0,
                    block_timestamp: 0,
                },
            ),
        );

        // Announce a reorg unwinding past block 5.
        bcs.handle_announce(1, headers[5].hash, 6, U256::from(6), 3);
        let status = bcs.transaction(&hash).unwrap().status.clone();
        assert_eq!(status, TransactionStatus::Pending);
        assert!(bcs.is_pending(&hash));
        assert!(recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|event| event.contains("tx:Pending")));
        assert!(bcs.check_invariants());
    }

    #[test]
    fn node_inactive_reissues_transparently() {
        let (mut bcs, _recorder, issuer) = bcs_with(InitialState::default());
        bcs.handle_announce(1, BlockHash::with_last_byte(1), 50, U256::from(1), 0);
        let first = issuer.provisions.lock().unwrap().last().unwrap().clone();
        bcs.handle_provision(ProvisionResult {
            identifier: first.identifier,
            peer: 1,
            result: Err(ProvisionError::NodeInactive),
        });
        let provisions = issuer.provisions.lock().unwrap();
        let reissued = provisions.last().unwrap();
        assert_ne!(reissued.identifier, first.identifier);
        assert_eq!(reissued.peer, None);
        assert_eq!(reissued.request, first.request);
    }

    #[test]
    fn periodic_dispatch_deduplicates_and_fans_out() {
        let (mut bcs, _recorder, issuer) = bcs_with(InitialState {
            transactions: vec![transaction(1, TransactionStatus::Pending)],
            logs: vec![BcsLog {
                transaction_hash: TxHash::with_last_byte(1),
                transaction_index: 0,
                address: EthAddress::ZERO,
                topics: vec![],
                data: vec![],
                status: TransactionStatus::Pending,
            }],
            ..Default::default()
        });
        bcs.pending_transactions.insert(TxHash::with_last_byte(1));
        bcs.pending_logs.insert(LogKey {
            transaction_hash: TxHash::with_last_byte(1),
            transaction_index: 0,
        });

        bcs.periodic_dispatch();
        let provisions = issuer.provisions.lock().unwrap();
        // One Statuses request per peer, each with the single deduplicated
        // hash (the log contributed its owning transaction).
        assert_eq!(provisions.len(), 2);
        for provision in provisions.iter() {
            match &provision.request {
                ProvisionRequest::Statuses { hashes } => assert_eq!(hashes.len(), 1),
                other => panic!("unexpected request {other:?}"),
            }
        }
    }

    #[test]
    fn submit_tracks_and_reports() {
        let (mut bcs, recorder, issuer) = bcs_with(InitialState::default());
        let tx = transaction(9, TransactionStatus::Unknown);
        bcs.submit_transaction(tx.clone(), vec![0xf8]);

        let submit = issuer.provisions.lock().unwrap().last().unwrap().clone();
        bcs.handle_provision(ProvisionResult {
            identifier: submit.identifier,
            peer: 1,
            result: Ok(ProvisionPayload::Submit {
                hash: tx.hash,
                error: None,
            }),
        });
        assert!(bcs.is_pending(&tx.hash));
        assert_eq!(
            bcs.transaction(&tx.hash).unwrap().status,
            TransactionStatus::Pending
        );
        assert!(!recorder.transactions.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_drops_late_provisions() {
        let (mut bcs, _recorder, issuer) = bcs_with(InitialState::default());
        bcs.handle_announce(1, BlockHash::with_last_byte(1), 50, U256::from(1), 0);
        let provision = issuer.provisions.lock().unwrap().last().unwrap().clone();
        bcs.stop();
        bcs.handle_provision(ProvisionResult {
            identifier: provision.identifier,
            peer: 1,
            result: Ok(ProvisionPayload::Headers(vec![])),
        });
        assert!(bcs.chain_head_number().is_none());
    }
}
