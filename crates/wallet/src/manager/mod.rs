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

//! The wallet manager: one blockchain, one account, one event loop.
//!
//! Every operation dispatches on the manager's chain family to the matching
//! sub-manager. All listener callbacks are delivered by the manager's event
//! thread in posting order, which makes the creation-order contract
//! (MANAGER_CREATED, WALLET_CREATED, MANAGER_WALLET_ADDED, then per-loaded-
//! transfer events) and the ADD-before-CHANGED transfer contract hold by
//! construction.

pub mod gen;

use crate::account::AccountRef;
use crate::address::Address;
use crate::amount::Amount;
use crate::chains::btc::BtcWallet;
use crate::chains::eth::{EthToken, EthWallet};
use crate::chains::gen::GenWallet;
use crate::client::{AnnouncedTransfer, CallbackState, Client};
use crate::currency::CurrencyRef;
use crate::events::{Listener, ManagerEvent, ManagerState, TransferEvent, WalletEvent};
use crate::feebasis::FeeBasis;
use crate::handlers;
use crate::network::{ChainFamily, NativeNetwork, NetworkRef};
use crate::storage::FileService;
use crate::transfer::{TransferPayload, TransferRef, TransferState};
use crate::wallet::{AddressScheme, Wallet, WalletError, WalletPayload, WalletRef};
use alloy_primitives::U256;
use bitcoin::hashes::Hash as _;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use walletkit_bcs::provision::{NullIssuer, ProvisionResult};
use walletkit_bcs::{Bcs, InitialState};
use walletkit_primitives::key::Key;
use walletkit_primitives::TxHash;

/// How the manager learns about the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Client callbacks for everything.
    ApiOnly,
    /// Client callbacks for sync; the native network for submission.
    ApiWithP2pSend,
    /// The native network, with the client filling history.
    P2pWithApiSync,
    /// The native network for everything.
    P2pOnly,
}

impl SyncMode {
    pub fn syncs_via_api(&self) -> bool {
        matches!(
            self,
            SyncMode::ApiOnly | SyncMode::ApiWithP2pSend | SyncMode::P2pWithApiSync
        )
    }

    pub fn sends_via_p2p(&self) -> bool {
        matches!(
            self,
            SyncMode::ApiWithP2pSend | SyncMode::P2pWithApiSync | SyncMode::P2pOnly
        )
    }
}

/// Error returned by manager operations.
#[derive(Debug, ThisError)]
pub enum ManagerError {
    #[error("invalid paper key")]
    InvalidPhrase,
    #[error("wallet does not belong to this manager")]
    UnknownWallet,
    #[error("transfer does not belong to this wallet")]
    UnknownTransfer,
    #[error("transfer already signed")]
    AlreadySigned,
    #[error("transfer already submitted")]
    AlreadySubmitted,
    #[error("mode unsupported for this chain")]
    UnsupportedMode,
    #[error("account is missing this network's chain")]
    MissingChainAccount,
    #[error("currency not listed on this network")]
    UnknownCurrency,
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// What a pending client request is waiting for.
#[derive(Debug)]
enum PendingRequest {
    BlockNumber,
    Transactions { wallet: WalletRef },
    Submit { wallet: WalletRef, transfer: TransferRef },
    Balance { wallet: WalletRef },
    Nonce,
    GasEstimate { wallet: WalletRef, cookie: u64 },
}

enum SystemEvent {
    Manager(ManagerEvent),
    Wallet(WalletRef, WalletEvent),
    Transfer(WalletRef, TransferRef, TransferEvent),
}

enum LoopMessage {
    Event(Box<SystemEvent>),
    Stop,
}

struct EventLoop {
    sender: Mutex<Option<mpsc::Sender<LoopMessage>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// The Ethereum sub-manager: the token registry and, in P2P modes, the
/// block-chain sync core.
pub struct EthManager {
    pub tokens: Mutex<Vec<EthToken>>,
    pub bcs: Mutex<Option<Bcs>>,
    last_bcs_tick: Mutex<Instant>,
}

/// The UTXO sub-manager wraps the shared sub-wallet.
pub struct UtxoManager {
    pub wallet: Arc<BtcWallet>,
}

/// The per-family sub-manager a manager dispatches into.
pub enum SubManager {
    Utxo(UtxoManager),
    Ethereum(EthManager),
    Generic(gen::GenManager),
}

/// Construction-time options.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub mode: SyncMode,
    pub scheme: AddressScheme,
    pub storage_path: PathBuf,
}

/// One account on one network, with its wallets and its event loop.
pub struct WalletManager {
    account: AccountRef,
    network: NetworkRef,
    client: Arc<dyn Client>,
    listener: Arc<dyn Listener>,
    storage: Arc<dyn FileService>,
    path: PathBuf,
    mode: Mutex<SyncMode>,
    scheme: Mutex<AddressScheme>,
    state: Mutex<ManagerState>,
    wallets: Mutex<Vec<WalletRef>>,
    primary: OnceLock<WalletRef>,
    sub: OnceLock<SubManager>,
    requests: Mutex<HashMap<u64, PendingRequest>>,
    next_rid: AtomicU64,
    events: EventLoop,
    weak_self: OnceLock<Weak<WalletManager>>,
}

pub type ManagerRef = Arc<WalletManager>;

impl WalletManager {
    pub fn create(
        listener: Arc<dyn Listener>,
        client: Arc<dyn Client>,
        account: AccountRef,
        network: NetworkRef,
        config: ManagerConfig,
        storage: Arc<dyn FileService>,
    ) -> Result<ManagerRef, ManagerError> {
        handlers::install_builtin();

        if network.family() == ChainFamily::Generic && config.mode != SyncMode::ApiOnly {
            return Err(ManagerError::UnsupportedMode);
        }

        let path = config.storage_path.join(account.identifier());
        let manager = Arc::new(Self {
            account: account.clone(),
            network: network.clone(),
            client,
            listener,
            storage,
            path,
            mode: Mutex::new(config.mode),
            scheme: Mutex::new(config.scheme),
            state: Mutex::new(ManagerState::Created),
            wallets: Mutex::new(Vec::new()),
            primary: OnceLock::new(),
            sub: OnceLock::new(),
            requests: Mutex::new(HashMap::new()),
            next_rid: AtomicU64::new(1),
            events: EventLoop {
                sender: Mutex::new(None),
                handle: Mutex::new(None),
            },
            weak_self: OnceLock::new(),
        });
        let _ = manager.weak_self.set(Arc::downgrade(&manager));

        manager.start_event_loop();
        manager.build_sub_manager()?;
        let primary = manager.build_primary_wallet()?;
        let _ = manager.primary.set(primary.clone());
        manager.wallets.lock().unwrap().push(primary.clone());

        // The creation-order contract.
        manager.post(SystemEvent::Manager(ManagerEvent::Created));
        manager.post(SystemEvent::Wallet(primary.clone(), WalletEvent::Created));
        manager.post(SystemEvent::Manager(ManagerEvent::WalletAdded(
            primary.clone(),
        )));

        // Persisted transfers replay behind the wallet-added event.
        if let SubManager::Generic(gen) = manager.sub() {
            gen.replay_persisted(&manager, &primary);
        }

        // Ethereum: install a token record for every issued currency; no
        // wallet until the embedder registers one.
        if let SubManager::Ethereum(eth) = manager.sub() {
            let mut tokens = eth.tokens.lock().unwrap();
            for entry in network.currencies() {
                if let Some(issuer) = entry.currency.issuer() {
                    if let Ok(contract) = issuer.parse() {
                        tokens.push(EthToken {
                            contract,
                            code: entry.currency.code().to_string(),
                            name: entry.currency.name().to_string(),
                            decimals: entry.default_unit.decimals(),
                            gas_limit: 92_000,
                            gas_price_wei: U256::from(25_000_000_000u64),
                        });
                    }
                }
            }
            info!("installed {} tokens", tokens.len());
        }

        Ok(manager)
    }

    fn sub(&self) -> &SubManager {
        self.sub.get().expect("sub-manager built at create")
    }

    pub(crate) fn sub_manager(&self) -> &SubManager {
        self.sub()
    }

    pub(crate) fn emit_transfer_created(&self, wallet: &WalletRef, transfer: &TransferRef) {
        self.post(SystemEvent::Transfer(
            wallet.clone(),
            transfer.clone(),
            TransferEvent::Created,
        ));
        self.post(SystemEvent::Wallet(
            wallet.clone(),
            WalletEvent::TransferAdded(transfer.clone()),
        ));
    }

    pub(crate) fn emit_transfer_changed(
        &self,
        wallet: &WalletRef,
        transfer: &TransferRef,
        old: TransferState,
        new: TransferState,
    ) {
        self.post(SystemEvent::Transfer(
            wallet.clone(),
            transfer.clone(),
            TransferEvent::Changed { old, new },
        ));
    }

    pub(crate) fn emit_balance_updated(&self, wallet: &WalletRef) {
        self.post(SystemEvent::Wallet(
            wallet.clone(),
            WalletEvent::BalanceUpdated(wallet.balance()),
        ));
    }

    fn build_sub_manager(&self) -> Result<(), ManagerError> {
        let sub = match self.network.native() {
            NativeNetwork::Bitcoin { chain, is_bitcoin } => SubManager::Utxo(UtxoManager {
                wallet: Arc::new(BtcWallet::new(*chain, *is_bitcoin, *self.account.btc())),
            }),
            NativeNetwork::Ethereum { .. } => SubManager::Ethereum(EthManager {
                tokens: Mutex::new(Vec::new()),
                bcs: Mutex::new(None),
                last_bcs_tick: Mutex::new(Instant::now()),
            }),
            NativeNetwork::Generic { code } => {
                let account = self
                    .account
                    .gen(code)
                    .ok_or(ManagerError::MissingChainAccount)?
                    .clone();
                SubManager::Generic(gen::GenManager::new(
                    handlers::lookup(code).map_err(WalletError::from)?,
                    Arc::new(GenWallet::new(account)),
                    self.storage.clone(),
                ))
            }
        };
        let _ = self.sub.set(sub);
        Ok(())
    }

    fn default_fee_basis_for(&self, family: ChainFamily) -> FeeBasis {
        let tier_price = self
            .network
            .fees()
            .first()
            .and_then(|fee| u64::try_from(fee.price_per_cost_factor.base_value()).ok());
        match family {
            ChainFamily::Utxo => FeeBasis::Utxo {
                fee_per_kb: tier_price.unwrap_or(5_000),
                size_in_bytes: 0,
            },
            ChainFamily::Ethereum => FeeBasis::Ethereum {
                gas_limit: 21_000,
                gas_price_wei: U256::from(tier_price.unwrap_or(25_000_000_000)),
            },
            ChainFamily::Generic => match self.sub() {
                SubManager::Generic(gen) => gen.handler.default_fee_basis(),
                _ => FeeBasis::Generic {
                    price_per_cost_factor: U256::from(10),
                    cost_factor: 1.0,
                },
            },
        }
    }

    fn build_primary_wallet(&self) -> Result<WalletRef, ManagerError> {
        let currency = self.network.currency().clone();
        let entry = self
            .network
            .entry_for(&currency)
            .ok_or(ManagerError::UnknownCurrency)?;
        let payload = match self.sub() {
            SubManager::Utxo(utxo) => WalletPayload::Bitcoin(utxo.wallet.clone()),
            SubManager::Ethereum(_) => {
                let NativeNetwork::Ethereum { chain_id } = self.network.native() else {
                    unreachable!("ethereum sub-manager on ethereum network");
                };
                WalletPayload::Ethereum(Arc::new(EthWallet::new(
                    self.account.eth().clone(),
                    None,
                    *chain_id,
                )))
            }
            SubManager::Generic(gen) => WalletPayload::Generic(gen.wallet.clone()),
        };
        Ok(Wallet::new(
            currency,
            entry.default_unit.clone(),
            entry.base_unit.clone(),
            entry.base_unit.clone(),
            self.default_fee_basis_for(self.network.family()),
            payload,
        ))
    }

    // MARK: - Accessors

    pub fn account(&self) -> &AccountRef {
        &self.account
    }

    pub fn network(&self) -> &NetworkRef {
        &self.network
    }

    pub fn primary_wallet(&self) -> WalletRef {
        self.primary.get().expect("primary built at create").clone()
    }

    pub fn wallets(&self) -> Vec<WalletRef> {
        self.wallets.lock().unwrap().clone()
    }

    pub fn state(&self) -> ManagerState {
        self.state.lock().unwrap().clone()
    }

    pub fn mode(&self) -> SyncMode {
        *self.mode.lock().unwrap()
    }

    pub fn address_scheme(&self) -> AddressScheme {
        *self.scheme.lock().unwrap()
    }

    pub fn set_address_scheme(&self, scheme: AddressScheme) {
        *self.scheme.lock().unwrap() = scheme;
    }

    pub fn storage_path(&self) -> &PathBuf {
        &self.path
    }

    fn contains_wallet(&self, wallet: &WalletRef) -> bool {
        self.wallets
            .lock()
            .unwrap()
            .iter()
            .any(|held| Arc::ptr_eq(held, wallet))
    }

    /// Creates (or returns) the wallet for `currency`. For Ethereum, a
    /// currency whose issuer matches an installed token gets a token wallet.
    pub fn register_wallet(&self, currency: &CurrencyRef) -> Result<WalletRef, ManagerError> {
        if let Some(existing) = self
            .wallets()
            .into_iter()
            .find(|wallet| wallet.currency().as_ref() == currency.as_ref())
        {
            return Ok(existing);
        }
        let entry = self
            .network
            .entry_for(currency)
            .ok_or(ManagerError::UnknownCurrency)?;

        let SubManager::Ethereum(eth) = self.sub() else {
            return Err(ManagerError::UnknownCurrency);
        };
        let token = currency
            .issuer()
            .and_then(|issuer| issuer.parse().ok())
            .and_then(|contract: alloy_primitives::Address| {
                eth.tokens
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|token| token.contract == contract)
                    .cloned()
            })
            .ok_or(ManagerError::UnknownCurrency)?;

        let NativeNetwork::Ethereum { chain_id } = self.network.native() else {
            return Err(ManagerError::UnknownCurrency);
        };
        let wallet = Wallet::new(
            currency.clone(),
            entry.default_unit.clone(),
            entry.base_unit.clone(),
            self.primary_wallet().unit_for_fee().clone(),
            FeeBasis::Ethereum {
                gas_limit: token.gas_limit,
                gas_price_wei: token.gas_price_wei,
            },
            WalletPayload::Ethereum(Arc::new(EthWallet::new(
                self.account.eth().clone(),
                Some(token),
                *chain_id,
            ))),
        );
        self.wallets.lock().unwrap().push(wallet.clone());
        self.post(SystemEvent::Wallet(wallet.clone(), WalletEvent::Created));
        self.post(SystemEvent::Manager(ManagerEvent::WalletAdded(
            wallet.clone(),
        )));
        Ok(wallet)
    }

    // MARK: - Event loop

    fn start_event_loop(self: &Arc<Self>) {
        let (sender, receiver) = mpsc::channel::<LoopMessage>();
        *self.events.sender.lock().unwrap() = Some(sender);
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("walletkit-manager".to_string())
            .spawn(move || loop {
                match receiver.recv_timeout(Duration::from_secs(1)) {
                    Ok(LoopMessage::Event(event)) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.deliver(*event);
                    }
                    Ok(LoopMessage::Stop) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.periodic_tick();
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("spawn event loop");
        *self.events.handle.lock().unwrap() = Some(handle);
    }

    fn post(&self, event: SystemEvent) {
        let sender = self.events.sender.lock().unwrap();
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(LoopMessage::Event(Box::new(event)));
        }
    }

    fn deliver(&self, event: SystemEvent) {
        match event {
            SystemEvent::Manager(event) => self.listener.manager_event(event),
            SystemEvent::Wallet(wallet, event) => self.listener.wallet_event(&wallet, event),
            SystemEvent::Transfer(wallet, transfer, event) => {
                self.listener.transfer_event(&wallet, &transfer, event)
            }
        }
    }

    fn periodic_tick(&self) {
        if !matches!(
            self.state(),
            ManagerState::Connected | ManagerState::Syncing
        ) {
            return;
        }
        match self.sub() {
            SubManager::Generic(gen) => {
                if gen.dispatch_due() {
                    self.gen_periodic_dispatch();
                }
            }
            SubManager::Ethereum(eth) => {
                let due = {
                    let mut last = eth.last_bcs_tick.lock().unwrap();
                    if last.elapsed()
                        >= Duration::from_secs(
                            walletkit_bcs::BCS_TRANSACTION_CHECK_STATUS_SECONDS,
                        )
                    {
                        *last = Instant::now();
                        true
                    } else {
                        false
                    }
                };
                if due {
                    if let Some(bcs) = eth.bcs.lock().unwrap().as_mut() {
                        bcs.periodic_dispatch();
                    }
                }
            }
            SubManager::Utxo(_) => {}
        }
    }

    // MARK: - State machine

    fn change_state(&self, new: ManagerState) -> ManagerState {
        // Post while the state lock is held so CHANGED events enqueue in
        // transition order. Posting is a channel send, never a callback.
        let mut state = self.state.lock().unwrap();
        let old = std::mem::replace(&mut *state, new.clone());
        if old != new {
            self.post(SystemEvent::Manager(ManagerEvent::Changed {
                old: old.clone(),
                new,
            }));
        }
        old
    }

    /// Connects and begins a sync. A repeated connect while connected is a
    /// no-op.
    pub fn connect(&self, _peer: Option<String>) {
        match self.state() {
            ManagerState::Created | ManagerState::Disconnected { .. } => {
                self.change_state(ManagerState::Connected);
                self.begin_sync();
            }
            ManagerState::Connected => {}
            ManagerState::Syncing | ManagerState::Deleted => {}
        }
    }

    pub fn disconnect(&self) {
        match self.state() {
            ManagerState::Syncing => {
                self.post(SystemEvent::Manager(ManagerEvent::SyncStopped {
                    error: None,
                }));
                self.change_state(ManagerState::Disconnected {
                    reason: "requested".to_string(),
                });
            }
            ManagerState::Connected => {
                self.change_state(ManagerState::Disconnected {
                    reason: "requested".to_string(),
                });
            }
            _ => {}
        }
    }

    /// Re-enters SYNCING; from CONNECTED starts one, while SYNCING restarts.
    pub fn sync(&self) {
        match self.state() {
            ManagerState::Connected => self.begin_sync(),
            ManagerState::Syncing => {
                self.post(SystemEvent::Manager(ManagerEvent::SyncStopped {
                    error: None,
                }));
                self.change_state(ManagerState::Connected);
                self.begin_sync();
            }
            _ => {}
        }
    }

    /// Recommends and performs a sync reaching at least `depth` blocks back.
    pub fn sync_to_depth(&self, depth: u64) {
        self.post(SystemEvent::Manager(ManagerEvent::SyncRecommended { depth }));
        self.sync();
    }

    fn begin_sync(&self) {
        self.post(SystemEvent::Manager(ManagerEvent::SyncStarted));
        self.change_state(ManagerState::Syncing);

        if self.mode().syncs_via_api() {
            self.request_block_number();
            self.request_transactions();
            if let SubManager::Ethereum(_) = self.sub() {
                let address = self.account.eth().address().to_string();
                let state = self.new_request(PendingRequest::Nonce);
                self.client.get_nonce(state, address.clone());
                let wallet = self.primary_wallet();
                let state = self.new_request(PendingRequest::Balance { wallet });
                self.client.get_balance(state, address, None);
            }
        } else if let SubManager::Ethereum(eth) = self.sub() {
            // P2P: bring up the sync core; peers feed it via the manager's
            // announce/provision entry points.
            let mut bcs = eth.bcs.lock().unwrap();
            if bcs.is_none() {
                *bcs = Some(Bcs::new(
                    self.account.eth().address(),
                    Arc::new(BcsBridge {
                        manager: self.weak_self.get().cloned().unwrap_or_default(),
                    }),
                    Arc::new(NullIssuer),
                    InitialState::default(),
                ));
            }
        }
    }

    /// Changes the sync mode: silently while disconnected, bouncing the sync
    /// while connected. Generic chains accept only [SyncMode::ApiOnly].
    pub fn set_mode(&self, mode: SyncMode) -> Result<(), ManagerError> {
        if self.network.family() == ChainFamily::Generic && mode != SyncMode::ApiOnly {
            return Err(ManagerError::UnsupportedMode);
        }
        let connected = matches!(
            self.state(),
            ManagerState::Connected | ManagerState::Syncing
        );
        if connected && self.state() == ManagerState::Syncing {
            self.post(SystemEvent::Manager(ManagerEvent::SyncStopped {
                error: None,
            }));
            self.change_state(ManagerState::Connected);
        }
        *self.mode.lock().unwrap() = mode;
        if connected {
            self.begin_sync();
        }
        Ok(())
    }

    pub fn set_network_reachable(&self, reachable: bool) {
        debug!("network reachable: {reachable}");
        if !reachable {
            self.disconnect();
        }
    }

    /// Marks the manager deleted, the terminal state, after tearing down any
    /// connection.
    pub fn delete(&self) {
        self.disconnect();
        for wallet in self.wallets() {
            let old = wallet.set_state(crate::wallet::WalletState::Deleted);
            if old != crate::wallet::WalletState::Deleted {
                self.post(SystemEvent::Wallet(wallet.clone(), WalletEvent::Deleted));
                self.post(SystemEvent::Manager(ManagerEvent::WalletDeleted(wallet)));
            }
        }
        self.change_state(ManagerState::Deleted);
        self.post(SystemEvent::Manager(ManagerEvent::Deleted));
    }

    /// Stops everything: the sub-manager's work and the event loop. Pending
    /// announcements and provisions arriving later are dropped.
    pub fn stop(&self) {
        if let SubManager::Ethereum(eth) = self.sub() {
            if let Some(bcs) = eth.bcs.lock().unwrap().as_mut() {
                bcs.stop();
            }
        }
        self.requests.lock().unwrap().clear();
        let sender = self.events.sender.lock().unwrap().take();
        if let Some(sender) = sender {
            let _ = sender.send(LoopMessage::Stop);
        }
        let handle = self.events.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // MARK: - Client plumbing

    fn new_request(&self, pending: PendingRequest) -> CallbackState {
        let rid = self.next_rid.fetch_add(1, Ordering::AcqRel);
        self.requests.lock().unwrap().insert(rid, pending);
        CallbackState(rid)
    }

    fn take_request(&self, state: CallbackState) -> Option<PendingRequest> {
        self.requests.lock().unwrap().remove(&state.0)
    }

    fn request_block_number(&self) {
        let state = self.new_request(PendingRequest::BlockNumber);
        self.client.get_block_number(state);
    }

    fn request_transactions(&self) {
        let primary = self.primary_wallet();
        let addresses = match self.sub() {
            SubManager::Utxo(_) => vec![
                primary
                    .address(AddressScheme::BtcLegacy)
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
            ],
            SubManager::Ethereum(_) => vec![self.account.eth().address().to_string()],
            SubManager::Generic(gen) => vec![gen.wallet.account.address.display.clone()],
        };
        let state = self.new_request(PendingRequest::Transactions {
            wallet: primary,
        });
        self.client
            .get_transactions(state, addresses, 0, self.network.height());
    }

    /// Embedder reply to `get_block_number`.
    pub fn announce_block_number(&self, state: CallbackState, height: u64) {
        let Some(PendingRequest::BlockNumber) = self.take_request(state) else {
            warn!("announce_block_number: stale cookie {state:?}");
            return;
        };
        self.network.update_height(height);
        self.post(SystemEvent::Manager(ManagerEvent::BlockHeightUpdated {
            height,
        }));
    }

    /// Embedder reply to a UTXO `get_transactions`: one raw transaction.
    /// `complete` marks the final announcement for the request's cookie.
    pub fn announce_transaction_bytes(
        &self,
        state: CallbackState,
        raw: &[u8],
        block_height: u32,
        timestamp: u32,
        complete: bool,
    ) {
        let wallet = {
            let requests = self.requests.lock().unwrap();
            match requests.get(&state.0) {
                Some(PendingRequest::Transactions { wallet }) => wallet.clone(),
                _ => {
                    warn!("announce_transaction_bytes: stale cookie {state:?}");
                    return;
                }
            }
        };
        if complete {
            self.take_request(state);
        }

        let SubManager::Utxo(utxo) = self.sub() else {
            return;
        };
        let Ok(tx) = bitcoin::consensus::encode::deserialize::<bitcoin::Transaction>(raw) else {
            warn!("announce_transaction_bytes: undecodable transaction");
            return;
        };
        if utxo
            .wallet
            .register_transaction(tx.clone(), block_height, timestamp)
        {
            self.recover_btc_transfer(&wallet, &tx, block_height, timestamp);
        }
        if complete {
            self.finish_sync_round();
        }
    }

    /// Wraps a registered UTXO transaction as a transfer with events.
    fn recover_btc_transfer(
        &self,
        wallet: &WalletRef,
        tx: &bitcoin::Transaction,
        block_height: u32,
        timestamp: u32,
    ) {
        let SubManager::Utxo(utxo) = self.sub() else {
            return;
        };
        let parts = utxo.wallet.transfer_parts(tx);
        let direction = match (parts.sent, parts.received) {
            (true, true) if parts.amount_sats == 0 => crate::transfer::TransferDirection::Recovered,
            (true, _) => crate::transfer::TransferDirection::Sent,
            _ => crate::transfer::TransferDirection::Received,
        };
        let source = parts
            .source
            .map(|address| Address::Bitcoin {
                address,
                is_bitcoin: utxo.wallet.is_bitcoin(),
            })
            .unwrap_or_else(|| Address::generic("unknown", vec![], "<unknown>"));
        let target = parts
            .target
            .map(|address| Address::Bitcoin {
                address,
                is_bitcoin: utxo.wallet.is_bitcoin(),
            })
            .unwrap_or_else(|| Address::generic("unknown", vec![], "<unknown>"));

        let txid_bytes: [u8; 32] = *tx.compute_txid().as_raw_hash().as_byte_array();
        let transfer = crate::transfer::Transfer::new(
            source,
            target,
            Amount::from_base(
                wallet.base_unit().clone(),
                false,
                U256::from(parts.amount_sats),
            ),
            wallet.unit_for_fee().clone(),
            // At 1000 sat/KB the recovered fee reads back exactly.
            FeeBasis::Utxo {
                fee_per_kb: 1000,
                size_in_bytes: parts.fee_sats.unwrap_or(0),
            },
            direction,
            Some(TxHash::from(txid_bytes)),
            TransferPayload::Bitcoin(crate::chains::btc::BtcTransferPayload {
                tx: tx.clone(),
                fee_sats: parts.fee_sats,
            }),
        );
        if block_height > 0 {
            transfer.set_state(TransferState::Included {
                block_number: u64::from(block_height),
                transaction_index: 0,
                timestamp: u64::from(timestamp),
                fee: parts.fee_sats.map(|fee| {
                    Amount::from_base(wallet.unit_for_fee().clone(), false, U256::from(fee))
                }),
            });
        }
        if wallet.add_transfer(transfer.clone()) {
            self.post(SystemEvent::Transfer(
                wallet.clone(),
                transfer.clone(),
                TransferEvent::Created,
            ));
            self.post(SystemEvent::Wallet(
                wallet.clone(),
                WalletEvent::TransferAdded(transfer),
            ));
            self.post(SystemEvent::Wallet(
                wallet.clone(),
                WalletEvent::BalanceUpdated(wallet.balance()),
            ));
        }
    }

    /// Embedder reply to an account-chain `get_transactions`.
    pub fn announce_transfers(
        &self,
        state: CallbackState,
        transfers: Vec<AnnouncedTransfer>,
        success: bool,
    ) {
        let Some(PendingRequest::Transactions { wallet }) = self.take_request(state) else {
            warn!("announce_transfers: stale cookie {state:?}");
            return;
        };
        if !success {
            self.post(SystemEvent::Manager(ManagerEvent::SyncStopped {
                error: Some("transfer fetch failed".to_string()),
            }));
            self.change_state(ManagerState::Connected);
            return;
        }
        for announced in transfers {
            self.handle_announced_transfer(&wallet, announced);
        }
        self.finish_sync_round();
    }

    /// The generic recover-transfer path; Ethereum API sync reuses it.
    pub fn handle_announced_transfer(&self, wallet: &WalletRef, announced: AnnouncedTransfer) {
        gen::handle_transfer(self, wallet, announced);
    }

    /// A completed API sync round returns the manager to CONNECTED.
    fn finish_sync_round(&self) {
        if self.state() == ManagerState::Syncing {
            self.post(SystemEvent::Manager(ManagerEvent::SyncContinues {
                percent: 100.0,
            }));
            self.post(SystemEvent::Manager(ManagerEvent::SyncStopped {
                error: None,
            }));
            self.change_state(ManagerState::Connected);
        }
    }

    /// Embedder reply to `submit_transaction`.
    pub fn announce_submit(&self, state: CallbackState, error: Option<String>) {
        let Some(PendingRequest::Submit { wallet, transfer }) = self.take_request(state) else {
            warn!("announce_submit: stale cookie {state:?}");
            return;
        };
        if let Some(message) = error {
            let old = transfer.set_state(TransferState::Errored {
                message: message.clone(),
            });
            self.post(SystemEvent::Transfer(
                wallet.clone(),
                transfer.clone(),
                TransferEvent::Changed {
                    old,
                    new: TransferState::Errored { message },
                },
            ));
        }
    }

    /// Embedder reply to `get_balance`.
    pub fn announce_balance(&self, state: CallbackState, balance: &str) {
        let Some(PendingRequest::Balance { wallet }) = self.take_request(state) else {
            warn!("announce_balance: stale cookie {state:?}");
            return;
        };
        let Ok(value) = U256::from_str_radix(balance.trim_start_matches("0x"), 16)
            .or_else(|_| U256::from_str_radix(balance, 10))
        else {
            return;
        };
        match wallet.payload() {
            WalletPayload::Ethereum(eth) => eth.set_balance(value),
            WalletPayload::Generic(gen) => gen.set_balance(value),
            WalletPayload::Bitcoin(_) => return,
        }
        self.post(SystemEvent::Wallet(
            wallet.clone(),
            WalletEvent::BalanceUpdated(wallet.balance()),
        ));
    }

    /// Embedder reply to `get_nonce`.
    pub fn announce_nonce(&self, state: CallbackState, nonce: u64) {
        let Some(PendingRequest::Nonce) = self.take_request(state) else {
            warn!("announce_nonce: stale cookie {state:?}");
            return;
        };
        self.account.eth().set_nonce(nonce);
    }

    /// Embedder reply to `estimate_gas`.
    pub fn announce_gas_estimate(&self, state: CallbackState, gas_limit: Option<u64>) {
        let Some(PendingRequest::GasEstimate { wallet, cookie }) = self.take_request(state) else {
            warn!("announce_gas_estimate: stale cookie {state:?}");
            return;
        };
        let basis = gas_limit.map(|gas_limit| {
            let FeeBasis::Ethereum { gas_price_wei, .. } = wallet.default_fee_basis() else {
                return FeeBasis::Ethereum {
                    gas_limit,
                    gas_price_wei: U256::ZERO,
                };
            };
            FeeBasis::Ethereum {
                gas_limit,
                gas_price_wei,
            }
        });
        self.post(SystemEvent::Wallet(
            wallet.clone(),
            WalletEvent::FeeBasisEstimated { cookie, basis },
        ));
    }

    /// Replaces a wallet's default fee basis and reports it.
    pub fn set_default_fee_basis(
        &self,
        wallet: &WalletRef,
        basis: FeeBasis,
    ) -> Result<(), ManagerError> {
        if !self.contains_wallet(wallet) {
            return Err(ManagerError::UnknownWallet);
        }
        wallet.set_default_fee_basis(basis.clone())?;
        self.post(SystemEvent::Wallet(
            wallet.clone(),
            WalletEvent::FeeBasisUpdated(basis),
        ));
        Ok(())
    }

    /// Asks the client to estimate the fee for `transfer`; the result comes
    /// back as a FEE_BASIS_ESTIMATED wallet event carrying `cookie`.
    pub fn estimate_fee_basis(
        &self,
        wallet: &WalletRef,
        transfer: &TransferRef,
        cookie: u64,
    ) -> Result<(), ManagerError> {
        if !self.contains_wallet(wallet) {
            return Err(ManagerError::UnknownWallet);
        }
        let state = self.new_request(PendingRequest::GasEstimate {
            wallet: wallet.clone(),
            cookie,
        });
        let (to, amount, data) = transfer.with_payload(|payload| match payload {
            TransferPayload::Ethereum(eth) => (
                eth.to.to_string(),
                eth.value.to_string(),
                alloy_primitives::hex::encode_prefixed(&eth.data),
            ),
            _ => (String::new(), String::new(), String::new()),
        });
        self.client.estimate_gas(
            state,
            self.account.eth().address().to_string(),
            to,
            amount,
            data,
        );
        Ok(())
    }

    // MARK: - Signing and submission

    /// Signs `transfer` with keys derived from the paper key; the seed is
    /// wiped when this returns, on every path.
    pub fn sign(
        &self,
        wallet: &WalletRef,
        transfer: &TransferRef,
        paper_key: &str,
    ) -> Result<(), ManagerError> {
        if !self.contains_wallet(wallet) {
            return Err(ManagerError::UnknownWallet);
        }
        match transfer.state() {
            TransferState::Created => {}
            TransferState::Signed => return Err(ManagerError::AlreadySigned),
            _ => return Err(ManagerError::AlreadySubmitted),
        }
        let seed =
            crate::account::Account::derive_seed(paper_key).map_err(|_| ManagerError::InvalidPhrase)?;

        let hash = match self.sub() {
            SubManager::Utxo(utxo) => transfer.with_payload_mut(|payload| {
                let TransferPayload::Bitcoin(btc) = payload else {
                    return Err(ManagerError::UnknownTransfer);
                };
                let txid = utxo
                    .wallet
                    .sign_transaction(&mut btc.tx, &seed)
                    .map_err(|e| ManagerError::Wallet(e.into()))?;
                let bytes: [u8; 32] = *txid.as_raw_hash().as_byte_array();
                Ok(TxHash::from(bytes))
            })?,
            SubManager::Ethereum(_) => transfer.with_payload_mut(|payload| {
                let TransferPayload::Ethereum(eth) = payload else {
                    return Err(ManagerError::UnknownTransfer);
                };
                let account = crate::chains::eth::EthAccount::from_seed(&seed)
                    .map_err(|_| ManagerError::InvalidPhrase)?;
                eth.sign(account.key())
                    .map_err(|_| ManagerError::InvalidPhrase)
            })?,
            SubManager::Generic(gen) => transfer.with_payload_mut(|payload| {
                let TransferPayload::Generic(inner) = payload else {
                    return Err(ManagerError::UnknownTransfer);
                };
                gen.handler
                    .transfer_sign(inner, &seed)
                    .map_err(|e| ManagerError::Wallet(e.into()))
            })?,
        };

        transfer.set_hash(hash);
        let old = transfer.set_state(TransferState::Signed);
        // The ADD-before-CHANGED contract: a transfer not yet in the wallet
        // changes state silently; submission adds it and reports from there.
        if wallet.has_transfer(transfer) {
            self.post(SystemEvent::Transfer(
                wallet.clone(),
                transfer.clone(),
                TransferEvent::Changed {
                    old,
                    new: TransferState::Signed,
                },
            ));
        }
        Ok(())
    }

    /// Signs with a raw private key (sweeps). A key without a secret makes
    /// this a no-op.
    pub fn submit_for_key(
        &self,
        wallet: &WalletRef,
        transfer: &TransferRef,
        key: &Key,
    ) -> Result<(), ManagerError> {
        if !key.has_secret() {
            warn!("submit_for_key: key has no secret, ignoring");
            return Ok(());
        }
        if !self.contains_wallet(wallet) {
            return Err(ManagerError::UnknownWallet);
        }
        let hash = transfer.with_payload_mut(|payload| match payload {
            TransferPayload::Ethereum(eth) => {
                eth.sign(key).map_err(|_| ManagerError::InvalidPhrase)
            }
            _ => Err(ManagerError::UnknownTransfer),
        })?;
        transfer.set_hash(hash);
        let old = transfer.set_state(TransferState::Signed);
        if wallet.has_transfer(transfer) {
            self.post(SystemEvent::Transfer(
                wallet.clone(),
                transfer.clone(),
                TransferEvent::Changed {
                    old,
                    new: TransferState::Signed,
                },
            ));
        }
        self.submit_signed(wallet, transfer)
    }

    /// Signs and submits.
    pub fn submit(
        &self,
        wallet: &WalletRef,
        transfer: &TransferRef,
        paper_key: &str,
    ) -> Result<(), ManagerError> {
        self.sign(wallet, transfer, paper_key)?;
        self.submit_signed(wallet, transfer)
    }

    /// Submits an already signed transfer: joins it to the wallet, hands the
    /// raw bytes to the send path, and advances its state.
    pub fn submit_signed(
        &self,
        wallet: &WalletRef,
        transfer: &TransferRef,
    ) -> Result<(), ManagerError> {
        if !self.contains_wallet(wallet) {
            return Err(ManagerError::UnknownWallet);
        }
        if transfer.state() != TransferState::Signed {
            return Err(ManagerError::AlreadySubmitted);
        }

        if wallet.add_transfer(transfer.clone()) {
            self.post(SystemEvent::Transfer(
                wallet.clone(),
                transfer.clone(),
                TransferEvent::Created,
            ));
            self.post(SystemEvent::Wallet(
                wallet.clone(),
                WalletEvent::TransferAdded(transfer.clone()),
            ));
        }

        let raw = transfer.with_payload(|payload| match payload {
            TransferPayload::Bitcoin(btc) => {
                Ok(bitcoin::consensus::encode::serialize(&btc.tx))
            }
            TransferPayload::Ethereum(eth) => eth
                .raw_signed()
                .map_err(|_| ManagerError::AlreadySubmitted),
            TransferPayload::Generic(inner) => match self.sub() {
                SubManager::Generic(gen) => Ok(gen.handler.transfer_serialize(inner)),
                _ => Err(ManagerError::UnknownTransfer),
            },
        })?;

        if self.mode().sends_via_p2p() {
            match self.sub() {
                SubManager::Ethereum(eth) => {
                    if let (Some(bcs), Some(hash)) =
                        (eth.bcs.lock().unwrap().as_mut(), transfer.hash())
                    {
                        bcs.submit_transaction(
                            walletkit_bcs::block::BcsTransaction {
                                hash,
                                source: self.account.eth().address(),
                                target: None,
                                amount: U256::ZERO,
                                gas_used: None,
                                status: walletkit_bcs::block::TransactionStatus::Unknown,
                            },
                            raw,
                        );
                    }
                }
                _ => {
                    // UTXO P2P publication is the SPV peer pool's business;
                    // without one the submission stays local.
                    debug!("p2p send: no native sender attached");
                }
            }
        } else {
            let state = self.new_request(PendingRequest::Submit {
                wallet: wallet.clone(),
                transfer: transfer.clone(),
            });
            self.client.submit_transaction(state, raw, transfer.hash());
        }

        let old = transfer.set_state(TransferState::Submitted);
        self.post(SystemEvent::Transfer(
            wallet.clone(),
            transfer.clone(),
            TransferEvent::Changed {
                old,
                new: TransferState::Submitted,
            },
        ));
        self.post(SystemEvent::Wallet(
            wallet.clone(),
            WalletEvent::TransferSubmitted(transfer.clone()),
        ));
        self.post(SystemEvent::Wallet(
            wallet.clone(),
            WalletEvent::BalanceUpdated(wallet.balance()),
        ));

        // Generic chains persist the transfer for replay at next start.
        if let SubManager::Generic(gen) = self.sub() {
            gen.persist_transfer(wallet, transfer);
        }
        Ok(())
    }

    fn gen_periodic_dispatch(&self) {
        self.request_block_number();
        self.request_transactions();

        // Re-offer submitted-but-unconfirmed transfers to the network.
        let SubManager::Generic(gen) = self.sub() else {
            return;
        };
        let wallet = self.primary_wallet();
        for transfer in wallet.transfers() {
            if transfer.state() != TransferState::Submitted {
                continue;
            }
            let raw = transfer.with_payload(|payload| match payload {
                TransferPayload::Generic(inner) => gen.handler.transfer_serialize(inner),
                _ => Vec::new(),
            });
            if raw.is_empty() {
                continue;
            }
            let state = self.new_request(PendingRequest::Submit {
                wallet: wallet.clone(),
                transfer: transfer.clone(),
            });
            self.client.submit_transaction(state, raw, transfer.hash());
        }
    }

    /// Feeds a P2P provision result into the Ethereum sync core.
    pub fn handle_provision(&self, result: ProvisionResult) {
        if let SubManager::Ethereum(eth) = self.sub() {
            if let Some(bcs) = eth.bcs.lock().unwrap().as_mut() {
                bcs.handle_provision(result);
            }
        }
    }
}

impl Drop for WalletManager {
    fn drop(&mut self) {
        // The event thread holds only a Weak; detach it if still running.
        let sender = self.events.sender.lock().unwrap().take();
        if let Some(sender) = sender {
            let _ = sender.send(LoopMessage::Stop);
        }
    }
}

/// Routes BCS discoveries back into manager events.
struct BcsBridge {
    manager: Weak<WalletManager>,
}

impl Default for BcsBridge {
    fn default() -> Self {
        Self {
            manager: Weak::new(),
        }
    }
}

impl walletkit_bcs::BcsListener for BcsBridge {
    fn chain_extended(&self, _hash: walletkit_primitives::BlockHash, number: u64, _timestamp: u64) {
        if let Some(manager) = self.manager.upgrade() {
            manager.network.update_height(number);
            manager.post(SystemEvent::Manager(ManagerEvent::BlockHeightUpdated {
                height: number,
            }));
        }
    }

    fn account_updated(&self, state: walletkit_bcs::block::AccountState, _block_number: u64) {
        if let Some(manager) = self.manager.upgrade() {
            manager.account.eth().set_nonce(state.nonce);
            let wallet = manager.primary_wallet();
            if let WalletPayload::Ethereum(eth) = wallet.payload() {
                eth.set_balance(state.balance);
            }
            manager.post(SystemEvent::Wallet(
                wallet.clone(),
                WalletEvent::BalanceUpdated(wallet.balance()),
            ));
        }
    }

    fn transaction_updated(&self, transaction: walletkit_bcs::block::BcsTransaction) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let wallet = manager.primary_wallet();
        let Some(transfer) = wallet.find_transfer_by_hash(&transaction.hash) else {
            return;
        };
        let new = match &transaction.status {
            walletkit_bcs::block::TransactionStatus::Included {
                block_number,
                transaction_index,
                block_timestamp,
                ..
            } => TransferState::Included {
                block_number: *block_number,
                transaction_index: *transaction_index,
                timestamp: *block_timestamp,
                fee: None,
            },
            walletkit_bcs::block::TransactionStatus::Errored(message) => TransferState::Errored {
                message: message.clone(),
            },
            _ => TransferState::Submitted,
        };
        let old = transfer.set_state(new.clone());
        if old != new {
            manager.post(SystemEvent::Transfer(
                wallet.clone(),
                transfer,
                TransferEvent::Changed { old, new },
            ));
            manager.post(SystemEvent::Wallet(
                wallet.clone(),
                WalletEvent::BalanceUpdated(wallet.balance()),
            ));
        }
    }

    fn log_updated(&self, _log: walletkit_bcs::block::BcsLog) {}

    fn sync_event(&self, event: walletkit_bcs::SyncEvent) {
        if let Some(manager) = self.manager.upgrade() {
            let event = match event {
                walletkit_bcs::SyncEvent::Started => ManagerEvent::SyncStarted,
                walletkit_bcs::SyncEvent::Continues { percent } => {
                    ManagerEvent::SyncContinues { percent }
                }
                walletkit_bcs::SyncEvent::Stopped { error } => ManagerEvent::SyncStopped { error },
            };
            manager.post(SystemEvent::Manager(event));
        }
    }

    fn save_blocks(&self, headers: Vec<walletkit_bcs::block::BlockHeader>) {
        if let Some(manager) = self.manager.upgrade() {
            for header in headers {
                if let Ok(blob) = serde_json::to_vec(&header) {
                    manager.storage.save(
                        crate::storage::entity::BLOCK,
                        &header.hash.to_string(),
                        &blob,
                    );
                }
            }
        }
    }

    fn save_peers(&self, peers: Vec<walletkit_bcs::provision::PeerId>) {
        if let Some(manager) = self.manager.upgrade() {
            for peer in peers {
                manager.storage.save(
                    crate::storage::entity::PEER,
                    &peer.to_string(),
                    peer.to_string().as_bytes(),
                );
            }
        }
    }

    fn update_transaction(
        &self,
        op: walletkit_bcs::ChangeOp,
        transaction: walletkit_bcs::block::BcsTransaction,
    ) {
        if let Some(manager) = self.manager.upgrade() {
            let key = transaction.hash.to_string();
            match op {
                walletkit_bcs::ChangeOp::Rem => {
                    manager.storage.remove(crate::storage::entity::TRANSACTION, &key)
                }
                _ => {
                    if let Ok(blob) = serde_json::to_vec(&transaction) {
                        manager
                            .storage
                            .save(crate::storage::entity::TRANSACTION, &key, &blob);
                    }
                }
            }
        }
    }

    fn update_log(&self, op: walletkit_bcs::ChangeOp, log: walletkit_bcs::block::BcsLog) {
        if let Some(manager) = self.manager.upgrade() {
            let key = format!("{}:{}", log.transaction_hash, log.transaction_index);
            match op {
                walletkit_bcs::ChangeOp::Rem => {
                    manager.storage.remove(crate::storage::entity::LOG, &key)
                }
                _ => {
                    if let Ok(blob) = serde_json::to_vec(&log) {
                        manager.storage.save(crate::storage::entity::LOG, &key, &blob);
                    }
                }
            }
        }
    }
}
