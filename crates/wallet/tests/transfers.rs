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

//! Transfer flows through the manager: recovery from announced records,
//! submission through the client, and the event-ordering contracts around
//! both.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use walletkit::account::Account;
use walletkit::amount::Amount;
use walletkit::client::{AnnouncedTransfer, CallbackState, Client};
use walletkit::currency::{Currency, CURRENCY_KIND_NATIVE};
use walletkit::events::{Listener, ManagerEvent, TransferEvent, WalletEvent};
use walletkit::manager::{ManagerConfig, SyncMode, WalletManager};
use walletkit::network::{NativeNetwork, Network, NetworkCurrency, NetworkRef};
use walletkit::storage::MemoryFileService;
use walletkit::transfer::{TransferRef, TransferState};
use walletkit::unit::Unit;
use walletkit::wallet::{AddressScheme, WalletRef};
use walletkit_primitives::TxHash;

const PAPER_KEY: &str =
    "ginger settle marine tissue robot crane night number ramp coast roast critic";

#[derive(Debug)]
enum Request {
    BlockNumber(CallbackState),
    Transactions(CallbackState, Vec<String>),
    Submit(CallbackState, Vec<u8>),
}

/// Records every client call with its cookie so the test can announce back.
#[derive(Default)]
struct ScriptedClient {
    requests: Mutex<Vec<Request>>,
}

impl ScriptedClient {
    fn take(&self) -> Vec<Request> {
        std::mem::take(&mut self.requests.lock().unwrap())
    }

    fn wait_for_any(&self) -> Vec<Request> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let requests = self.requests.lock().unwrap();
                if !requests.is_empty() {
                    drop(requests);
                    return self.take();
                }
            }
            if Instant::now() > deadline {
                return Vec::new();
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Client for ScriptedClient {
    fn get_block_number(&self, state: CallbackState) {
        self.requests.lock().unwrap().push(Request::BlockNumber(state));
    }

    fn get_transactions(
        &self,
        state: CallbackState,
        addresses: Vec<String>,
        _begin: u64,
        _end: u64,
    ) {
        self.requests
            .lock()
            .unwrap()
            .push(Request::Transactions(state, addresses));
    }

    fn submit_transaction(&self, state: CallbackState, raw: Vec<u8>, _hash: Option<TxHash>) {
        self.requests.lock().unwrap().push(Request::Submit(state, raw));
    }
}

#[derive(Default)]
struct Recorder {
    trace: Mutex<Vec<String>>,
}

impl Recorder {
    fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    fn wait_for(&self, needle: &str) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let trace = self.trace();
            if trace.iter().any(|event| event == needle) || Instant::now() > deadline {
                return trace;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Listener for Recorder {
    fn manager_event(&self, event: ManagerEvent) {
        let name = match event {
            ManagerEvent::BlockHeightUpdated { height } => format!("block-height:{height}"),
            other => format!("manager:{}", label_of(&format!("{other:?}"))),
        };
        self.trace.lock().unwrap().push(name);
    }

    fn wallet_event(&self, _wallet: &WalletRef, event: WalletEvent) {
        let name = match event {
            WalletEvent::TransferAdded(_) => "wallet-transfer-added".to_string(),
            WalletEvent::TransferSubmitted(_) => "wallet-transfer-submitted".to_string(),
            WalletEvent::BalanceUpdated(amount) => {
                format!("wallet-balance:{}", amount.base_value())
            }
            other => format!("wallet:{}", label_of(&format!("{other:?}"))),
        };
        self.trace.lock().unwrap().push(name);
    }

    fn transfer_event(&self, _wallet: &WalletRef, _transfer: &TransferRef, event: TransferEvent) {
        let name = match event {
            TransferEvent::Created => "transfer-created".to_string(),
            TransferEvent::Changed { new, .. } => format!("transfer-changed:{}", new.tag()),
            TransferEvent::Deleted => "transfer-deleted".to_string(),
        };
        self.trace.lock().unwrap().push(name);
    }
}

fn label_of(debug: &str) -> String {
    debug
        .split([' ', '(', '{'])
        .next()
        .unwrap_or("?")
        .to_lowercase()
}

fn xrp_network() -> NetworkRef {
    let xrp = Currency::new("xrp-mainnet:xrp", "XRP", "XRP", CURRENCY_KIND_NATIVE, None);
    let drop = Unit::base(xrp.clone(), "xrp-drop", "Drop", "DROP");
    let unit = Unit::derived(xrp.clone(), "xrp-xrp", "XRP", "XRP", &drop, 6);
    Network::new(
        "xrp-mainnet",
        "XRP",
        NativeNetwork::Generic {
            code: "xrp".to_string(),
        },
        true,
        1,
        0,
        xrp.clone(),
        vec![NetworkCurrency {
            currency: xrp,
            base_unit: drop.clone(),
            default_unit: unit,
            units: vec![drop],
        }],
        vec![],
    )
}

fn xrp_manager() -> (Arc<WalletManager>, Arc<Recorder>, Arc<ScriptedClient>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let recorder = Arc::new(Recorder::default());
    let client = Arc::new(ScriptedClient::default());
    let account = Account::create(PAPER_KEY, 1_514_764_800, "transfer-uids").unwrap();
    let manager = WalletManager::create(
        recorder.clone(),
        client.clone(),
        account,
        xrp_network(),
        ManagerConfig {
            mode: SyncMode::ApiOnly,
            scheme: AddressScheme::GenDefault,
            storage_path: std::env::temp_dir().join("walletkit-transfers"),
        },
        Arc::new(MemoryFileService::default()),
    )
    .unwrap();
    (manager, recorder, client)
}

fn announced(hash_byte: u8, target: &str, amount: &str, block_height: u64) -> AnnouncedTransfer {
    AnnouncedTransfer {
        hash: TxHash::with_last_byte(hash_byte).to_string(),
        uids: format!("announced-{hash_byte}"),
        source: "rEXTERNALxxxxxxxxxxxxxxxxxxxxxxxxx".to_string(),
        target: target.to_string(),
        amount: amount.to_string(),
        currency: "XRP".to_string(),
        fee: "10".to_string(),
        timestamp: 1_600_000_000,
        block_height,
        errored: false,
    }
}

#[test]
fn announced_transfer_recovers_with_event_order() {
    let (manager, recorder, client) = xrp_manager();
    let wallet = manager.primary_wallet();
    let our_address = wallet.address(AddressScheme::GenDefault).unwrap().to_string();

    manager.connect(None);
    let requests = client.wait_for_any();
    let tx_state = requests
        .iter()
        .find_map(|request| match request {
            Request::Transactions(state, addresses) => {
                assert_eq!(addresses, &[our_address.clone()]);
                Some(*state)
            }
            _ => None,
        })
        .expect("transactions requested on connect");

    manager.announce_transfers(
        tx_state,
        vec![announced(1, &our_address, "25000000", 4_000_000)],
        true,
    );

    let trace = recorder.wait_for("wallet-balance:25000000");
    let created = trace.iter().position(|e| e == "transfer-created").unwrap();
    let added = trace
        .iter()
        .position(|e| e == "wallet-transfer-added")
        .unwrap();
    let changed = trace
        .iter()
        .position(|e| e == "transfer-changed:3")
        .unwrap();
    let balance = trace
        .iter()
        .position(|e| e == "wallet-balance:25000000")
        .unwrap();
    assert!(created < added && added < balance);
    assert!(created < changed, "ADD precedes CHANGED");

    // INCLUDED landed with its block position.
    let transfer = wallet.transfers().pop().unwrap();
    match transfer.state() {
        TransferState::Included { block_number, .. } => assert_eq!(block_number, 4_000_000),
        other => panic!("unexpected state {other:?}"),
    }
    manager.stop();
}

#[test]
fn duplicate_announcement_is_ignored() {
    let (manager, recorder, client) = xrp_manager();
    let wallet = manager.primary_wallet();
    let our_address = wallet.address(AddressScheme::GenDefault).unwrap().to_string();

    manager.connect(None);
    let first = client
        .wait_for_any()
        .into_iter()
        .find_map(|request| match request {
            Request::Transactions(state, _) => Some(state),
            _ => None,
        })
        .unwrap();
    manager.announce_transfers(
        first,
        vec![
            announced(7, &our_address, "1000", 100),
            announced(7, &our_address, "1000", 100),
        ],
        true,
    );
    recorder.wait_for("wallet-balance:1000");
    assert_eq!(wallet.transfers().len(), 1);
    manager.stop();
}

#[test]
fn block_number_announcement_updates_height() {
    let (manager, recorder, client) = xrp_manager();
    manager.connect(None);
    let state = client
        .wait_for_any()
        .into_iter()
        .find_map(|request| match request {
            Request::BlockNumber(state) => Some(state),
            _ => None,
        })
        .unwrap();
    manager.announce_block_number(state, 12_345);
    recorder.wait_for("block-height:12345");
    assert_eq!(manager.network().height(), 12_345);

    // A stale cookie is ignored.
    manager.announce_block_number(state, 99_999);
    assert_eq!(manager.network().height(), 12_345);
    manager.stop();
}

#[test]
fn submit_walks_created_signed_submitted() {
    let (manager, recorder, client) = xrp_manager();
    let wallet = manager.primary_wallet();

    let target = wallet.address(AddressScheme::GenDefault).unwrap();
    let amount = Amount::from_integer(25, wallet.base_unit().clone()).unwrap();
    let transfer = wallet
        .create_transfer(&target, &amount, &wallet.default_fee_basis())
        .unwrap();
    assert_eq!(transfer.state(), TransferState::Created);

    manager.submit(&wallet, &transfer, PAPER_KEY).unwrap();
    assert_eq!(transfer.state(), TransferState::Submitted);
    assert!(transfer.hash().is_some());
    assert!(wallet.has_transfer(&transfer));

    // The raw bytes went to the client.
    let submitted = client
        .wait_for_any()
        .into_iter()
        .any(|request| matches!(request, Request::Submit(_, raw) if !raw.is_empty()));
    assert!(submitted);

    let trace = recorder.wait_for("wallet-transfer-submitted");
    let added = trace
        .iter()
        .position(|e| e == "wallet-transfer-added")
        .unwrap();
    let submitted = trace
        .iter()
        .position(|e| e == "wallet-transfer-submitted")
        .unwrap();
    assert!(added < submitted);

    // Signing twice is refused.
    assert!(manager.sign(&wallet, &transfer, PAPER_KEY).is_err());
    manager.stop();
}

#[test]
fn submit_failure_errors_the_transfer() {
    let (manager, recorder, client) = xrp_manager();
    let wallet = manager.primary_wallet();
    let target = wallet.address(AddressScheme::GenDefault).unwrap();
    let amount = Amount::from_integer(5, wallet.base_unit().clone()).unwrap();
    let transfer = wallet
        .create_transfer(&target, &amount, &wallet.default_fee_basis())
        .unwrap();
    manager.submit(&wallet, &transfer, PAPER_KEY).unwrap();

    let state = client
        .wait_for_any()
        .into_iter()
        .find_map(|request| match request {
            Request::Submit(state, _) => Some(state),
            _ => None,
        })
        .unwrap();
    manager.announce_submit(state, Some("insufficient reserve".to_string()));

    recorder.wait_for("transfer-changed:4");
    assert!(matches!(transfer.state(), TransferState::Errored { .. }));
    manager.stop();
}

#[test]
fn persisted_transfers_replay_on_next_start() {
    let _ = env_logger::builder().is_test(true).try_init();
    let storage = Arc::new(MemoryFileService::default());
    let account = Account::create(PAPER_KEY, 0, "replay-uids").unwrap();
    let config = ManagerConfig {
        mode: SyncMode::ApiOnly,
        scheme: AddressScheme::GenDefault,
        storage_path: std::env::temp_dir().join("walletkit-replay"),
    };

    // First session: submit a transfer, which persists it.
    {
        let recorder = Arc::new(Recorder::default());
        let manager = WalletManager::create(
            recorder,
            Arc::new(ScriptedClient::default()),
            account.clone(),
            xrp_network(),
            config.clone(),
            storage.clone(),
        )
        .unwrap();
        let wallet = manager.primary_wallet();
        let target = wallet.address(AddressScheme::GenDefault).unwrap();
        let amount = Amount::from_integer(42, wallet.base_unit().clone()).unwrap();
        let transfer = wallet
            .create_transfer(&target, &amount, &wallet.default_fee_basis())
            .unwrap();
        manager.submit(&wallet, &transfer, PAPER_KEY).unwrap();
        manager.stop();
    }

    // Second session: the transfer is back, with its events.
    let recorder = Arc::new(Recorder::default());
    let manager = WalletManager::create(
        recorder.clone(),
        Arc::new(ScriptedClient::default()),
        account,
        xrp_network(),
        config,
        storage,
    )
    .unwrap();
    let trace = recorder.wait_for("transfer-created");
    assert!(trace.contains(&"transfer-created".to_string()));
    assert_eq!(manager.primary_wallet().transfers().len(), 1);
    manager.stop();
}
