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

//! Manager lifecycle scenarios: the scripted event sequences per sync mode,
//! and robustness under concurrent control calls.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use walletkit::account::Account;
use walletkit::client::NullClient;
use walletkit::currency::{Currency, CURRENCY_KIND_NATIVE};
use walletkit::events::{Listener, ManagerEvent, ManagerState, TransferEvent, WalletEvent};
use walletkit::manager::{ManagerConfig, SyncMode, WalletManager};
use walletkit::network::{NativeNetwork, Network, NetworkCurrency, NetworkRef};
use walletkit::storage::MemoryFileService;
use walletkit::transfer::TransferRef;
use walletkit::unit::Unit;
use walletkit::wallet::{AddressScheme, WalletRef};

const PAPER_KEY: &str =
    "ginger settle marine tissue robot crane night number ramp coast roast critic";

/// Captures event names in delivery order.
#[derive(Default)]
struct Recorder {
    trace: Mutex<Vec<String>>,
}

impl Recorder {
    fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    fn wait_for(&self, count: usize) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let trace = self.trace();
            if trace.len() >= count || Instant::now() > deadline {
                return trace;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn state_name(state: &ManagerState) -> &'static str {
    match state {
        ManagerState::Created => "created",
        ManagerState::Connected => "connected",
        ManagerState::Syncing => "syncing",
        ManagerState::Disconnected { .. } => "disconnected",
        ManagerState::Deleted => "deleted",
    }
}

impl Listener for Recorder {
    fn manager_event(&self, event: ManagerEvent) {
        let name = match &event {
            ManagerEvent::Created => "manager-created".to_string(),
            ManagerEvent::Changed { old, new } => {
                format!("manager-changed:{}->{}", state_name(old), state_name(new))
            }
            ManagerEvent::Deleted => "manager-deleted".to_string(),
            ManagerEvent::WalletAdded(_) => "manager-wallet-added".to_string(),
            ManagerEvent::WalletChanged(_) => "manager-wallet-changed".to_string(),
            ManagerEvent::WalletDeleted(_) => "manager-wallet-deleted".to_string(),
            ManagerEvent::SyncStarted => "sync-started".to_string(),
            ManagerEvent::SyncContinues { .. } => "sync-continues".to_string(),
            ManagerEvent::SyncStopped { .. } => "sync-stopped".to_string(),
            ManagerEvent::SyncRecommended { .. } => "sync-recommended".to_string(),
            ManagerEvent::BlockHeightUpdated { .. } => "block-height".to_string(),
        };
        self.trace.lock().unwrap().push(name);
    }

    fn wallet_event(&self, _wallet: &WalletRef, event: WalletEvent) {
        let name = match &event {
            WalletEvent::Created => "wallet-created",
            WalletEvent::Changed { .. } => "wallet-changed",
            WalletEvent::Deleted => "wallet-deleted",
            WalletEvent::TransferAdded(_) => "wallet-transfer-added",
            WalletEvent::TransferChanged(_) => "wallet-transfer-changed",
            WalletEvent::TransferSubmitted(_) => "wallet-transfer-submitted",
            WalletEvent::TransferDeleted(_) => "wallet-transfer-deleted",
            WalletEvent::BalanceUpdated(_) => "wallet-balance-updated",
            WalletEvent::FeeBasisUpdated(_) => "wallet-fee-basis-updated",
            WalletEvent::FeeBasisEstimated { .. } => "wallet-fee-basis-estimated",
        };
        self.trace.lock().unwrap().push(name.to_string());
    }

    fn transfer_event(&self, _wallet: &WalletRef, _transfer: &TransferRef, event: TransferEvent) {
        let name = match &event {
            TransferEvent::Created => "transfer-created",
            TransferEvent::Changed { .. } => "transfer-changed",
            TransferEvent::Deleted => "transfer-deleted",
        };
        self.trace.lock().unwrap().push(name.to_string());
    }
}

fn eth_network() -> NetworkRef {
    let eth = Currency::new("ethereum-mainnet:eth", "Ether", "ETH", CURRENCY_KIND_NATIVE, None);
    let wei = Unit::base(eth.clone(), "eth-wei", "Wei", "WEI");
    let ether = Unit::derived(eth.clone(), "eth-eth", "Ether", "ETH", &wei, 18);
    Network::new(
        "ethereum-mainnet",
        "Ethereum",
        NativeNetwork::Ethereum { chain_id: 1 },
        true,
        6,
        0,
        eth.clone(),
        vec![NetworkCurrency {
            currency: eth,
            base_unit: wei.clone(),
            default_unit: ether,
            units: vec![wei],
        }],
        vec![],
    )
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

fn manager_on(
    network: NetworkRef,
    mode: SyncMode,
    scheme: AddressScheme,
) -> (Arc<WalletManager>, Arc<Recorder>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let recorder = Arc::new(Recorder::default());
    let account = Account::create(PAPER_KEY, 1_514_764_800, "lifecycle-uids").unwrap();
    let manager = WalletManager::create(
        recorder.clone(),
        Arc::new(NullClient),
        account,
        network,
        ManagerConfig {
            mode,
            scheme,
            storage_path: std::env::temp_dir().join("walletkit-lifecycle"),
        },
        Arc::new(MemoryFileService::default()),
    )
    .unwrap();
    (manager, recorder)
}

#[test]
fn creation_event_order_contract() {
    let (manager, recorder) = manager_on(eth_network(), SyncMode::ApiOnly, AddressScheme::EthDefault);
    let trace = recorder.wait_for(3);
    assert_eq!(
        &trace[..3],
        &[
            "manager-created".to_string(),
            "wallet-created".to_string(),
            "manager-wallet-added".to_string(),
        ]
    );
    manager.stop();
}

#[test]
fn api_only_connect_disconnect_sequence() {
    let (manager, recorder) = manager_on(eth_network(), SyncMode::ApiOnly, AddressScheme::EthDefault);
    recorder.wait_for(3);

    manager.connect(None);
    manager.disconnect();
    manager.stop();

    let trace = recorder.wait_for(8);
    let expected = [
        "manager-created",
        "wallet-created",
        "manager-wallet-added",
        "manager-changed:created->connected",
        "sync-started",
        "manager-changed:connected->syncing",
        "sync-stopped",
        "manager-changed:syncing->disconnected",
    ];
    assert_eq!(trace, expected.map(String::from).to_vec());
}

#[test]
fn p2p_only_connect_disconnect_sequence() {
    let (manager, recorder) = manager_on(eth_network(), SyncMode::P2pOnly, AddressScheme::EthDefault);
    recorder.wait_for(3);

    manager.connect(None);
    manager.disconnect();
    manager.stop();

    let trace = recorder.wait_for(8);
    let expected = [
        "manager-created",
        "wallet-created",
        "manager-wallet-added",
        "manager-changed:created->connected",
        "sync-started",
        "manager-changed:connected->syncing",
        "sync-stopped",
        "manager-changed:syncing->disconnected",
    ];
    assert_eq!(trace, expected.map(String::from).to_vec());
}

#[test]
fn mode_swap_while_connected_bounces_sync() {
    let (manager, recorder) = manager_on(eth_network(), SyncMode::ApiOnly, AddressScheme::EthDefault);
    recorder.wait_for(3);

    manager.connect(None);
    recorder.wait_for(6);
    manager.set_mode(SyncMode::P2pOnly).unwrap();
    manager.stop();

    let trace = recorder.wait_for(10);
    let expected = [
        "manager-created",
        "wallet-created",
        "manager-wallet-added",
        "manager-changed:created->connected",
        "sync-started",
        "manager-changed:connected->syncing",
        // set_mode: stop the old sync, start a fresh one.
        "sync-stopped",
        "manager-changed:syncing->connected",
        "sync-started",
        "manager-changed:connected->syncing",
    ];
    assert_eq!(trace, expected.map(String::from).to_vec());
}

#[test]
fn repeated_connect_is_a_no_op() {
    let (manager, recorder) = manager_on(eth_network(), SyncMode::ApiOnly, AddressScheme::EthDefault);
    recorder.wait_for(3);

    manager.connect(None);
    let after_first = recorder.wait_for(6).len();
    manager.connect(None);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.trace().len(), after_first);
    manager.stop();
}

#[test]
fn generic_manager_rejects_p2p_modes() {
    let recorder = Arc::new(Recorder::default());
    let account = Account::create(PAPER_KEY, 0, "uids").unwrap();
    let result = WalletManager::create(
        recorder,
        Arc::new(NullClient),
        account,
        xrp_network(),
        ManagerConfig {
            mode: SyncMode::P2pOnly,
            scheme: AddressScheme::GenDefault,
            storage_path: std::env::temp_dir().join("walletkit-lifecycle"),
        },
        Arc::new(MemoryFileService::default()),
    );
    assert!(result.is_err());
}

#[test]
fn generic_lifecycle_runs_api_only() {
    let (manager, recorder) = manager_on(xrp_network(), SyncMode::ApiOnly, AddressScheme::GenDefault);
    recorder.wait_for(3);
    manager.connect(None);
    manager.disconnect();
    manager.stop();
    let trace = recorder.trace();
    assert!(trace.contains(&"sync-started".to_string()));
    assert!(trace.contains(&"manager-changed:syncing->disconnected".to_string()));
}

#[test]
fn concurrent_control_calls_do_not_corrupt() {
    let (manager, recorder) = manager_on(eth_network(), SyncMode::ApiOnly, AddressScheme::EthDefault);
    recorder.wait_for(3);

    let threads: Vec<_> = (0..8)
        .map(|index| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                for _ in 0..20 {
                    match index % 4 {
                        0 => manager.connect(None),
                        1 => manager.disconnect(),
                        2 => manager.sync(),
                        _ => {
                            let _ = manager.set_mode(if index % 2 == 0 {
                                SyncMode::ApiOnly
                            } else {
                                SyncMode::P2pOnly
                            });
                        }
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    manager.stop();

    // After stop, the trace must still begin with the creation contract and
    // contain only well-formed transitions.
    let trace = recorder.trace();
    assert_eq!(
        &trace[..3],
        &[
            "manager-created".to_string(),
            "wallet-created".to_string(),
            "manager-wallet-added".to_string(),
        ]
    );
    for event in &trace {
        if let Some(transition) = event.strip_prefix("manager-changed:") {
            let (old, new) = transition.split_once("->").unwrap();
            assert_ne!(old, new, "self-transition in trace");
        }
    }
}

#[test]
fn sync_to_depth_recommends_then_syncs() {
    let (manager, recorder) = manager_on(eth_network(), SyncMode::ApiOnly, AddressScheme::EthDefault);
    recorder.wait_for(3);
    manager.connect(None);
    recorder.wait_for(6);
    manager.sync_to_depth(500);
    manager.stop();
    let trace = recorder.trace();
    let recommended = trace
        .iter()
        .position(|event| event == "sync-recommended")
        .expect("recommendation missing");
    assert!(trace[recommended..].contains(&"sync-started".to_string()));
}
