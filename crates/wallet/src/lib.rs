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

//! Multi-currency wallet core.
//!
//! One polymorphic API over three chain families: Bitcoin-style UTXO chains,
//! the Ethereum account-and-token model, and pluggable generic account chains
//! registered through the [handlers] table. The embedder constructs an
//! [account::Account] from a paper key, a [network::Network] describing the
//! target chain, and a [client::Client] supplying asynchronous I/O, then binds
//! them in a [manager::WalletManager] whose listener receives every state
//! change in creation order.

pub mod account;
pub mod address;
pub mod amount;
pub mod chains;
pub mod client;
pub mod currency;
pub mod events;
pub mod feebasis;
pub mod handlers;
pub mod manager;
pub mod network;
pub mod storage;
pub mod transfer;
pub mod unit;
pub mod wallet;

pub use account::Account;
pub use address::Address;
pub use amount::Amount;
pub use currency::Currency;
pub use feebasis::FeeBasis;
pub use manager::WalletManager;
pub use network::Network;
pub use transfer::{Transfer, TransferDirection, TransferState};
pub use unit::Unit;
pub use wallet::Wallet;
