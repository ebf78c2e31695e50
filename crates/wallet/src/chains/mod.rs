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

//! The three chain families: Bitcoin-style UTXO chains, the Ethereum
//! account-and-token model, and generic account chains behind the handler
//! registry (with XRP as the built-in instance).

pub mod btc;
pub mod eth;
pub mod gen;
pub mod xrp;
