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

//! The persistence façade: a keyed blob store the embedder supplies, under
//! which the core files blocks, peers, transactions, and transfers by type.

use std::collections::HashMap;
use std::sync::Mutex;

/// Blob type names used by the core.
pub mod entity {
    pub const BLOCK: &str = "block";
    pub const PEER: &str = "peer";
    pub const TRANSACTION: &str = "transaction";
    pub const LOG: &str = "log";
    pub const TRANSFER: &str = "transfer";
}

/// The embedder's keyed blob store. Keys are chain-specific hashes rendered
/// as strings; blobs are opaque to the store.
pub trait FileService: Send + Sync {
    fn save(&self, entity: &str, key: &str, blob: &[u8]);
    fn remove(&self, entity: &str, key: &str);
    fn load_all(&self, entity: &str) -> Vec<(String, Vec<u8>)>;
}

/// Discards everything and loads nothing.
#[derive(Debug, Default)]
pub struct NullFileService;

impl FileService for NullFileService {
    fn save(&self, _entity: &str, _key: &str, _blob: &[u8]) {}
    fn remove(&self, _entity: &str, _key: &str) {}
    fn load_all(&self, _entity: &str) -> Vec<(String, Vec<u8>)> {
        Vec::new()
    }
}

/// In-memory store, for tests and ephemeral managers.
#[derive(Debug, Default)]
pub struct MemoryFileService {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl FileService for MemoryFileService {
    fn save(&self, entity: &str, key: &str, blob: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert((entity.to_string(), key.to_string()), blob.to_vec());
    }

    fn remove(&self, entity: &str, key: &str) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(entity.to_string(), key.to_string()));
    }

    fn load_all(&self, entity: &str) -> Vec<(String, Vec<u8>)> {
        let mut loaded: Vec<(String, Vec<u8>)> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|((e, _), _)| e == entity)
            .map(|((_, key), blob)| (key.clone(), blob.clone()))
            .collect();
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrips() {
        let store = MemoryFileService::default();
        store.save(entity::TRANSFER, "abc", b"one");
        store.save(entity::TRANSFER, "def", b"two");
        store.save(entity::BLOCK, "abc", b"other-entity");

        let loaded = store.load_all(entity::TRANSFER);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], ("abc".to_string(), b"one".to_vec()));

        store.remove(entity::TRANSFER, "abc");
        assert_eq!(store.load_all(entity::TRANSFER).len(), 1);
    }
}
