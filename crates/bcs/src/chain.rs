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

//! The block-chain view: the chained path from `tail` to `head` plus the
//! orphan set, and every mutation that keeps them consistent.

use crate::block::Block;
use log::debug;
use std::collections::{HashMap, HashSet};
use walletkit_primitives::BlockHash;

/// Complete orphans older than `head - BCS_ORPHAN_AGE_OFFSET` are purged.
pub const BCS_ORPHAN_AGE_OFFSET: u64 = 10;

/// What happened when a block was offered to the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extension {
    /// The block extended the head (possibly chaining orphans behind it).
    Extended,
    /// The block re-rooted below the head; the blocks above its parent were
    /// orphaned.
    Reorganized { orphaned: Vec<BlockHash> },
    /// The block's parent is unknown or orphaned; the block joined the
    /// orphan set. The payload is the lowest orphan number, the point a
    /// recovery sync should reach back to.
    Orphaned { sync_back_to: u64 },
    /// Already known; nothing changed.
    Duplicate,
}

/// The chain/orphans state over the set of all known blocks.
#[derive(Debug, Default)]
pub struct ChainState {
    blocks: HashMap<BlockHash, Block>,
    orphans: HashSet<BlockHash>,
    head: Option<BlockHash>,
    tail: Option<BlockHash>,
}

impl ChainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<&Block> {
        self.head.and_then(|hash| self.blocks.get(&hash))
    }

    pub fn tail(&self) -> Option<&Block> {
        self.tail.and_then(|hash| self.blocks.get(&hash))
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn get_mut(&mut self, hash: &BlockHash) -> Option<&mut Block> {
        self.blocks.get_mut(hash)
    }

    pub fn orphans(&self) -> impl Iterator<Item = &Block> {
        self.orphans.iter().filter_map(|hash| self.blocks.get(hash))
    }

    pub fn is_orphan(&self, hash: &BlockHash) -> bool {
        self.orphans.contains(hash)
    }

    /// True when `hash` lies on the path from head back to tail.
    pub fn is_chained(&self, hash: &BlockHash) -> bool {
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == *hash {
                return true;
            }
            if Some(current) == self.tail {
                break;
            }
            cursor = self
                .blocks
                .get(&current)
                .map(|block| block.header.parent_hash);
        }
        false
    }

    /// Blocks on the chain path, head first.
    pub fn chained(&self) -> Vec<BlockHash> {
        let mut path = Vec::new();
        let mut cursor = self.head;
        while let Some(current) = cursor {
            path.push(current);
            if Some(current) == self.tail {
                break;
            }
            cursor = self
                .blocks
                .get(&current)
                .map(|block| block.header.parent_hash);
        }
        path
    }

    fn lowest_orphan_number(&self) -> u64 {
        self.orphans()
            .map(|block| block.header.number)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Prefer the higher total difficulty; break ties with the earlier
    /// timestamp.
    fn preferred<'a>(a: &'a Block, b: &'a Block) -> &'a Block {
        if a.header.total_difficulty > b.header.total_difficulty {
            a
        } else if a.header.total_difficulty < b.header.total_difficulty {
            b
        } else if a.header.timestamp <= b.header.timestamp {
            a
        } else {
            b
        }
    }

    fn set_head(&mut self, hash: BlockHash) {
        if let Some(previous) = self.head {
            if let Some(block) = self.blocks.get_mut(&previous) {
                block.next = Some(hash);
            }
        }
        self.head = Some(hash);
        if self.tail.is_none() {
            self.tail = Some(hash);
        }
    }

    /// Chains every orphan whose parent is the current head, repeatedly,
    /// preferring difficulty then timestamp among competing children.
    fn chain_orphans(&mut self) {
        loop {
            let Some(head) = self.head else { return };
            let candidate = self
                .orphans
                .iter()
                .filter_map(|hash| self.blocks.get(hash))
                .filter(|block| block.header.parent_hash == head)
                .fold(None::<&Block>, |best, block| {
                    Some(match best {
                        None => block,
                        Some(best) => Self::preferred(best, block),
                    })
                })
                .map(|block| block.header.hash);

            match candidate {
                Some(hash) => {
                    self.orphans.remove(&hash);
                    self.set_head(hash);
                    debug!("block {} chained from orphans", hash);
                }
                None => return,
            }
        }
    }

    /// Drops complete orphans too old to ever chain.
    fn purge_orphans(&mut self) {
        let Some(head) = self.head() else { return };
        let head_number = head.header.number;
        if head_number <= BCS_ORPHAN_AGE_OFFSET {
            return;
        }
        let cutoff = head_number - BCS_ORPHAN_AGE_OFFSET;
        let purgeable: Vec<BlockHash> = self
            .orphans()
            .filter(|block| block.header.number < cutoff && block.is_complete())
            .map(|block| block.header.hash)
            .collect();
        for hash in purgeable {
            self.orphans.remove(&hash);
            self.blocks.remove(&hash);
            debug!("block {} purged as orphan", hash);
        }
    }

    fn make_orphan(&mut self, hash: BlockHash) {
        if let Some(block) = self.blocks.get_mut(&hash) {
            block.next = None;
        }
        self.orphans.insert(hash);
        debug!("block {} newly orphaned", hash);
    }

    /// Offers a new block. Implements the three extension cases: adopt when
    /// there is no chain, orphan when the parent is missing or orphaned,
    /// re-root when the parent is deeper in the chain.
    pub fn extend(&mut self, block: Block) -> Extension {
        let hash = block.header.hash;
        let parent_hash = block.header.parent_hash;
        if self.blocks.contains_key(&hash) {
            return Extension::Duplicate;
        }
        self.blocks.insert(hash, block);

        // No chain yet: adopt unconditionally.
        let Some(head) = self.head else {
            self.set_head(hash);
            self.chain_orphans();
            self.purge_orphans();
            return Extension::Extended;
        };

        let parent_known = self.blocks.contains_key(&parent_hash);
        if !parent_known || self.orphans.contains(&parent_hash) {
            self.chain_orphans();
            self.make_orphan(hash);
            let sync_back_to = self.lowest_orphan_number();
            return Extension::Orphaned { sync_back_to };
        }

        if parent_hash == head {
            self.set_head(hash);
            self.chain_orphans();
            self.purge_orphans();
            return Extension::Extended;
        }

        // Parent is deeper in the chain: everything above it becomes an
        // orphan, then the new block takes over as head.
        let mut orphaned = Vec::new();
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == parent_hash {
                break;
            }
            cursor = self
                .blocks
                .get(&current)
                .map(|block| block.header.parent_hash);
            self.make_orphan(current);
            orphaned.push(current);
        }
        // A parent below the tail drags the tail along with it.
        if self
            .tail
            .map(|tail| self.orphans.contains(&tail))
            .unwrap_or(false)
        {
            self.tail = Some(parent_hash);
        }
        self.head = Some(parent_hash);
        self.set_head(hash);
        self.chain_orphans();
        self.purge_orphans();
        Extension::Reorganized { orphaned }
    }

    /// Unwinds `depth` blocks off the head, orphaning each; used when a peer
    /// announces a reorg. Returns the orphaned hashes, newest first.
    pub fn unwind(&mut self, depth: u64) -> Vec<BlockHash> {
        let mut orphaned = Vec::new();
        for _ in 0..depth {
            let Some(head) = self.head else { break };
            if Some(head) == self.tail {
                break;
            }
            let parent = match self.blocks.get(&head) {
                Some(block) => block.header.parent_hash,
                None => break,
            };
            self.make_orphan(head);
            orphaned.push(head);
            if let Some(block) = self.blocks.get_mut(&parent) {
                block.next = None;
            }
            self.head = Some(parent);
        }
        orphaned
    }

    /// Adopts `block` as a fresh single-block chain, discarding the chained
    /// path; used when a sync restarts the view from a higher block. The old
    /// chained blocks are returned for archival.
    pub fn adopt(&mut self, block: Block) -> Vec<Block> {
        let old_path = self.chained();
        let mut reclaimed: Vec<Block> = old_path
            .into_iter()
            .filter_map(|hash| self.blocks.remove(&hash))
            .collect();
        reclaimed.reverse();
        let hash = block.header.hash;
        self.blocks.insert(hash, block);
        self.head = Some(hash);
        self.tail = Some(hash);
        self.chain_orphans();
        self.purge_orphans();
        reclaimed
    }

    /// Clips `keep` blocks off the tail end for archival, relinking the tail.
    /// Returns the reclaimed blocks, oldest first.
    pub fn reclaim_tail(&mut self, keep: u64) -> Vec<Block> {
        let path = self.chained();
        if keep == 0 || path.len() as u64 <= keep {
            return Vec::new();
        }
        let reclaim: Vec<BlockHash> = path[(keep as usize)..].to_vec();
        let new_tail = path[(keep as usize) - 1];
        self.tail = Some(new_tail);
        let mut reclaimed: Vec<Block> = reclaim
            .into_iter()
            .filter_map(|hash| self.blocks.remove(&hash))
            .collect();
        reclaimed.reverse();
        reclaimed
    }

    /// Count of blocks on the chained path.
    pub fn chain_length(&self) -> u64 {
        self.chained().len() as u64
    }

    /// Structural invariant: the tail is reachable from the head, and every
    /// orphan is known but off that path. Exercised by tests.
    pub fn check_invariant(&self) -> bool {
        if let (Some(_), Some(tail)) = (self.head, self.tail) {
            let path = self.chained();
            if path.last() != Some(&tail) {
                return false;
            }
            for orphan in &self.orphans {
                if !self.blocks.contains_key(orphan) || path.contains(orphan) {
                    return false;
                }
            }
        }
        true
    }
}
