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

//! The N-ary search sync.
//!
//! A large block range is probed at up to 191 evenly spaced boundary headers;
//! the account state is fetched at each boundary, and only sub-ranges where
//! consecutive states differ are recursed into. A linear tail of the last 191
//! blocks is always walked header-by-header so the tip is fully validated.
//! Rounds are O(log(range) / log(count)).
//!
//! Nodes form an explicit tree held in an arena; every node advances only
//! when a provision result for it arrives.

use crate::block::{AccountState, BlockHeader};
use crate::provision::ProvisionRequest;
use alloy_primitives::Address as EthAddress;
use log::debug;
use walletkit_primitives::BlockHash;

/// LES caps a headers request at 192; one boundary is shared, so ranges are
/// built from at most 191 new headers.
pub const SYNC_LINEAR_REQUEST_MAXIMUM: u64 = 191;
/// Ranges up to ten linear requests are walked linearly without probing.
pub const SYNC_LINEAR_LIMIT: u64 = 10 * SYNC_LINEAR_REQUEST_MAXIMUM;
/// Sub-ranges discovered inside an N-ary node go linear sooner.
pub const SYNC_LINEAR_LIMIT_IF_N_ARY: u64 = 100;
pub const SYNC_N_ARY_REQUEST_MINIMUM: u64 = 100;
pub const SYNC_N_ARY_REQUEST_MAXIMUM: u64 = 191;

/// The `step` and `count` that best tile `blocks`: the highest count in
/// `[minimum, maximum)` with the smallest remainder.
pub fn compute_optimal_step(blocks: u64) -> (u64, u64) {
    let mut optimal_count = 0;
    let mut optimal_remainder = u64::MAX;
    for count in SYNC_N_ARY_REQUEST_MINIMUM..SYNC_N_ARY_REQUEST_MAXIMUM {
        let remainder = blocks % count;
        if remainder <= optimal_remainder {
            optimal_remainder = remainder;
            optimal_count = count;
        }
    }
    (blocks / optimal_count, optimal_count)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeKind {
    /// One headers request; a leaf.
    LinearSmall,
    /// Consecutive LinearSmall children.
    LinearLarge,
    /// Probe boundaries, recurse into account-state deltas.
    Nary,
    /// An Nary body plus a LinearSmall tail validating the tip.
    Mixed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum NodeState {
    Idle,
    AwaitHeaders,
    AwaitAccounts,
    Dispatching { child: usize },
    Complete,
}

#[derive(Debug)]
struct SyncNode {
    kind: NodeKind,
    tail: u64,
    head: u64,
    parent: Option<usize>,
    children: Vec<usize>,
    state: NodeState,
    /// Boundary headers, for an Nary node awaiting account states.
    boundaries: Vec<BlockHeader>,
}

impl SyncNode {
    fn blocks(&self) -> u64 {
        self.head - self.tail
    }
}

/// What the owner must do after feeding the sync an input.
#[derive(Debug)]
pub enum SyncEffect {
    /// Issue this request; route its result back with `node`.
    Issue { node: usize, request: ProvisionRequest },
    /// Linear headers to offer to the chain.
    Chain { headers: Vec<BlockHeader> },
    Progress { percent: f32 },
    /// The whole range is synced.
    Done,
    /// The sync failed and stopped.
    Failed,
}

/// One full sync over `[tail, head]` for one address.
#[derive(Debug)]
pub struct Sync {
    address: EthAddress,
    nodes: Vec<SyncNode>,
    root: usize,
    completed_blocks: u64,
    total_blocks: u64,
    finished: bool,
}

impl Sync {
    pub fn new(address: EthAddress, tail: u64, head: u64) -> (Self, Vec<SyncEffect>) {
        assert!(head > tail, "sync range must not be empty");
        let mut sync = Self {
            address,
            nodes: Vec::new(),
            root: 0,
            completed_blocks: 0,
            total_blocks: head - tail,
            finished: false,
        };
        let root = sync.build(tail, head, SYNC_LINEAR_LIMIT, None);
        sync.root = root;
        let mut effects = Vec::new();
        sync.activate(root, &mut effects);
        (sync, effects)
    }

    pub fn is_active(&self) -> bool {
        !self.finished
    }

    pub fn percent(&self) -> f32 {
        if self.total_blocks == 0 {
            100.0
        } else {
            100.0 * self.completed_blocks as f32 / self.total_blocks as f32
        }
    }

    /// Creates the node for `[tail, head]`, splitting per the linear limit.
    fn build(&mut self, tail: u64, head: u64, linear_limit: u64, parent: Option<usize>) -> usize {
        let total = head - tail;
        let index = self.nodes.len();
        let kind = if total <= SYNC_LINEAR_REQUEST_MAXIMUM {
            NodeKind::LinearSmall
        } else if total <= linear_limit {
            NodeKind::LinearLarge
        } else {
            NodeKind::Mixed
        };
        self.nodes.push(SyncNode {
            kind,
            tail,
            head,
            parent,
            children: Vec::new(),
            state: NodeState::Idle,
            boundaries: Vec::new(),
        });

        match kind {
            NodeKind::LinearSmall => {}
            NodeKind::LinearLarge => {
                let mut cursor = tail;
                while cursor < head {
                    let next = (cursor + SYNC_LINEAR_REQUEST_MAXIMUM).min(head);
                    let child = self.build(cursor, next, 0, Some(index));
                    self.nodes[index].children.push(child);
                    cursor = next;
                }
            }
            NodeKind::Mixed => {
                // The linear tail validates the last blocks header-by-header;
                // the body above it is probed, unless it came out small.
                let split = head - SYNC_LINEAR_REQUEST_MAXIMUM;
                let body = if split - tail <= SYNC_LINEAR_REQUEST_MAXIMUM {
                    self.build(tail, split, 0, Some(index))
                } else {
                    let nary = self.nodes.len();
                    self.nodes.push(SyncNode {
                        kind: NodeKind::Nary,
                        tail,
                        head: split,
                        parent: Some(index),
                        children: Vec::new(),
                        state: NodeState::Idle,
                        boundaries: Vec::new(),
                    });
                    nary
                };
                let linear = self.build(split, head, 0, Some(index));
                let node = &mut self.nodes[index];
                node.children.push(body);
                node.children.push(linear);
            }
            NodeKind::Nary => unreachable!("Nary nodes are built inline"),
        }
        index
    }

    fn activate(&mut self, index: usize, effects: &mut Vec<SyncEffect>) {
        match self.nodes[index].kind {
            NodeKind::LinearSmall => {
                let node = &mut self.nodes[index];
                node.state = NodeState::AwaitHeaders;
                effects.push(SyncEffect::Issue {
                    node: index,
                    request: ProvisionRequest::Headers {
                        start: node.tail,
                        skip: 0,
                        count: node.blocks() + 1,
                    },
                });
            }
            NodeKind::Nary => {
                let node = &mut self.nodes[index];
                let (step, count) = compute_optimal_step(node.blocks());
                node.state = NodeState::AwaitHeaders;
                debug!(
                    "nary probe [{}, {}] step {} count {}",
                    node.tail, node.head, step, count
                );
                effects.push(SyncEffect::Issue {
                    node: index,
                    request: ProvisionRequest::Headers {
                        start: node.tail,
                        skip: step - 1,
                        count: count + 1,
                    },
                });
            }
            NodeKind::LinearLarge | NodeKind::Mixed => {
                self.nodes[index].state = NodeState::Dispatching { child: 0 };
                let child = self.nodes[index].children[0];
                self.activate(child, effects);
            }
        }
    }

    /// Marks `index` complete and moves on: the parent dispatches its next
    /// child, or completes itself.
    fn complete(&mut self, index: usize, effects: &mut Vec<SyncEffect>) {
        self.nodes[index].state = NodeState::Complete;
        if self.nodes[index].children.is_empty() {
            self.completed_blocks += self.nodes[index].blocks();
            effects.push(SyncEffect::Progress {
                percent: self.percent(),
            });
        }
        match self.nodes[index].parent {
            None => {
                self.finished = true;
                effects.push(SyncEffect::Done);
            }
            Some(parent) => {
                let next = self.nodes[parent]
                    .children
                    .iter()
                    .position(|child| self.nodes[*child].state != NodeState::Complete);
                match next {
                    Some(position) => {
                        let child = self.nodes[parent].children[position];
                        self.nodes[parent].state = NodeState::Dispatching { child: position };
                        self.activate(child, effects);
                    }
                    None => self.complete(parent, effects),
                }
            }
        }
    }

    /// Routes a headers result to its node.
    pub fn handle_headers(&mut self, index: usize, headers: Vec<BlockHeader>) -> Vec<SyncEffect> {
        let mut effects = Vec::new();
        if self.finished || self.nodes[index].state != NodeState::AwaitHeaders {
            return effects;
        }
        match self.nodes[index].kind {
            NodeKind::LinearSmall => {
                effects.push(SyncEffect::Chain { headers });
                self.complete(index, &mut effects);
            }
            NodeKind::Nary => {
                let blocks: Vec<(BlockHash, u64)> = headers
                    .iter()
                    .map(|header| (header.hash, header.number))
                    .collect();
                let node = &mut self.nodes[index];
                node.boundaries = headers;
                node.state = NodeState::AwaitAccounts;
                effects.push(SyncEffect::Issue {
                    node: index,
                    request: ProvisionRequest::Accounts {
                        address: self.address,
                        blocks,
                    },
                });
            }
            _ => {}
        }
        effects
    }

    /// Routes an accounts result to its Nary node: sub-ranges where
    /// consecutive boundary states differ become children and are synced in
    /// turn.
    pub fn handle_accounts(
        &mut self,
        index: usize,
        mut accounts: Vec<(BlockHash, u64, AccountState)>,
    ) -> Vec<SyncEffect> {
        let mut effects = Vec::new();
        if self.finished || self.nodes[index].state != NodeState::AwaitAccounts {
            return effects;
        }
        accounts.sort_by_key(|(_, number, _)| *number);

        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for pair in accounts.windows(2) {
            let (_, low, ref a) = pair[0];
            let (_, high, ref b) = pair[1];
            if a != b {
                ranges.push((low, high));
            }
        }
        // The probe tiling may leave a remainder below the node's head; it is
        // small and cheap, walk it unconditionally.
        let head = self.nodes[index].head;
        if let Some((_, last, _)) = accounts.last() {
            if *last < head {
                ranges.push((*last, head));
            }
        }

        debug!(
            "nary [{}, {}]: {} sub-ranges of interest",
            self.nodes[index].tail, head, ranges.len()
        );

        for (tail, range_head) in ranges {
            let child = self.build(tail, range_head, SYNC_LINEAR_LIMIT_IF_N_ARY, Some(index));
            self.nodes[index].children.push(child);
        }

        if self.nodes[index].children.is_empty() {
            self.complete(index, &mut effects);
        } else {
            self.nodes[index].state = NodeState::Dispatching { child: 0 };
            let child = self.nodes[index].children[0];
            self.activate(child, &mut effects);
        }
        effects
    }

    /// A non-recoverable provision failure stops the whole sync.
    pub fn handle_failure(&mut self, index: usize) -> Vec<SyncEffect> {
        debug!("sync failed at node {index}");
        self.finished = true;
        vec![SyncEffect::Failed]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bloom, U256};

    fn header(number: u64) -> BlockHeader {
        let mut hash = [0u8; 32];
        hash[24..].copy_from_slice(&number.to_be_bytes());
        BlockHeader {
            hash: BlockHash::from(hash),
            parent_hash: if number == 0 {
                BlockHash::ZERO
            } else {
                let mut parent = [0u8; 32];
                parent[24..].copy_from_slice(&(number - 1).to_be_bytes());
                BlockHash::from(parent)
            },
            number,
            timestamp: number * 15,
            total_difficulty: U256::from(number),
            logs_bloom: Bloom::ZERO,
        }
    }

    /// Account state changed exactly once, at `change`.
    fn account_at(number: u64, change: u64) -> AccountState {
        AccountState {
            nonce: u64::from(number >= change),
            balance: U256::ZERO,
        }
    }

    #[test]
    fn optimal_step_tiles_exactly_when_possible() {
        // 15000 = 150 * 100: remainder 0 at count 150, and count scanning
        // prefers the highest zero-remainder count.
        let (step, count) = compute_optimal_step(15000);
        assert_eq!(step * count, 15000);
        assert!((SYNC_N_ARY_REQUEST_MINIMUM..SYNC_N_ARY_REQUEST_MAXIMUM).contains(&count));
    }

    #[test]
    fn small_range_is_one_linear_request() {
        let (_, effects) = Sync::new(EthAddress::ZERO, 100, 200);
        match &effects[..] {
            [SyncEffect::Issue {
                request: ProvisionRequest::Headers { start, skip, count },
                ..
            }] => {
                assert_eq!((*start, *skip, *count), (100, 0, 101));
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }

    #[test]
    fn moderate_range_splits_into_small_linears() {
        let (mut sync, mut effects) = Sync::new(EthAddress::ZERO, 0, 500);
        let mut requests = 0;
        while let Some(effect) = effects.pop() {
            if let SyncEffect::Issue {
                node,
                request: ProvisionRequest::Headers { start, count, skip },
            } = effect
            {
                assert_eq!(skip, 0);
                assert!(count <= SYNC_LINEAR_REQUEST_MAXIMUM + 1);
                requests += 1;
                let headers = (start..start + count).map(header).collect();
                effects.extend(sync.handle_headers(node, headers));
            }
        }
        assert_eq!(requests, 3); // 500 = 191 + 191 + 118
        assert!(!sync.is_active());
    }

    #[test]
    fn nary_finds_single_change_in_log_rounds() {
        let change = 43_217u64;
        let head = 100_000u64;
        let address = EthAddress::ZERO;
        let (mut sync, mut pending) = Sync::new(address, 0, head);

        let mut chained: Vec<BlockHeader> = Vec::new();
        let mut rounds = 0;
        while sync.is_active() {
            let Some(effect) = pending.pop() else { break };
            match effect {
                SyncEffect::Issue {
                    node,
                    request: ProvisionRequest::Headers { start, skip, count },
                } => {
                    rounds += 1;
                    let headers = (0..count).map(|i| header(start + i * (skip + 1))).collect();
                    pending.extend(sync.handle_headers(node, headers));
                }
                SyncEffect::Issue {
                    node,
                    request: ProvisionRequest::Accounts { blocks, .. },
                } => {
                    let accounts = blocks
                        .into_iter()
                        .map(|(hash, number)| (hash, number, account_at(number, change)))
                        .collect();
                    pending.extend(sync.handle_accounts(node, accounts));
                }
                SyncEffect::Chain { headers } => chained.extend(headers),
                SyncEffect::Progress { .. } | SyncEffect::Done => {}
                SyncEffect::Failed => panic!("sync failed"),
                SyncEffect::Issue { .. } => {}
            }
        }

        assert!(!sync.is_active());
        // The change block was discovered and walked linearly.
        assert!(
            chained.iter().any(|h| h.number == change),
            "change block not chained"
        );
        // O(log N) rounds, not O(N): a linear walk would need > 500 requests.
        assert!(rounds < 40, "took {rounds} rounds");
    }

    #[test]
    fn unchanged_range_completes_without_recursion() {
        let head = 50_000u64;
        let (mut sync, mut pending) = Sync::new(EthAddress::ZERO, 0, head);
        let mut chained = 0usize;
        while sync.is_active() {
            let Some(effect) = pending.pop() else { break };
            match effect {
                SyncEffect::Issue {
                    node,
                    request: ProvisionRequest::Headers { start, skip, count },
                } => {
                    let headers = (0..count).map(|i| header(start + i * (skip + 1))).collect();
                    pending.extend(sync.handle_headers(node, headers));
                }
                SyncEffect::Issue {
                    node,
                    request: ProvisionRequest::Accounts { blocks, .. },
                } => {
                    let accounts = blocks
                        .into_iter()
                        .map(|(hash, number)| (hash, number, AccountState::default()))
                        .collect();
                    pending.extend(sync.handle_accounts(node, accounts));
                }
                SyncEffect::Chain { headers } => chained += headers.len(),
                _ => {}
            }
        }
        assert!(!sync.is_active());
        // Only the linear tail (and tiling remainders) walked linearly.
        assert!(chained > 0 && chained < 1000, "chained {chained}");
    }

    #[test]
    fn failure_stops_the_sync() {
        let (mut sync, effects) = Sync::new(EthAddress::ZERO, 0, 100_000);
        let node = match effects.first() {
            Some(SyncEffect::Issue { node, .. }) => *node,
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(
            sync.handle_failure(node).as_slice(),
            [SyncEffect::Failed]
        ));
        assert!(!sync.is_active());
    }
}
