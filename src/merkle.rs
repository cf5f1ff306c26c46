//! Merkle commitment over account balances.
//!
//! Leaves are `H(0x00 || len(account) || account || balance)` in account
//! order, internal nodes `H(0x01 || left || right)`. A trailing odd node is
//! paired with the zero hash. The root of an empty ledger is the zero hash.

use crate::decimal::Decimal;
use crate::types::Balances;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const HASH_SIZE: usize = 32;
pub type Hash = [u8; HASH_SIZE];

const LEAF_PREFIX: u8 = 0x00;
const INTERNAL_PREFIX: u8 = 0x01;
const ZERO_HASH: Hash = [0u8; HASH_SIZE];

pub fn hash_leaf(account: &str, balance: &Decimal) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update((account.len() as u64).to_be_bytes());
    hasher.update(account.as_bytes());
    hasher.update(balance.normalize().to_string().as_bytes());
    hasher.finalize().into()
}

pub fn hash_internal(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([INTERNAL_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn leaves(balances: &Balances) -> Vec<Hash> {
    balances
        .iter()
        .map(|(account, balance)| hash_leaf(account, balance))
        .collect()
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_internal(left, right),
            [single] => hash_internal(single, &ZERO_HASH),
            _ => ZERO_HASH,
        })
        .collect()
}

/// Root over `balances`.
pub fn merkle_root(balances: &Balances) -> Hash {
    let mut level = leaves(balances);
    if level.is_empty() {
        return ZERO_HASH;
    }
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

pub fn merkle_root_hex(balances: &Balances) -> String {
    hex::encode(merkle_root(balances))
}

/// One sibling on the path from a leaf to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub sibling_on_left: bool,
}

/// Inclusion proof for one account balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub account: String,
    pub balance: Decimal,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Build the proof for `account`, or `None` if the account has no leaf.
    pub fn build(balances: &Balances, account: &str) -> Option<Self> {
        let mut index = balances.keys().position(|k| k == account)?;
        let balance = balances.get(account).copied()?;
        let mut level = leaves(balances);
        let mut path = Vec::new();
        while level.len() > 1 {
            let sibling_index = index ^ 1;
            let sibling = level.get(sibling_index).copied().unwrap_or(ZERO_HASH);
            path.push(ProofStep {
                sibling: hex::encode(sibling),
                sibling_on_left: sibling_index < index,
            });
            level = next_level(&level);
            index /= 2;
        }
        Some(Self {
            account: account.to_string(),
            balance,
            path,
        })
    }

    /// Whether this proof folds up to `root_hex`.
    pub fn verify(&self, root_hex: &str) -> bool {
        let mut current = hash_leaf(&self.account, &self.balance);
        for step in &self.path {
            let Some(sibling) = decode_hash(&step.sibling) else {
                return false;
            };
            current = if step.sibling_on_left {
                hash_internal(&sibling, &current)
            } else {
                hash_internal(&current, &sibling)
            };
        }
        hex::encode(current) == root_hex
    }
}

fn decode_hash(text: &str) -> Option<Hash> {
    hex::decode(text).ok()?.try_into().ok()
}
