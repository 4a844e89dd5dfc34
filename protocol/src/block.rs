//! Blocks: the unit of chain extension.
//!
//! A block commits to its parent, a height, a nonce, a reward output
//! and an ordered transaction list. Its identity is the MD5 of a fixed
//! byte layout — parent hash, then height, nonce, reward destination
//! (length-prefixed) and reward amount as big-endian 64-bit integers,
//! then the MD5 of the canonically encoded transaction list. A block is
//! mineable because the nonce participates in that digest.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::config::{GENESIS_NONCE, MAX_BLOCK_REWARD, MAX_TRANSACTIONS_PER_BLOCK};
use crate::crypto::address::Address;
use crate::crypto::hash::Hash;
use crate::error::ValidationError;
use crate::transaction::{SignedTx, TxOutput};

/// One block of the chain. `hash` is computed, never transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "PreviousHash")]
    pub previous_hash: Hash,
    #[serde(rename = "Height")]
    pub height: i64,
    #[serde(rename = "Nonce")]
    pub nonce: i64,
    #[serde(rename = "RewardOutput")]
    pub reward_output: TxOutput,
    #[serde(rename = "Transactions")]
    pub transactions: Vec<SignedTx>,
    #[serde(skip)]
    pub hash: Hash,
}

impl Block {
    /// The hard-coded first block: no parent, height zero, no reward,
    /// no transactions.
    pub fn genesis() -> Block {
        let mut b = Block {
            previous_hash: Hash::EMPTY,
            height: 0,
            nonce: GENESIS_NONCE,
            reward_output: TxOutput::default(),
            transactions: Vec::new(),
            hash: Hash::EMPTY,
        };
        b.update_hash()
            .expect("genesis block encoding cannot fail");
        b
    }

    /// Builds a candidate extending `previous` with the given nonce,
    /// reward destination and transactions.
    pub fn new(
        previous: &Block,
        nonce: i64,
        reward_address: Address,
        block_reward: i64,
        transactions: Vec<SignedTx>,
    ) -> Result<Block, serde_json::Error> {
        let mut b = Block {
            previous_hash: previous.hash,
            height: previous.height + 1,
            nonce,
            reward_output: TxOutput {
                destination: reward_address,
                amount: block_reward,
            },
            transactions,
            hash: Hash::EMPTY,
        };
        b.update_hash()?;
        Ok(b)
    }

    /// Decodes from canonical JSON and recomputes all hashes.
    pub fn decode(raw: &[u8]) -> Result<Block, serde_json::Error> {
        let mut b: Block = serde_json::from_slice(raw)?;
        b.update_hash()?;
        Ok(b)
    }

    /// Recomputes this block's hash and every contained transaction's.
    pub fn update_hash(&mut self) -> Result<(), serde_json::Error> {
        let raw = serde_json::to_vec(&self.transactions)?;
        let tx_list_hash = Hash::digest(&raw);

        let mut h = Md5::new();
        h.update(self.previous_hash.as_bytes());
        h.update(self.height.to_be_bytes());
        h.update(self.nonce.to_be_bytes());
        h.update((self.reward_output.destination.len() as i64).to_be_bytes());
        h.update(self.reward_output.destination.as_bytes());
        h.update(self.reward_output.amount.to_be_bytes());
        h.update(tx_list_hash.as_bytes());
        self.hash = Hash(h.finalize().into());

        for stx in &mut self.transactions {
            stx.update_hash()?;
        }
        Ok(())
    }

    /// Structural validation against the parent block: linkage, height,
    /// proof-of-work, reward bounds, transaction count, and every
    /// transaction's standalone rules. Economic rules (balances,
    /// replays) live in the store, which owns the state they need.
    pub fn valid(&self, previous: &Block) -> Result<(), ValidationError> {
        if self.previous_hash != previous.hash {
            return Err(ValidationError::PreviousHashMismatch {
                expected: previous.hash,
                got: self.previous_hash,
            });
        }

        if self.height != previous.height + 1 {
            return Err(ValidationError::BadHeight {
                expected: previous.height + 1,
                got: self.height,
            });
        }

        if !self.hash.meets_difficulty() {
            return Err(ValidationError::BadPow);
        }

        if self.reward_output.amount < 0 || self.reward_output.amount > MAX_BLOCK_REWARD {
            return Err(ValidationError::RewardOutOfRange);
        }

        if self.transactions.len() > MAX_TRANSACTIONS_PER_BLOCK {
            return Err(ValidationError::TooManyTransactions);
        }

        for stx in &self.transactions {
            stx.valid()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_KEY_BITS;
    use crate::crypto::address::Version;
    use crate::crypto::keys::generate_key;
    use crate::transaction::Tx;

    /// Searches nonces until the block hash meets the difficulty rule.
    fn mine(previous: &Block, reward_address: Address, reward: i64, txs: Vec<SignedTx>) -> Block {
        let mut b = Block::new(previous, 0, reward_address, reward, txs).unwrap();
        let mut nonce = 0;
        while !b.hash.meets_difficulty() {
            nonce += 1;
            b.nonce = nonce;
            b.update_hash().unwrap();
        }
        b
    }

    fn miner_address() -> Address {
        let key = generate_key(DEFAULT_KEY_BITS, 21).unwrap();
        Address::from_key(Version::V1, &key.to_public_key())
    }

    #[test]
    fn genesis_shape() {
        let g = Block::genesis();
        assert_eq!(g.height, 0);
        assert_eq!(g.previous_hash, Hash::EMPTY);
        assert_eq!(g.nonce, GENESIS_NONCE);
        assert!(g.transactions.is_empty());
        assert_eq!(g.reward_output.amount, 0);
        assert_ne!(g.hash, Hash::EMPTY);

        // Deterministic: every node computes the same genesis identity.
        assert_eq!(Block::genesis().hash, g.hash);
    }

    #[test]
    fn nonce_changes_the_hash() {
        let g = Block::genesis();
        let a = Block::new(&g, 1, miner_address(), 100, vec![]).unwrap();
        let b = Block::new(&g, 2, miner_address(), 100, vec![]).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn round_trip_preserves_identity() {
        let g = Block::genesis();
        let b = Block::new(&g, 7, miner_address(), 100, vec![]).unwrap();

        let raw = serde_json::to_vec(&b).unwrap();
        let back = Block::decode(&raw).unwrap();
        assert_eq!(back.hash, b.hash);
        assert_eq!(back, b);

        let json = String::from_utf8(raw).unwrap();
        assert!(!json.contains("\"Hash\""));
        // Canonical key order.
        assert!(json.find("\"PreviousHash\"").unwrap() < json.find("\"Height\"").unwrap());
        assert!(json.find("\"Height\"").unwrap() < json.find("\"Nonce\"").unwrap());
        assert!(json.find("\"Nonce\"").unwrap() < json.find("\"RewardOutput\"").unwrap());
        assert!(json.find("\"RewardOutput\"").unwrap() < json.find("\"Transactions\"").unwrap());
    }

    #[test]
    fn mined_child_of_genesis_is_valid() {
        let g = Block::genesis();
        let b = mine(&g, miner_address(), 100, vec![]);

        assert!(b.hash.meets_difficulty());
        assert_eq!(b.height, 1);
        b.valid(&g).unwrap();
    }

    #[test]
    fn wrong_parent_rejected() {
        let g = Block::genesis();
        let child = mine(&g, miner_address(), 100, vec![]);
        let grandchild = mine(&child, miner_address(), 100, vec![]);

        assert!(matches!(
            grandchild.valid(&g),
            Err(ValidationError::PreviousHashMismatch { .. })
        ));
    }

    #[test]
    fn wrong_height_rejected() {
        let g = Block::genesis();
        let mut b = mine(&g, miner_address(), 100, vec![]);
        b.height = 5;
        // Forcing the hash past the difficulty check isolates the height rule.
        b.hash = Hash::EMPTY;
        assert_eq!(
            b.valid(&g),
            Err(ValidationError::BadHeight {
                expected: 1,
                got: 5
            })
        );
    }

    #[test]
    fn unmined_block_fails_pow() {
        let g = Block::genesis();
        let mut b = Block::new(&g, 1, miner_address(), 100, vec![]).unwrap();
        while b.hash.meets_difficulty() {
            b.nonce += 1;
            b.update_hash().unwrap();
        }
        assert_eq!(b.valid(&g), Err(ValidationError::BadPow));
    }

    #[test]
    fn reward_bounds_enforced() {
        let g = Block::genesis();

        let mut over = Block::new(&g, 1, miner_address(), MAX_BLOCK_REWARD + 1, vec![]).unwrap();
        over.hash = Hash::EMPTY;
        assert_eq!(over.valid(&g), Err(ValidationError::RewardOutOfRange));

        let mut negative = Block::new(&g, 1, miner_address(), -1, vec![]).unwrap();
        negative.hash = Hash::EMPTY;
        assert_eq!(negative.valid(&g), Err(ValidationError::RewardOutOfRange));
    }

    #[test]
    fn transaction_count_bounded() {
        let key = generate_key(DEFAULT_KEY_BITS, 22).unwrap();
        let source = Address::from_key(Version::V1, &key.to_public_key());
        let stx = Tx {
            destination: miner_address(),
            amount: 1,
            source,
            fee: 0,
        }
        .sign(&key)
        .unwrap();

        let g = Block::genesis();
        let txs = vec![stx; MAX_TRANSACTIONS_PER_BLOCK + 1];
        let mut b = Block::new(&g, 1, miner_address(), 100, txs).unwrap();
        b.hash = Hash::EMPTY;
        assert_eq!(b.valid(&g), Err(ValidationError::TooManyTransactions));
    }

    #[test]
    fn invalid_transaction_fails_the_block() {
        let key = generate_key(DEFAULT_KEY_BITS, 23).unwrap();
        let source = Address::from_key(Version::V1, &key.to_public_key());
        let mut stx = Tx {
            destination: miner_address(),
            amount: 1,
            source,
            fee: 0,
        }
        .sign(&key)
        .unwrap();
        stx.signature[0] ^= 0xff;

        let g = Block::genesis();
        let mut b = Block::new(&g, 1, miner_address(), 100, vec![stx]).unwrap();
        b.hash = Hash::EMPTY;
        assert!(matches!(
            b.valid(&g),
            Err(ValidationError::BadSignature(_))
        ));
    }
}
