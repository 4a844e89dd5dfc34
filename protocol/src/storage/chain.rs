//! The chain store: blocks, per-block balances, inclusion bookkeeping,
//! mempool, peers and wallet keys, all in one SQLite file.
//!
//! ## Tables
//!
//! | Table           | Key                     | Holds                          |
//! |-----------------|-------------------------|--------------------------------|
//! | `blocks`        | `hash`                  | canonical JSON of each block   |
//! | `balances`      | `(block_hash, address)` | balance map per block          |
//! | `included_txs`  | `(block_hash, tx_hash)` | tx hashes on the chain at hash |
//! | `block_txs`     | `(block_hash, tx_hash)` | which block carries which tx   |
//! | `txs`           | `hash`                  | every signed tx ever seen      |
//! | `keys`          | `address`               | wallet private keys (PEM)      |
//! | `miner_address` | single row              | reward destination             |
//! | `peers`         | `peer`                  | known `host:port` strings      |
//!
//! Balances and inclusion sets are materialized per block hash: adding
//! a block copies its parent's rows and applies the block's deltas, so
//! validation of the next block is a plain lookup. Zero balances are
//! garbage-collected. Every operation runs through
//! [`Store::transact_retry`], so partial state is never visible: a
//! block and all of its bookkeeping land atomically or not at all.

use rsa::RsaPrivateKey;
use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::block::Block;
use crate::config::DEFAULT_KEY_BITS;
use crate::crypto::address::{Address, AddressState, Version};
use crate::crypto::hash::Hash;
use crate::crypto::keys::{
    decode_private_key_pem, encode_private_key_pem, generate_key, public_key_der, KeyError,
};
use crate::error::ValidationError;
use crate::proof::WalletKey;
use crate::storage::store::{is_deadlock, Retriable, Store};
use crate::transaction::{PersonalTx, SignedTx};

/// Errors surfaced by chain operations. Consensus violations stay
/// distinguishable from storage faults so gossip handlers can drop bad
/// material without treating it as an IO problem.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("transaction failed after {tries} attempt(s): {source}")]
    Exhausted {
        tries: u32,
        #[source]
        source: Box<ChainError>,
    },
}

impl ChainError {
    /// Whether this is a consensus violation rather than a fault.
    pub fn is_invalid(&self) -> bool {
        matches!(self, ChainError::Invalid(_))
    }

    /// Whether this is specifically the unknown-parent marker.
    pub fn is_unknown_parent(&self) -> bool {
        matches!(self, ChainError::Invalid(ValidationError::UnknownParent))
    }
}

impl Retriable for ChainError {
    fn is_contention(&self) -> bool {
        matches!(self, ChainError::Sqlite(e) if is_deadlock(e))
    }

    fn into_exhausted(self, tries: u32) -> Self {
        ChainError::Exhausted {
            tries,
            source: Box::new(self),
        }
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS blocks (
        hash TEXT PRIMARY KEY NOT NULL,
        previous_hash TEXT NULL,
        height INTEGER NOT NULL,
        block TEXT NOT NULL,
        FOREIGN KEY (previous_hash) REFERENCES blocks (hash)
    );
    CREATE INDEX IF NOT EXISTS blocks_height ON blocks (height);
    CREATE INDEX IF NOT EXISTS blocks_previous_hash ON blocks (previous_hash);

    CREATE TABLE IF NOT EXISTS balances (
        block_hash TEXT NOT NULL,
        address TEXT NOT NULL,
        balance INTEGER NOT NULL,
        PRIMARY KEY (block_hash, address),
        FOREIGN KEY (block_hash) REFERENCES blocks (hash)
    );
    CREATE INDEX IF NOT EXISTS balances_balance ON balances (balance);

    CREATE TABLE IF NOT EXISTS keys (
        address TEXT PRIMARY KEY NOT NULL,
        private_key TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS miner_address (
        address TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS txs (
        hash TEXT PRIMARY KEY NOT NULL,
        source TEXT NOT NULL,
        destination TEXT NOT NULL,
        amount INTEGER NOT NULL,
        fee INTEGER NOT NULL,
        tx TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS txs_source ON txs (source);
    CREATE INDEX IF NOT EXISTS txs_destination ON txs (destination);
    CREATE INDEX IF NOT EXISTS txs_fee ON txs (fee);

    CREATE TABLE IF NOT EXISTS block_txs (
        block_hash TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        PRIMARY KEY (block_hash, tx_hash),
        FOREIGN KEY (block_hash) REFERENCES blocks (hash),
        FOREIGN KEY (tx_hash) REFERENCES txs (hash)
    );
    CREATE INDEX IF NOT EXISTS block_txs_tx_hash ON block_txs (tx_hash);

    CREATE TABLE IF NOT EXISTS included_txs (
        block_hash TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        PRIMARY KEY (block_hash, tx_hash),
        FOREIGN KEY (block_hash) REFERENCES blocks (hash),
        FOREIGN KEY (tx_hash) REFERENCES txs (hash)
    );
    CREATE INDEX IF NOT EXISTS included_txs_tx_hash ON included_txs (tx_hash);

    CREATE TABLE IF NOT EXISTS peers (
        peer TEXT PRIMARY KEY NOT NULL
    );
";

/// Handle to the persistent chain state.
pub struct ChainStore {
    store: Store,
}

impl ChainStore {
    /// Opens (or creates) the chain database at `path`, running
    /// migrations, inserting the genesis block and bootstrapping a
    /// wallet key on first open.
    pub fn open(path: impl AsRef<Path>) -> Result<ChainStore, ChainError> {
        ChainStore::from_store(Store::open(path)?)
    }

    /// In-memory store. Test fixture.
    pub fn open_in_memory() -> Result<ChainStore, ChainError> {
        ChainStore::from_store(Store::open_in_memory()?)
    }

    /// Wraps an already-configured [`Store`], migrating it.
    pub fn from_store(store: Store) -> Result<ChainStore, ChainError> {
        let chain = ChainStore { store };
        chain.store.transact_retry(migrate)?;
        Ok(chain)
    }

    /// The block of greatest height; ties broken by storage order.
    pub fn best_block(&self) -> Result<Block, ChainError> {
        self.store.transact_retry(|tx| {
            let raw: String = tx.query_row(
                "SELECT block FROM blocks ORDER BY height DESC LIMIT 1",
                [],
                |r| r.get(0),
            )?;
            Ok(Block::decode(raw.as_bytes())?)
        })
    }

    /// The chain ending at the current tip, tip first, down to genesis.
    pub fn blocks(&self) -> Result<Vec<Block>, ChainError> {
        self.store.transact_retry(|tx| {
            let mut stmt = tx.prepare(
                "WITH RECURSIVE f (previous_hash, block) AS (
                     SELECT previous_hash, block FROM (
                         SELECT previous_hash, block
                         FROM blocks
                         ORDER BY height DESC
                         LIMIT 1
                     )
                     UNION
                     SELECT b.previous_hash, b.block
                     FROM blocks AS b
                     JOIN f ON f.previous_hash = b.hash
                 )
                 SELECT block FROM f",
            )?;

            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut blocks = Vec::new();
            for row in rows {
                blocks.push(Block::decode(row?.as_bytes())?);
            }
            Ok(blocks)
        })
    }

    /// Validates and applies a single candidate block. Fails with
    /// [`ValidationError::UnknownParent`] when the parent is missing so
    /// the caller can backfill; succeeds without effect when the block
    /// is already stored.
    pub fn add_block(&self, block: &Block) -> Result<(), ChainError> {
        self.store.transact_retry(|tx| add_block(tx, block))
    }

    /// Applies a peer-supplied chain, tip first. The suffix below the
    /// first locally-known block is applied oldest-first; a chain that
    /// shares no ancestor, or whose tip we already have, is ignored.
    pub fn add_blocks(&self, blocks: &[Block]) -> Result<(), ChainError> {
        self.store.transact_retry(|tx| {
            let mut diverged_at: i64 = -1;
            for (i, block) in blocks.iter().enumerate() {
                let known: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM blocks WHERE hash = ?1",
                        params![block.hash],
                        |r| r.get(0),
                    )
                    .optional()?;
                if known.is_some() {
                    diverged_at = i as i64;
                    break;
                }
            }

            if diverged_at <= 0 {
                // No common ancestor, or the peer is not ahead of us.
                return Ok(());
            }

            for i in (0..diverged_at as usize).rev() {
                add_block(tx, &blocks[i])?;
            }
            Ok(())
        })
    }

    /// Validates a signed transaction against the current tip and
    /// inserts it into the mempool. Idempotent on the tx hash.
    pub fn add_tx(&self, stx: &SignedTx) -> Result<(), ChainError> {
        self.store.transact_retry(|tx| {
            let tip = best_block_hash(tx)?;
            valid_tx(tx, stx, &tip)?;
            insert_tx(tx, stx)
        })
    }

    /// Up to `limit` pending transactions that stay solvent when
    /// applied in order on top of `tip`'s balances. Pending
    /// transactions whose source can no longer cover them are deleted
    /// if no block references them.
    pub fn pending_txs(&self, tip: &Hash, limit: usize) -> Result<Vec<SignedTx>, ChainError> {
        self.store.transact_retry(|tx| {
            // Scratch balance map, seeded from the tip and consumed as
            // transactions are accepted. Scoped to this transaction.
            let mut scratch: HashMap<Address, i64> = HashMap::new();
            {
                let mut stmt =
                    tx.prepare("SELECT address, balance FROM balances WHERE block_hash = ?1")?;
                let rows = stmt.query_map(params![tip], |r| {
                    Ok((r.get::<_, Address>(0)?, r.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (address, balance) = row?;
                    scratch.insert(address, balance);
                }
            }

            let mut stmt = tx.prepare(
                "SELECT t.tx
                 FROM txs t
                 LEFT JOIN included_txs i ON i.tx_hash = t.hash AND i.block_hash = ?1
                 WHERE i.tx_hash IS NULL",
            )?;
            let rows = stmt.query_map(params![tip], |r| r.get::<_, String>(0))?;

            let mut stxs = Vec::new();
            for row in rows {
                let stx = SignedTx::decode(row?.as_bytes())?;

                // Re-validate: the source balance may have moved since
                // the transaction entered the pool.
                if let Err(err) = valid_scratch_tx(&scratch, &stx) {
                    tracing::debug!(tx = %stx.hash, error = %err, "dropping insolvent pending tx");
                    tx.execute(
                        "DELETE FROM txs
                         WHERE hash = ?1
                         AND NOT EXISTS (
                             SELECT 1 FROM block_txs WHERE tx_hash = ?1
                         )
                         AND NOT EXISTS (
                             SELECT 1 FROM included_txs WHERE tx_hash = ?1
                         )",
                        params![stx.hash],
                    )?;
                    continue;
                }

                *scratch.entry(stx.source.clone()).or_insert(0) -= stx.required_balance();
                *scratch.entry(stx.destination.clone()).or_insert(0) += stx.amount;
                stxs.push(stx);

                if stxs.len() >= limit {
                    break;
                }
            }

            Ok(stxs)
        })
    }

    /// Every transaction not included at the current tip, with no
    /// solvency filtering. Serves peer mempool pulls.
    pub fn all_pending_txs(&self) -> Result<Vec<SignedTx>, ChainError> {
        self.store.transact_retry(|tx| {
            let tip = best_block_hash(tx)?;

            let mut stmt = tx.prepare(
                "SELECT t.tx
                 FROM txs t
                 LEFT JOIN included_txs i ON i.tx_hash = t.hash AND i.block_hash = ?1
                 WHERE i.tx_hash IS NULL",
            )?;
            let rows = stmt.query_map(params![tip], |r| r.get::<_, String>(0))?;

            let mut stxs = Vec::new();
            for row in rows {
                stxs.push(SignedTx::decode(row?.as_bytes())?);
            }
            Ok(stxs)
        })
    }

    /// Every transaction touching a wallet address, pending first,
    /// then by inclusion height descending.
    pub fn my_txs(&self) -> Result<Vec<PersonalTx>, ChainError> {
        self.store.transact_retry(|tx| {
            let tip = best_block_hash(tx)?;

            let mut stmt = tx.prepare(
                "SELECT DISTINCT
                     t.tx,
                     i.tx_hash IS NOT NULL AS included,
                     b.height
                 FROM txs t
                 JOIN keys k ON k.address = t.source OR k.address = t.destination
                 LEFT JOIN included_txs i ON i.tx_hash = t.hash AND i.block_hash = ?1
                 LEFT JOIN block_txs bt ON bt.tx_hash = t.hash
                 LEFT JOIN blocks b ON b.hash = bt.block_hash
                 ORDER BY included ASC, b.height DESC",
            )?;
            let rows = stmt.query_map(params![tip], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, bool>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                ))
            })?;

            let mut ptxs = Vec::new();
            for row in rows {
                let (raw, included, height) = row?;
                ptxs.push(PersonalTx {
                    tx: SignedTx::decode(raw.as_bytes())?,
                    included,
                    height: height.unwrap_or(0),
                });
            }
            Ok(ptxs)
        })
    }

    /// Every wallet address with its public key and balance at the tip.
    pub fn addresses(&self) -> Result<Vec<AddressState>, ChainError> {
        self.store.transact_retry(|tx| {
            let mut stmt = tx.prepare(
                "SELECT k.address, k.private_key, COALESCE(b.balance, 0)
                 FROM keys k
                 LEFT JOIN balances b ON b.address = k.address AND b.block_hash = (
                     SELECT hash
                     FROM blocks
                     ORDER BY height DESC
                     LIMIT 1
                 )",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, Address>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            })?;

            let mut addrs = Vec::new();
            for row in rows {
                let (address, pem, balance) = row?;
                let key = decode_private_key_pem(&pem)?;
                addrs.push(AddressState {
                    address,
                    public_key: public_key_der(&key.to_public_key()),
                    balance,
                });
            }
            Ok(addrs)
        })
    }

    /// Every wallet key, for signing address-ownership proofs.
    pub fn keys(&self) -> Result<Vec<WalletKey>, ChainError> {
        self.store.transact_retry(|tx| {
            let mut stmt = tx.prepare("SELECT address, private_key FROM keys")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, Address>(0)?, r.get::<_, String>(1)?))
            })?;

            let mut keys = Vec::new();
            for row in rows {
                let (address, pem) = row?;
                keys.push(WalletKey {
                    address,
                    key: decode_private_key_pem(&pem)?,
                });
            }
            Ok(keys)
        })
    }

    /// Stores a private key under its derived address and returns that
    /// address. Idempotent on the address.
    pub fn add_key(&self, version: Version, key: &RsaPrivateKey) -> Result<Address, ChainError> {
        let address = Address::from_key(version, &key.to_public_key());
        self.store
            .transact_retry(|tx| insert_key(tx, &address, key))?;
        Ok(address)
    }

    /// The private key for `address`, if this wallet holds it.
    pub fn key(&self, address: &Address) -> Result<Option<RsaPrivateKey>, ChainError> {
        self.store.transact_retry(|tx| {
            let pem: Option<String> = tx
                .query_row(
                    "SELECT private_key FROM keys WHERE address = ?1",
                    params![address],
                    |r| r.get(0),
                )
                .optional()?;
            match pem {
                Some(pem) => Ok(Some(decode_private_key_pem(&pem)?)),
                None => Ok(None),
            }
        })
    }

    /// The reward destination for locally mined blocks.
    pub fn miner_address(&self) -> Result<Address, ChainError> {
        self.store.transact_retry(|tx| {
            Ok(tx.query_row("SELECT address FROM miner_address", [], |r| r.get(0))?)
        })
    }

    pub fn set_miner_address(&self, address: &Address) -> Result<(), ChainError> {
        self.store.transact_retry(|tx| {
            tx.execute("UPDATE miner_address SET address = ?1", params![address])?;
            Ok(())
        })
    }

    pub fn peers(&self) -> Result<Vec<String>, ChainError> {
        self.store.transact_retry(|tx| {
            let mut stmt = tx.prepare("SELECT peer FROM peers")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut peers = Vec::new();
            for row in rows {
                peers.push(row?);
            }
            Ok(peers)
        })
    }

    pub fn peer_exists(&self, peer: &str) -> Result<bool, ChainError> {
        self.store.transact_retry(|tx| {
            let found: Option<i64> = tx
                .query_row("SELECT 1 FROM peers WHERE peer = ?1", params![peer], |r| {
                    r.get(0)
                })
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Inserts a peer, returning whether it was newly created.
    pub fn add_peer(&self, peer: &str) -> Result<bool, ChainError> {
        self.store.transact_retry(|tx| {
            let changed =
                tx.execute("INSERT OR IGNORE INTO peers (peer) VALUES (?1)", params![peer])?;
            Ok(changed > 0)
        })
    }

    pub fn remove_peer(&self, peer: &str) -> Result<(), ChainError> {
        self.store.transact_retry(|tx| {
            tx.execute("DELETE FROM peers WHERE peer = ?1", params![peer])?;
            Ok(())
        })
    }
}

/// Creates the schema, inserts the genesis block, and bootstraps a
/// wallet key + miner address on first open.
fn migrate(tx: &Transaction<'_>) -> Result<(), ChainError> {
    tx.execute_batch(SCHEMA)?;

    let genesis = Block::genesis();
    tx.execute(
        "INSERT OR IGNORE INTO blocks (hash, previous_hash, height, block)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            genesis.hash,
            genesis.previous_hash,
            genesis.height,
            serde_json::to_string(&genesis)?
        ],
    )?;

    let have_keys: Option<i64> = tx
        .query_row("SELECT 1 FROM keys LIMIT 1", [], |r| r.get(0))
        .optional()?;
    if have_keys.is_none() {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let key = generate_key(DEFAULT_KEY_BITS, seed)?;
        let address = Address::from_key(Version::default(), &key.to_public_key());
        insert_key(tx, &address, &key)?;
        tx.execute(
            "INSERT INTO miner_address (address) VALUES (?1)",
            params![address],
        )?;
    }

    Ok(())
}

fn best_block_hash(tx: &Transaction<'_>) -> Result<Hash, ChainError> {
    Ok(tx.query_row(
        "SELECT hash FROM blocks ORDER BY height DESC LIMIT 1",
        [],
        |r| r.get(0),
    )?)
}

fn insert_key(tx: &Transaction<'_>, address: &Address, key: &RsaPrivateKey) -> Result<(), ChainError> {
    tx.execute(
        "INSERT OR IGNORE INTO keys (address, private_key) VALUES (?1, ?2)",
        params![address, encode_private_key_pem(key)],
    )?;
    Ok(())
}

fn insert_tx(tx: &Transaction<'_>, stx: &SignedTx) -> Result<(), ChainError> {
    tx.execute(
        "INSERT OR IGNORE INTO txs (hash, source, destination, amount, fee, tx)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            stx.hash,
            stx.source,
            stx.destination,
            stx.amount,
            stx.fee,
            serde_json::to_string(stx)?
        ],
    )?;
    Ok(())
}

/// Standalone rules plus the economic rules against the balance map
/// and inclusion set stored under `tip`.
fn valid_tx(tx: &Transaction<'_>, stx: &SignedTx, tip: &Hash) -> Result<(), ChainError> {
    stx.valid()?;

    let balance: i64 = tx
        .query_row(
            "SELECT balance FROM balances WHERE block_hash = ?1 AND address = ?2",
            params![tip, stx.source],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(0);

    if balance < stx.required_balance() {
        return Err(ValidationError::InsufficientBalance {
            balance,
            required: stx.required_balance(),
        }
        .into());
    }

    let included: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM included_txs WHERE block_hash = ?1 AND tx_hash = ?2",
            params![tip, stx.hash],
            |r| r.get(0),
        )
        .optional()?;
    if included.is_some() {
        return Err(ValidationError::AlreadyIncluded.into());
    }

    Ok(())
}

/// The same rules as [`valid_tx`], but against an in-memory scratch
/// balance map (no inclusion check: the candidate list already
/// excludes included transactions).
fn valid_scratch_tx(
    scratch: &HashMap<Address, i64>,
    stx: &SignedTx,
) -> Result<(), ValidationError> {
    stx.valid()?;

    let balance = scratch.get(&stx.source).copied().unwrap_or(0);
    if balance < stx.required_balance() {
        return Err(ValidationError::InsufficientBalance {
            balance,
            required: stx.required_balance(),
        });
    }

    Ok(())
}

fn add_block(tx: &Transaction<'_>, block: &Block) -> Result<(), ChainError> {
    let parent_raw: Option<String> = tx
        .query_row(
            "SELECT block FROM blocks WHERE hash = ?1",
            params![block.previous_hash],
            |r| r.get(0),
        )
        .optional()?;
    let Some(parent_raw) = parent_raw else {
        return Err(ValidationError::UnknownParent.into());
    };
    let previous = Block::decode(parent_raw.as_bytes())?;

    let insert = tx.execute(
        "INSERT INTO blocks (hash, previous_hash, height, block)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            block.hash,
            block.previous_hash,
            block.height,
            serde_json::to_string(block)?
        ],
    );
    match insert {
        Ok(_) => {}
        // Already stored: done, and deliberately not an error.
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            return Ok(())
        }
        Err(e) => return Err(e.into()),
    }

    // The new block starts from its parent's balance map and inclusion
    // set; the deltas below are applied on top.
    tx.execute(
        "INSERT INTO balances (block_hash, address, balance)
         SELECT ?1, address, balance
         FROM balances
         WHERE block_hash = ?2",
        params![block.hash, block.previous_hash],
    )?;
    tx.execute(
        "INSERT INTO included_txs (block_hash, tx_hash)
         SELECT ?1, tx_hash
         FROM included_txs
         WHERE block_hash = ?2",
        params![block.hash, block.previous_hash],
    )?;

    block.valid(&previous)?;

    let mut fee = block.reward_output.amount;
    for stx in &block.transactions {
        fee += stx.fee;

        valid_tx(tx, stx, &block.hash)?;

        tx.execute(
            "UPDATE balances
             SET balance = balance - ?1
             WHERE block_hash = ?2 AND address = ?3",
            params![stx.required_balance(), block.hash, stx.source],
        )?;
        tx.execute(
            "INSERT INTO balances (block_hash, address, balance)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (block_hash, address) DO UPDATE
             SET balance = balance + excluded.balance",
            params![block.hash, stx.destination, stx.amount],
        )?;

        insert_tx(tx, stx)?;

        tx.execute(
            "INSERT INTO included_txs (block_hash, tx_hash) VALUES (?1, ?2)",
            params![block.hash, stx.hash],
        )?;
        tx.execute(
            "INSERT INTO block_txs (block_hash, tx_hash) VALUES (?1, ?2)",
            params![block.hash, stx.hash],
        )?;
    }

    if fee > 0 {
        tx.execute(
            "INSERT INTO balances (block_hash, address, balance)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (block_hash, address) DO UPDATE
             SET balance = balance + excluded.balance",
            params![block.hash, block.reward_output.destination, fee],
        )?;
    }

    tx.execute("DELETE FROM balances WHERE balance = 0", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Tx;
    use tempfile::tempdir;

    fn open() -> ChainStore {
        ChainStore::open_in_memory().unwrap()
    }

    fn key_pair(seed: u64) -> (RsaPrivateKey, Address) {
        let key = generate_key(DEFAULT_KEY_BITS, seed).unwrap();
        let addr = Address::from_key(Version::V1, &key.to_public_key());
        (key, addr)
    }

    /// Searches nonces until the candidate meets the difficulty rule.
    fn mine(previous: &Block, reward_address: &Address, reward: i64, txs: Vec<SignedTx>) -> Block {
        let mut b = Block::new(previous, 0, reward_address.clone(), reward, txs).unwrap();
        while !b.hash.meets_difficulty() {
            b.nonce += 1;
            b.update_hash().unwrap();
        }
        b
    }

    fn transfer(key: &RsaPrivateKey, source: &Address, dest: &Address, amount: i64, fee: i64) -> SignedTx {
        Tx {
            destination: dest.clone(),
            amount,
            source: source.clone(),
            fee,
        }
        .sign(key)
        .unwrap()
    }

    fn balance_of(chain: &ChainStore, addr: &Address) -> i64 {
        chain
            .addresses()
            .unwrap()
            .into_iter()
            .find(|a| &a.address == addr)
            .map(|a| a.balance)
            .unwrap_or(0)
    }

    #[test]
    fn fresh_store_starts_at_genesis() {
        let chain = open();
        let best = chain.best_block().unwrap();

        assert_eq!(best.height, 0);
        assert_eq!(best.previous_hash, Hash::EMPTY);
        assert!(best.transactions.is_empty());
        assert_eq!(best.hash, Block::genesis().hash);

        let blocks = chain.blocks().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].hash, best.hash);
    }

    #[test]
    fn bootstrap_creates_a_wallet_and_miner_address() {
        let chain = open();
        let keys = chain.keys().unwrap();
        assert_eq!(keys.len(), 1);

        let miner = chain.miner_address().unwrap();
        assert_eq!(miner, keys[0].address);
    }

    #[test]
    fn mining_one_block_credits_the_reward() {
        let chain = open();
        let (key, miner) = key_pair(101);
        chain.add_key(Version::V1, &key).unwrap();

        let genesis = chain.best_block().unwrap();
        let block = mine(&genesis, &miner, 100, vec![]);
        chain.add_block(&block).unwrap();

        let best = chain.best_block().unwrap();
        assert_eq!(best.height, 1);
        assert_eq!(best.previous_hash, genesis.hash);
        assert!(best.hash.meets_difficulty());
        assert_eq!(balance_of(&chain, &miner), 100);
    }

    #[test]
    fn transfer_with_fee_settles_all_three_parties() {
        let chain = open();
        let (key_a, a) = key_pair(102);
        let (key_b, b) = key_pair(103);
        let (key_m, m) = key_pair(104);
        chain.add_key(Version::V1, &key_a).unwrap();
        chain.add_key(Version::V1, &key_b).unwrap();
        chain.add_key(Version::V1, &key_m).unwrap();

        // Fund A with one mined block.
        let genesis = chain.best_block().unwrap();
        let funding = mine(&genesis, &a, 100, vec![]);
        chain.add_block(&funding).unwrap();

        let stx = transfer(&key_a, &a, &b, 40, 10);
        chain.add_tx(&stx).unwrap();

        let pending = chain.pending_txs(&funding.hash, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash, stx.hash);

        let block = mine(&funding, &m, 100, pending);
        chain.add_block(&block).unwrap();

        assert_eq!(balance_of(&chain, &a), 50);
        assert_eq!(balance_of(&chain, &b), 40);
        // Block reward plus the transfer's fee.
        assert_eq!(balance_of(&chain, &m), 110);
    }

    #[test]
    fn add_tx_is_idempotent_until_included() {
        let chain = open();
        let (key_a, a) = key_pair(105);
        let (_, b) = key_pair(106);
        let (_, m) = key_pair(107);

        let genesis = chain.best_block().unwrap();
        let funding = mine(&genesis, &a, 100, vec![]);
        chain.add_block(&funding).unwrap();

        let stx = transfer(&key_a, &a, &b, 10, 0);
        chain.add_tx(&stx).unwrap();
        chain.add_tx(&stx).unwrap();
        assert_eq!(chain.all_pending_txs().unwrap().len(), 1);

        let block = mine(&funding, &m, 100, vec![stx.clone()]);
        chain.add_block(&block).unwrap();

        // Once included, resubmission is a replay.
        let err = chain.add_tx(&stx).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Invalid(ValidationError::AlreadyIncluded)
        ));
        assert!(chain.all_pending_txs().unwrap().is_empty());
    }

    #[test]
    fn add_block_is_idempotent() {
        let chain = open();
        let (_, miner) = key_pair(108);

        let genesis = chain.best_block().unwrap();
        let block = mine(&genesis, &miner, 100, vec![]);
        chain.add_block(&block).unwrap();
        chain.add_block(&block).unwrap();

        assert_eq!(chain.blocks().unwrap().len(), 2);
    }

    #[test]
    fn unknown_parent_then_backfill() {
        let chain = open();
        let (_, miner) = key_pair(109);

        let genesis = chain.best_block().unwrap();
        let b1 = mine(&genesis, &miner, 100, vec![]);
        let b2 = mine(&b1, &miner, 100, vec![]);

        let err = chain.add_block(&b2).unwrap_err();
        assert!(err.is_unknown_parent());

        // A tip-first chain that reaches a known ancestor links the gap.
        chain
            .add_blocks(&[b2.clone(), b1.clone(), genesis.clone()])
            .unwrap();
        assert_eq!(chain.best_block().unwrap().hash, b2.hash);
        assert_eq!(chain.blocks().unwrap().len(), 3);
    }

    #[test]
    fn chain_from_a_lagging_peer_is_ignored() {
        let chain = open();
        let (_, miner) = key_pair(110);

        let genesis = chain.best_block().unwrap();
        let b1 = mine(&genesis, &miner, 100, vec![]);
        chain.add_block(&b1).unwrap();

        // The peer's tip is our ancestor: nothing to apply.
        chain.add_blocks(&[genesis.clone()]).unwrap();
        assert_eq!(chain.best_block().unwrap().hash, b1.hash);

        // A chain sharing no block at all is also ignored.
        let other_genesis = {
            let mut g = Block::genesis();
            g.nonce = 1;
            g.update_hash().unwrap();
            g
        };
        let foreign = mine(&other_genesis, &miner, 100, vec![]);
        chain.add_blocks(&[foreign, other_genesis]).unwrap();
        assert_eq!(chain.best_block().unwrap().hash, b1.hash);
    }

    #[test]
    fn broke_source_cannot_enter_the_mempool() {
        let chain = open();
        let (key_a, a) = key_pair(111);
        let (_, b) = key_pair(112);

        let stx = transfer(&key_a, &a, &b, 10, 0);
        let err = chain.add_tx(&stx).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Invalid(ValidationError::InsufficientBalance {
                balance: 0,
                required: 10
            })
        ));
    }

    #[test]
    fn tampered_tx_is_rejected_by_add_tx() {
        let chain = open();
        let (key_a, a) = key_pair(113);
        let (_, b) = key_pair(114);

        let genesis = chain.best_block().unwrap();
        chain.add_block(&mine(&genesis, &a, 100, vec![])).unwrap();

        let mut stx = transfer(&key_a, &a, &b, 10, 0);
        stx.amount = 20;
        stx.update_hash().unwrap();
        let err = chain.add_tx(&stx).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Invalid(ValidationError::BadSignature(_))
        ));
    }

    #[test]
    fn pending_txs_keeps_sources_solvent() {
        let chain = open();
        let (key_a, a) = key_pair(115);
        let (_, b) = key_pair(116);

        let genesis = chain.best_block().unwrap();
        let funding = mine(&genesis, &a, 100, vec![]);
        chain.add_block(&funding).unwrap();

        // Each alone is covered by A's 100; together they are not.
        let first = transfer(&key_a, &a, &b, 60, 0);
        let second = transfer(&key_a, &a, &b, 60, 0);
        chain.add_tx(&first).unwrap();
        chain.add_tx(&second).unwrap();

        let pending = chain.pending_txs(&funding.hash, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash, first.hash);

        // The insolvent transaction was transient and is now gone.
        assert_eq!(chain.all_pending_txs().unwrap().len(), 1);
    }

    #[test]
    fn pending_txs_respects_the_limit() {
        let chain = open();
        let (key_a, a) = key_pair(117);
        let (_, b) = key_pair(118);

        let genesis = chain.best_block().unwrap();
        let funding = mine(&genesis, &a, 100, vec![]);
        chain.add_block(&funding).unwrap();

        for _ in 0..3 {
            chain.add_tx(&transfer(&key_a, &a, &b, 10, 0)).unwrap();
        }

        assert_eq!(chain.pending_txs(&funding.hash, 2).unwrap().len(), 2);
        assert_eq!(chain.all_pending_txs().unwrap().len(), 3);
    }

    #[test]
    fn my_txs_orders_pending_before_included() {
        let chain = open();
        let (key_a, a) = key_pair(119);
        let (key_b, b) = key_pair(120);
        chain.add_key(Version::V1, &key_a).unwrap();
        chain.add_key(Version::V1, &key_b).unwrap();

        let genesis = chain.best_block().unwrap();
        let funding = mine(&genesis, &a, 100, vec![]);
        chain.add_block(&funding).unwrap();

        let included = transfer(&key_a, &a, &b, 10, 0);
        chain.add_tx(&included).unwrap();
        let block = mine(&funding, &a, 100, vec![included.clone()]);
        chain.add_block(&block).unwrap();

        let pending = transfer(&key_a, &a, &b, 5, 0);
        chain.add_tx(&pending).unwrap();

        let mine_list = chain.my_txs().unwrap();
        assert_eq!(mine_list.len(), 2);
        assert!(!mine_list[0].included);
        assert_eq!(mine_list[0].tx.hash, pending.hash);
        assert!(mine_list[1].included);
        assert_eq!(mine_list[1].tx.hash, included.hash);
        assert_eq!(mine_list[1].height, block.height);
    }

    #[test]
    fn peer_set_operations() {
        let chain = open();

        assert!(chain.add_peer("10.0.0.1:8080").unwrap());
        assert!(!chain.add_peer("10.0.0.1:8080").unwrap());
        assert!(chain.peer_exists("10.0.0.1:8080").unwrap());
        assert!(!chain.peer_exists("10.0.0.2:8080").unwrap());

        assert!(chain.add_peer("10.0.0.2:8080").unwrap());
        let mut peers = chain.peers().unwrap();
        peers.sort();
        assert_eq!(peers, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);

        chain.remove_peer("10.0.0.1:8080").unwrap();
        assert_eq!(chain.peers().unwrap(), vec!["10.0.0.2:8080"]);
    }

    #[test]
    fn add_key_is_idempotent_and_key_lookup_works() {
        let chain = open();
        let (key, addr) = key_pair(121);

        let first = chain.add_key(Version::V1, &key).unwrap();
        let second = chain.add_key(Version::V1, &key).unwrap();
        assert_eq!(first, addr);
        assert_eq!(second, addr);
        // Bootstrap key plus exactly one copy of ours.
        assert_eq!(chain.keys().unwrap().len(), 2);

        let stored = chain.key(&addr).unwrap().unwrap();
        assert_eq!(stored, key);

        let (_, unknown) = key_pair(122);
        assert!(chain.key(&unknown).unwrap().is_none());
    }

    #[test]
    fn both_address_versions_of_a_key_can_be_stored() {
        let chain = open();
        let (key, v1) = key_pair(123);
        let v2 = chain.add_key(Version::V2, &key).unwrap();

        assert_ne!(v1, v2);
        assert_eq!(v2.len(), 16);
        chain.add_key(Version::V1, &key).unwrap();
        assert_eq!(chain.keys().unwrap().len(), 3);
    }

    #[test]
    fn set_miner_address_replaces_the_slot() {
        let chain = open();
        let (key, addr) = key_pair(124);
        chain.add_key(Version::V1, &key).unwrap();

        chain.set_miner_address(&addr).unwrap();
        assert_eq!(chain.miner_address().unwrap(), addr);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.sqlite3");
        let (_, miner) = key_pair(125);

        let block = {
            let chain = ChainStore::open(&path).unwrap();
            let genesis = chain.best_block().unwrap();
            let block = mine(&genesis, &miner, 100, vec![]);
            chain.add_block(&block).unwrap();
            block
        };

        let chain = ChainStore::open(&path).unwrap();
        let best = chain.best_block().unwrap();
        assert_eq!(best.hash, block.hash);
        assert_eq!(best.height, 1);
        // Migration is idempotent: still exactly one wallet bootstrap.
        assert_eq!(chain.keys().unwrap().len(), 1);
    }

    #[test]
    fn balances_inherit_and_zero_rows_are_collected() {
        let chain = open();
        let (key_a, a) = key_pair(126);
        let (_, b) = key_pair(127);
        let (_, m) = key_pair(128);
        chain.add_key(Version::V1, &key_a).unwrap();

        let genesis = chain.best_block().unwrap();
        let funding = mine(&genesis, &a, 100, vec![]);
        chain.add_block(&funding).unwrap();

        // Spend the full balance: A's row must disappear at the new tip.
        let stx = transfer(&key_a, &a, &b, 100, 0);
        chain.add_tx(&stx).unwrap();
        let block = mine(&funding, &m, 0, vec![stx]);
        chain.add_block(&block).unwrap();

        assert_eq!(balance_of(&chain, &a), 0);
        let addrs = chain.addresses().unwrap();
        let entry = addrs.iter().find(|s| s.address == a).unwrap();
        assert_eq!(entry.balance, 0);
    }
}
