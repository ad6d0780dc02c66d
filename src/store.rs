//! Sled-backed persistence: the address book, the bulletin cache, and a
//! small parameter tree (own identity, last recovery height).
//!
//! Values are bincode; nothing here is wire format. The substrate treats
//! the store as a collaborator: load once at startup, flush on a coarse
//! timer, never in a hot path.

use crate::bbs::BbsRecord;
use crate::peer_man::StoredPeer;
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use std::path::Path;

const PARAM_IDENTITY: &[u8] = b"identity";
const PARAM_RECOVERY_HEIGHT: &[u8] = b"recovery_height";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Db(#[from] sled::Error),
    #[error("corrupt record: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),
}

/// Persisted bulletin row (record plus its derived key).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BbsRow {
    channel: u32,
    time_posted: u64,
    payload: Vec<u8>,
    nonce: u64,
}

pub struct NodeStore {
    _db: sled::Db,
    peers: sled::Tree,
    bbs: sled::Tree,
    params: sled::Tree,
}

impl NodeStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(NodeStore {
            peers: db.open_tree("peers")?,
            bbs: db.open_tree("bbs")?,
            params: db.open_tree("params")?,
            _db: db,
        })
    }

    // -- address book ---------------------------------------------------------

    /// Replace the persisted address book with the given snapshot.
    pub fn save_peers(&self, peers: &[StoredPeer]) -> Result<(), StoreError> {
        self.peers.clear()?;
        for p in peers {
            self.peers.insert(p.id.0, bincode::serialize(p)?)?;
        }
        self.peers.flush()?;
        Ok(())
    }

    pub fn load_peers(&self) -> Result<Vec<StoredPeer>, StoreError> {
        let mut out = Vec::new();
        for row in self.peers.iter() {
            let (_, v) = row?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    // -- bulletin board -------------------------------------------------------

    pub fn save_bbs(&self, msgs: impl Iterator<Item = (Hash, BbsRecord)>) -> Result<(), StoreError> {
        self.bbs.clear()?;
        for (key, rec) in msgs {
            let row = BbsRow {
                channel: rec.channel,
                time_posted: rec.time_posted,
                payload: rec.payload,
                nonce: rec.nonce,
            };
            self.bbs.insert(key, bincode::serialize(&row)?)?;
        }
        self.bbs.flush()?;
        Ok(())
    }

    pub fn load_bbs(&self) -> Result<Vec<(Hash, BbsRecord)>, StoreError> {
        let mut out = Vec::new();
        for row in self.bbs.iter() {
            let (k, v) = row?;
            let Ok(key) = <[u8; 32]>::try_from(k.as_ref()) else {
                continue; // skip junk keys rather than refuse to start
            };
            let row: BbsRow = bincode::deserialize(&v)?;
            out.push((
                key,
                BbsRecord {
                    channel: row.channel,
                    time_posted: row.time_posted,
                    payload: row.payload,
                    nonce: row.nonce,
                },
            ));
        }
        Ok(out)
    }

    // -- parameters -----------------------------------------------------------

    pub fn identity(&self) -> Result<Option<[u8; 32]>, StoreError> {
        Ok(self
            .params
            .get(PARAM_IDENTITY)?
            .and_then(|v| v.as_ref().try_into().ok()))
    }

    pub fn set_identity(&self, secret: &[u8; 32]) -> Result<(), StoreError> {
        self.params.insert(PARAM_IDENTITY, &secret[..])?;
        self.params.flush()?;
        Ok(())
    }

    pub fn recovery_height(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.params.get(PARAM_RECOVERY_HEIGHT)?.and_then(|v| {
            let bytes: [u8; 8] = v.as_ref().try_into().ok()?;
            Some(u64::from_le_bytes(bytes))
        }))
    }

    pub fn set_recovery_height(&self, h: u64) -> Result<(), StoreError> {
        self.params.insert(PARAM_RECOVERY_HEIGHT, &h.to_le_bytes())?;
        Ok(())
    }
}
