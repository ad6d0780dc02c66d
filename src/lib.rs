//! weft: peer-to-peer networking substrate for a blockchain-style node.
//!
//! The crate owns the framed wire protocol, the authenticated secure
//! channel, connection lifecycle, peer reputation and activation, the
//! header/block fetch scheduler, transaction and bulletin dissemination,
//! and LAN discovery. Consensus, storage of blocks, proof verification and
//! the transaction pool's internals stay behind the collaborator traits in
//! [`node`].

pub mod bbs;
pub mod beacon;
pub mod codec;
pub mod config;
pub mod connection;
pub mod msgs;
pub mod node;
pub mod peer_man;
pub mod relay;
pub mod schannel;
pub mod store;
pub mod tasks;
pub mod types;
pub mod wanted;

pub use bbs::{msg_key, BbsRecord, BbsStatus, BbsStore};
pub use beacon::{Beacon, BeaconSighting};
pub use codec::{write_frame, MsgHeader, MsgReader, ReadOutcome};
pub use config::{BandwidthCfg, BbsCfg, Config, FastSyncWindow, RatingCfg, TimeoutCfg};
pub use connection::{ConnFlags, ConnState, Connection, SendError};
pub use msgs::{size_policy, Msg, MsgError, SizePolicy};
pub use node::{
    ApiCall, ChainHandler, DataStatus, Node, NodeHandle, NullChain, NullTxPool, Observer,
    SyncError, TxHandler, TxMode, TxStatus,
};
pub use peer_man::{PeerManager, PeerRecord, RecordId, StoredPeer, UpdateActions};
pub use relay::{RingItem, SendRing};
pub use schannel::{verify_auth, IdentityKey, Mode, SChannel};
pub use store::{NodeStore, StoreError};
pub use tasks::{ConnKey, Released, Task, TaskKey, TaskScheduler};
pub use types::{
    bye_reason, login_flags, now, now_ms, BlockId, DisconnectReason, Hash, IdentityType, NetAddr,
    PeerId, ProtocolViolation, StreamFlags, StreamId, Tip, DEFAULT_PORT, HEADER_SIZE, MAC_SIZE,
    PROTOCOL_MAGIC,
};
pub use wanted::Wanted;
