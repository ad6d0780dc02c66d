//! Node configuration.
//!
//! One flat struct of tunables with documented defaults. The embedding
//! application fills it however it likes (file, flags, hardcoded); the
//! substrate only reads it.

use crate::types::{Hash, NetAddr};
use serde::{Deserialize, Serialize};

/// Rating arithmetic bounds and deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingCfg {
    /// Assigned to a freshly discovered peer.
    pub initial: u32,
    /// Saturation ceiling; a saturated rating cannot grow, only shrink.
    pub max: u32,
    pub reward_header: u32,
    pub reward_tx: u32,
    pub reward_block: u32,
    pub penalty_timeout: u32,
    pub penalty_network_err: u32,
    /// Adjusted-rating increase per second while a peer sits unconnected.
    pub starvation_inc_per_sec: u32,
    /// Adjusted-rating boost decay per second while connected.
    pub starvation_dec_per_sec: u32,
}

impl Default for RatingCfg {
    fn default() -> Self {
        RatingCfg {
            initial: 1024,
            max: 10240,
            reward_header: 64,
            reward_tx: 16,
            reward_block: 512,
            penalty_timeout: 256,
            penalty_network_err: 128,
            starvation_inc_per_sec: 1,
            starvation_dec_per_sec: 2,
        }
    }
}

/// All timeouts, in milliseconds unless suffixed otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutCfg {
    /// Header(-pack) request deadline.
    pub get_hdr_ms: u64,
    /// Block body(-pack) request deadline.
    pub get_block_ms: u64,
    /// Wanted-transaction expiry.
    pub get_tx_ms: u64,
    /// Wanted-bulletin expiry.
    pub get_bbs_msg_ms: u64,
    /// Period of the peer-manager activation pass.
    pub peers_update_ms: u64,
    /// Period of the address-book flush to the store.
    pub peers_flush_ms: u64,
    /// Period of peer recommendations to SEND_PEERS subscribers.
    pub recommend_ms: u64,
    /// Ban stickiness: a banned record is not dialed for this long.
    pub ban_ms: u64,
    /// Disconnects earlier than this after connect take the network penalty.
    pub early_disconnect_ms: u64,
    /// A known address newer than this is not replaced by an unverified one.
    pub addr_change_s: u64,
    /// Peers not seen for this long are not recommended to others.
    pub recommend_stale_s: u64,
}

impl Default for TimeoutCfg {
    fn default() -> Self {
        TimeoutCfg {
            get_hdr_ms: 20_000,
            get_block_ms: 30_000,
            get_tx_ms: 5_000,
            get_bbs_msg_ms: 10_000,
            peers_update_ms: 1_000,
            peers_flush_ms: 60_000,
            recommend_ms: 300_000,
            ban_ms: 10 * 60 * 1000,
            early_disconnect_ms: 2 * 60 * 1000,
            addr_change_s: 2 * 60 * 60,
            recommend_stale_s: 60 * 60,
        }
    }
}

/// Outbound-queue watermarks and request sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthCfg {
    /// Above this many unsent bytes, voluntary broadcasts pause (chocking).
    pub choke_bytes: usize,
    /// Above this, the connection is dropped outright.
    pub drown_bytes: usize,
    /// Most headers one GetHdrPack may ask for.
    pub hdr_pack_max: u32,
    /// Global cap on outstanding header-pack units.
    pub hdr_requests_max: u32,
    /// Most bodies one GetBodyPack may ask for.
    pub body_pack_max: u32,
    /// Global cap on peers concurrently transferring block bodies.
    pub blocks_concurrent_max: u32,
}

impl Default for BandwidthCfg {
    fn default() -> Self {
        BandwidthCfg {
            choke_bytes: 1024 * 1024,
            drown_bytes: 20 * 1024 * 1024,
            hdr_pack_max: 128,
            hdr_requests_max: 256,
            body_pack_max: 64,
            blocks_concurrent_max: 16,
        }
    }
}

/// Bulletin-board retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BbsCfg {
    pub enabled: bool,
    /// Hard age cap; older messages are evicted first.
    pub retention_s: u64,
    /// Soft total-bytes cap; largest-overrun eviction after age.
    pub store_soft_bytes: usize,
    /// Reject single messages above this.
    pub msg_max_bytes: usize,
    /// How far ahead of local time a posted message may claim to be.
    pub max_ahead_s: u64,
}

impl Default for BbsCfg {
    fn default() -> Self {
        BbsCfg {
            enabled: true,
            retention_s: 12 * 60 * 60,
            store_soft_bytes: 128 * 1024 * 1024,
            msg_max_bytes: 1024 * 1024,
            max_ahead_s: 2 * 60 * 60,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP listen address. Port 0 lets the OS pick (tests).
    pub listen: NetAddr,
    /// Addresses to dial on startup, before discovery kicks in.
    pub connect: Vec<NetAddr>,
    /// Hash of the consensus rule set; peers with a different one are
    /// incompatible and banned on login.
    pub rules_hash: Hash,
    /// How many top-rated peers to keep active.
    pub desired_highest: u32,
    /// Total active-peer budget (top-rated plus starvation-adjusted).
    pub desired_total: u32,
    /// UDP beacon period; 0 disables the beacon.
    pub beacon_period_ms: u64,
    /// UDP beacon port; 0 means "use the listen port".
    pub beacon_port: u16,
    /// Capability bits we announce in our Login.
    pub login_flags: u32,
    /// Identities whose Owner proof unlocks the owner-restricted messages.
    pub owner_keys: Vec<crate::types::PeerId>,
    /// Identities granted the (weaker) Viewer capability.
    pub viewer_keys: Vec<crate::types::PeerId>,
    /// Fast-sync horizon parameters, if a bulk sync is in progress.
    pub fast_sync: Option<FastSyncWindow>,
    pub rating: RatingCfg,
    pub timeout: TimeoutCfg,
    pub bandwidth: BandwidthCfg,
    pub bbs: BbsCfg,
}

/// Height window inside which block bodies are requested with reduced
/// proof detail, to be validated in bulk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FastSyncWindow {
    pub h0: u64,
    pub horizon_lo: u64,
    pub target: crate::types::BlockId,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: NetAddr { ip: [0, 0, 0, 0], port: crate::types::DEFAULT_PORT },
            connect: Vec::new(),
            rules_hash: [0u8; 32],
            desired_highest: 5,
            desired_total: 10,
            beacon_period_ms: 10_000,
            beacon_port: 0,
            login_flags: crate::types::login_flags::SPREAD_TXS
                | crate::types::login_flags::BBS
                | crate::types::login_flags::SEND_PEERS,
            owner_keys: Vec::new(),
            viewer_keys: Vec::new(),
            fast_sync: None,
            rating: RatingCfg::default(),
            timeout: TimeoutCfg::default(),
            bandwidth: BandwidthCfg::default(),
            bbs: BbsCfg::default(),
        }
    }
}

impl Config {
    /// Effective beacon port.
    pub fn beacon_port(&self) -> u16 {
        if self.beacon_port != 0 { self.beacon_port } else { self.listen.port }
    }
}
