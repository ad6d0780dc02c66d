//! Wire message catalog.
//!
//! Every frame carries one of these messages; the frame header's type byte
//! is the catalog code and the payload is the postcard encoding of the
//! variant's body. Each code has a {min, max} payload-size policy that the
//! codec enforces before any deserialization touches the bytes.

use crate::types::{BlockId, Hash, NetAddr, PeerId, Tip};
use serde::{Deserialize, Serialize};

/// Most headers a single HdrPack may carry.
pub const HDR_PACK_MAX: u32 = 128;

/// Largest serialized block body we accept.
pub const BODY_MAX_BYTES: u32 = 4 * 1024 * 1024;

/// Largest body-pack frame (several diluted bodies in one message).
pub const BODY_PACK_MAX_BYTES: u32 = 16 * 1024 * 1024;

/// Largest opaque proof blob.
pub const PROOF_MAX_BYTES: u32 = 1024 * 1024;

/// Largest serialized transaction.
pub const TX_MAX_BYTES: u32 = 1024 * 1024;

/// Largest bulletin payload (also policed by `BbsCfg::msg_max_bytes`).
pub const BBS_MAX_BYTES: u32 = 1024 * 1024;

// Worst-case postcard varint widths.
const V32: u32 = 5;
const V64: u32 = 10;
const V128: u32 = 19;

// Serialized sizes of the fixed-layout pieces.
const TIP_MIN: u32 = 1 + 32 + 32 + 1 + 1;
const TIP_MAX: u32 = V64 + 32 + 32 + V128 + V64;
const BLOCK_ID_MIN: u32 = 1 + 32;
const BLOCK_ID_MAX: u32 = V64 + 32;

mod sig_serde {
    //! ed25519 signatures are 64 bytes; serde has no array impl that wide,
    //! so they travel as a length-checked byte vector.
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        sig.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        v.try_into().map_err(|_| serde::de::Error::custom("bad signature length"))
    }
}

// =============================================================================
// PAYLOAD BODIES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub rules_hash: Hash,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    pub reason: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SChannelInitiate {
    pub nonce_pub: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    pub id: PeerId,
    pub id_type: u8,
    #[serde(with = "sig_serde")]
    pub sig: [u8; 64],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfoSelf {
    /// Advertised listening port; 0 means inbound-only.
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub last_addr: NetAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAddr {
    /// The IPv4 we observe the peer connecting from.
    pub ip: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Time {
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boolean {
    pub value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTip {
    pub tip: Tip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHdr {
    pub id: BlockId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hdr {
    pub hdr: Tip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHdrPack {
    pub top: BlockId,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdrPack {
    /// Headers in descending height order, starting at the requested top.
    pub headers: Vec<Tip>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBody {
    pub id: BlockId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBodyPack {
    pub top: BlockId,
    /// How many bodies below `top` to include.
    pub count_extra: u64,
    /// Fast-sync bounds; zero when requesting outside the window.
    pub h0: u64,
    pub horizon_lo: u64,
    pub horizon_hi: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPack {
    /// Bodies in ascending height order ending at the requested top.
    pub bodies: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProofState {
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofState {
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProofKernel {
    pub id: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofKernel {
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProofUtxo {
    pub utxo: Vec<u8>,
    /// Non-zero when a previous result was truncated and the query resumes.
    pub maturity_min: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofUtxo {
    pub proofs: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProofChainWork {
    pub lower_bound: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofChainWork {
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCommonState {
    /// Candidate states, best first; the responder proves the first it has.
    pub ids: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofCommonState {
    pub i_state: u32,
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetEvents {
    pub height_min: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Events {
    pub events: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsSerif {
    pub height: u64,
    pub value: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockFinalization {
    pub height: u64,
    pub fees: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFinalization {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub tx: Vec<u8>,
    /// False while the transaction is still in its private stem phase.
    pub fluff: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaveTransaction {
    pub id: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTransaction {
    pub id: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbsMsg {
    pub channel: u32,
    pub time_posted: u64,
    pub payload: Vec<u8>,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbsHaveMsg {
    pub key: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbsGetMsg {
    pub key: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbsSubscribe {
    pub channel: u32,
    pub time_from: u64,
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbsPickChannelRes {
    pub channel: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbsResetSync {
    pub time_from: u64,
}

// =============================================================================
// THE CATALOG
// =============================================================================

macro_rules! catalog {
    ($( $code:literal => $variant:ident ( $body:ty ), $name:literal, $min:expr, $max:expr; )*) => {
        /// One decoded wire message.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Msg {
            $( $variant($body), )*
        }

        impl Msg {
            /// Wire type byte.
            pub fn code(&self) -> u8 {
                match self {
                    $( Msg::$variant(_) => $code, )*
                }
            }

            /// Human name for log lines.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Msg::$variant(_) => $name, )*
                }
            }

            /// Serialize the payload body (header and MAC are the codec's job).
            pub fn encode_payload(&self) -> Result<Vec<u8>, MsgError> {
                match self {
                    $( Msg::$variant(b) => postcard::to_allocvec(b).map_err(|_| MsgError::Encode), )*
                }
            }

            /// Deserialize a payload for a known code. The caller has already
            /// checked the size policy; trailing bytes are still a corruption.
            pub fn decode(code: u8, payload: &[u8]) -> Result<Msg, MsgError> {
                match code {
                    $(
                        $code => {
                            let (body, rest) = postcard::take_from_bytes::<$body>(payload)
                                .map_err(|_| MsgError::Corrupt(code))?;
                            if !rest.is_empty() {
                                return Err(MsgError::Corrupt(code));
                            }
                            Ok(Msg::$variant(body))
                        }
                    )*
                    _ => Err(MsgError::UnknownType(code)),
                }
            }
        }

        /// Per-type payload-size policy (excluding the MAC).
        pub fn size_policy(code: u8) -> Option<SizePolicy> {
            match code {
                $( $code => Some(SizePolicy { min: $min, max: $max }), )*
                _ => None,
            }
        }

        #[cfg(test)]
        pub(crate) const ALL_CODES: &[u8] = &[ $( $code, )* ];
    };
}

/// Unit body for messages that carry nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty;

catalog! {
    0x00 => Login(Login),                       "login",          33, 32 + V32;
    0x01 => Bye(Bye),                           "bye",            1, 1;
    0x02 => Ping(Empty),                        "ping",           0, 0;
    0x03 => Pong(Empty),                        "pong",           0, 0;
    0x04 => SChannelInitiate(SChannelInitiate), "schannel-init",  32, 32;
    0x05 => SChannelReady(Empty),               "schannel-ready", 0, 0;
    0x06 => Authentication(Authentication),     "authentication", 98, 98;
    0x07 => PeerInfoSelf(PeerInfoSelf),         "peer-info-self", 1, 3;
    0x08 => PeerInfo(PeerInfo),                 "peer-info",      37, 32 + 4 + 3;
    0x09 => GetExternalAddr(Empty),             "get-ext-addr",   0, 0;
    0x0a => ExternalAddr(ExternalAddr),         "ext-addr",       4, 4;
    0x0b => GetTime(Empty),                     "get-time",       0, 0;
    0x0c => Time(Time),                         "time",           1, V64;
    0x0d => DataMissing(Empty),                 "data-missing",   0, 0;
    0x0e => Boolean(Boolean),                   "boolean",        1, 1;
    0x10 => NewTip(NewTip),                     "new-tip",        TIP_MIN, TIP_MAX;
    0x11 => GetHdr(GetHdr),                     "get-hdr",        BLOCK_ID_MIN, BLOCK_ID_MAX;
    0x12 => Hdr(Hdr),                           "hdr",            TIP_MIN, TIP_MAX;
    0x13 => GetHdrPack(GetHdrPack),             "get-hdr-pack",   BLOCK_ID_MIN + 1, BLOCK_ID_MAX + V32;
    0x14 => HdrPack(HdrPack),                   "hdr-pack",       1, V32 + HDR_PACK_MAX * TIP_MAX;
    0x15 => GetBody(GetBody),                   "get-body",       BLOCK_ID_MIN, BLOCK_ID_MAX;
    0x16 => Body(Body),                         "body",           1, V32 + BODY_MAX_BYTES;
    0x20 => GetBodyPack(GetBodyPack),           "get-body-pack",  BLOCK_ID_MIN + 4, BLOCK_ID_MAX + 4 * V64;
    0x21 => BodyPack(BodyPack),                 "body-pack",      1, BODY_PACK_MAX_BYTES;
    0x17 => GetProofState(GetProofState),       "get-proof-state", 1, V64;
    0x18 => ProofState(ProofState),             "proof-state",    1, V32 + PROOF_MAX_BYTES;
    0x19 => GetProofKernel(GetProofKernel),     "get-proof-kernel", 32, 32;
    0x1a => ProofKernel(ProofKernel),           "proof-kernel",   1, V32 + PROOF_MAX_BYTES;
    0x1b => GetProofUtxo(GetProofUtxo),         "get-proof-utxo", 2, V32 + 4096 + V64;
    0x1c => ProofUtxo(ProofUtxo),               "proof-utxo",     1, V32 + PROOF_MAX_BYTES;
    0x1d => GetProofChainWork(GetProofChainWork), "get-proof-chainwork", 1, V128;
    0x1e => ProofChainWork(ProofChainWork),     "proof-chainwork", 1, V32 + PROOF_MAX_BYTES;
    0x22 => GetCommonState(GetCommonState),     "get-common-state", 1, V32 + 64 * BLOCK_ID_MAX;
    0x23 => ProofCommonState(ProofCommonState), "proof-common-state", 2, V32 + V32 + PROOF_MAX_BYTES;
    0x28 => GetEvents(GetEvents),               "get-events",     1, V64;
    0x29 => Events(Events),                     "events",         1, V32 + PROOF_MAX_BYTES;
    0x2a => EventsSerif(EventsSerif),           "events-serif",   33, V64 + 32;
    0x2b => GetBlockFinalization(GetBlockFinalization), "get-block-finalization", 2, 2 * V64;
    0x2c => BlockFinalization(BlockFinalization), "block-finalization", 1, V32 + BODY_MAX_BYTES;
    0x30 => NewTransaction(NewTransaction),     "new-transaction", 2, V32 + TX_MAX_BYTES + 1;
    0x31 => HaveTransaction(HaveTransaction),   "have-transaction", 32, 32;
    0x32 => GetTransaction(GetTransaction),     "get-transaction", 32, 32;
    0x38 => BbsMsg(BbsMsg),                     "bbs-msg",        4, V32 + V64 + V32 + BBS_MAX_BYTES + V64;
    0x39 => BbsHaveMsg(BbsHaveMsg),             "bbs-have-msg",   32, 32;
    0x3a => BbsGetMsg(BbsGetMsg),               "bbs-get-msg",    32, 32;
    0x3b => BbsSubscribe(BbsSubscribe),         "bbs-subscribe",  3, V32 + V64 + 1;
    0x3c => BbsPickChannel(Empty),              "bbs-pick-channel", 0, 0;
    0x3d => BbsPickChannelRes(BbsPickChannelRes), "bbs-pick-channel-res", 1, V32;
    0x3e => BbsResetSync(BbsResetSync),         "bbs-reset-sync", 1, V64;
}

/// Payload-size policy for one message code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePolicy {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MsgError {
    #[error("payload serialization failed")]
    Encode,
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("corrupt payload for type {0:#04x}")]
    Corrupt(u8),
}

impl Msg {
    /// Types that may travel before the secure channel is established.
    pub fn allowed_plaintext(code: u8) -> bool {
        matches!(code, 0x01 | 0x04)
    }

    /// The owner-restricted family, gated on an Owner identity proof.
    pub fn owner_restricted(code: u8) -> bool {
        matches!(code, 0x28..=0x2c)
    }

    pub const PING: Msg = Msg::Ping(Empty);
    pub const PONG: Msg = Msg::Pong(Empty);
    pub const DATA_MISSING: Msg = Msg::DataMissing(Empty);
}
