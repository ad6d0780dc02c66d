//! Secure channel: ephemeral Diffie-Hellman, per-direction stream cipher
//! and frame MAC, identity proof.
//!
//! Each connection generates a fresh x25519 nonce pair. The two 32-byte
//! nonce-publics travel in plaintext SChannelInitiate frames; everything
//! after is under ChaCha20 keyed from the shared secret, with an 8-byte
//! truncated HMAC-SHA3-256 per frame. Direction keys are domain-separated
//! by the sender's nonce-public, so A's transmit cipher is B's receive
//! cipher without any role negotiation.

use crate::types::{Hash, IdentityType, PeerId, MAC_SIZE};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha3 = Hmac<Sha3_256>;

const LABEL_KEY: &[u8] = b"weft.sc.key";
const LABEL_MAC: &[u8] = b"weft.sc.mac";
const LABEL_AUTH: &[u8] = b"weft.auth";

/// Cipher progress of one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No ciphers yet; only handshake frames are legal.
    Plaintext,
    /// We hold the secret: outbound is encrypted, inbound decrypts, but the
    /// peer has not yet proven it derived the same keys.
    Outgoing,
    /// Peer's SChannelReady arrived MAC-verified; fully established.
    Duplex,
}

struct Direction {
    cipher: ChaCha20,
    mac_key: [u8; 32],
}

impl Direction {
    fn new(secret: &[u8; 32], sender_pub: &[u8; 32]) -> Self {
        let key = derive(LABEL_KEY, secret, sender_pub);
        let iv = [0u8; 12];
        Direction {
            cipher: ChaCha20::new(&key.into(), &iv.into()),
            mac_key: derive(LABEL_MAC, secret, sender_pub),
        }
    }
}

fn derive(label: &[u8], secret: &[u8; 32], sender_pub: &[u8; 32]) -> [u8; 32] {
    let mut h = Sha3_256::new();
    h.update(label);
    h.update(secret);
    h.update(sender_pub);
    h.finalize().into()
}

/// Per-connection secure-channel state.
pub struct SChannel {
    nonce: StaticSecret,
    nonce_pub: [u8; 32],
    remote_nonce_pub: Option<[u8; 32]>,
    mode: Mode,
    tx: Option<Direction>,
    rx: Option<Direction>,
}

impl SChannel {
    pub fn new() -> Self {
        let nonce = StaticSecret::random_from_rng(OsRng);
        let nonce_pub = PublicKey::from(&nonce).to_bytes();
        SChannel {
            nonce,
            nonce_pub,
            remote_nonce_pub: None,
            mode: Mode::Plaintext,
            tx: None,
            rx: None,
        }
    }

    /// Our nonce-public, sent in SChannelInitiate.
    pub fn nonce_pub(&self) -> [u8; 32] {
        self.nonce_pub
    }

    /// The peer's nonce-public, once its SChannelInitiate arrived. This is
    /// what our own identity proof signs over.
    pub fn remote_nonce_pub(&self) -> Option<[u8; 32]> {
        self.remote_nonce_pub
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Install both direction ciphers from the peer's nonce-public.
    ///
    /// From this point outbound frames are encrypted and inbound bytes are
    /// decrypted; the mode stays `Outgoing` until the peer's Ready frame
    /// survives MAC verification.
    pub fn init_ciphers(&mut self, remote_nonce_pub: &[u8; 32]) {
        let secret = self
            .nonce
            .diffie_hellman(&PublicKey::from(*remote_nonce_pub))
            .to_bytes();
        self.tx = Some(Direction::new(&secret, &self.nonce_pub));
        self.rx = Some(Direction::new(&secret, remote_nonce_pub));
        self.remote_nonce_pub = Some(*remote_nonce_pub);
        self.mode = Mode::Outgoing;
    }

    /// Peer's SChannelReady decrypted and verified.
    pub fn on_ready(&mut self) {
        self.mode = Mode::Duplex;
    }

    pub fn is_secure_out(&self) -> bool {
        self.tx.is_some()
    }

    pub fn is_secure_in(&self) -> bool {
        self.rx.is_some()
    }

    /// Advance the outbound keystream over `data` in place. Identity before
    /// the ciphers are installed.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        if let Some(dir) = self.tx.as_mut() {
            dir.cipher.apply_keystream(data);
        }
    }

    /// Advance the inbound keystream over `data` in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        if let Some(dir) = self.rx.as_mut() {
            dir.cipher.apply_keystream(data);
        }
    }

    /// MAC length the peer appends to inbound frames in the current mode.
    pub fn mac_size_in(&self) -> usize {
        if self.rx.is_some() { MAC_SIZE } else { 0 }
    }

    /// MAC length we append to outbound frames in the current mode.
    pub fn mac_size_out(&self) -> usize {
        if self.tx.is_some() { MAC_SIZE } else { 0 }
    }

    /// MAC over an outbound header+payload (already encrypted).
    pub fn sign(&self, data: &[u8]) -> Option<[u8; MAC_SIZE]> {
        self.tx.as_ref().map(|dir| mac_trunc(&dir.mac_key, data))
    }

    /// Verify the MAC of an inbound header+payload (already decrypted).
    pub fn verify(&self, data: &[u8], mac: &[u8]) -> bool {
        match self.rx.as_ref() {
            Some(dir) => {
                let expect = mac_trunc(&dir.mac_key, data);
                // Truncated tags still compare in constant time.
                subtle_eq(&expect, mac)
            }
            None => mac.is_empty(),
        }
    }
}

fn mac_trunc(key: &[u8; 32], data: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = HmacSha3::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_SIZE];
    out.copy_from_slice(&full[..MAC_SIZE]);
    out
}

fn subtle_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

// =============================================================================
// IDENTITY
// =============================================================================

/// The node's long-lived signing identity. The 32-byte verifying key is the
/// [`PeerId`] everyone else sees.
pub struct IdentityKey {
    signing: SigningKey,
}

impl IdentityKey {
    pub fn generate() -> Self {
        IdentityKey { signing: SigningKey::generate(&mut OsRng) }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        IdentityKey { signing: SigningKey::from_bytes(secret) }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.signing.verifying_key().to_bytes())
    }

    /// Sign the channel-bound authentication challenge.
    ///
    /// The challenge commits to the *peer's* nonce-public, our identity and
    /// the claimed identity type; the peer recomputes it from its own
    /// nonce-public, so a signature cannot be replayed across connections.
    pub fn sign_auth(&self, peer_nonce_pub: &[u8; 32], id_type: IdentityType) -> [u8; 64] {
        let challenge = auth_challenge(peer_nonce_pub, &self.peer_id(), id_type as u8);
        self.signing.sign(&challenge).to_bytes()
    }
}

fn auth_challenge(nonce_pub: &[u8; 32], id: &PeerId, id_type: u8) -> Hash {
    let mut h = Sha3_256::new();
    h.update(LABEL_AUTH);
    h.update(nonce_pub);
    h.update(id.0);
    h.update([id_type]);
    h.finalize().into()
}

/// Verify a peer's Authentication frame against our own nonce-public.
pub fn verify_auth(id: &PeerId, id_type: u8, sig: &[u8; 64], own_nonce_pub: &[u8; 32]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(&id.0) else {
        return false;
    };
    let challenge = auth_challenge(own_nonce_pub, id, id_type);
    key.verify(&challenge, &Signature::from_bytes(sig)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (SChannel, SChannel) {
        let mut a = SChannel::new();
        let mut b = SChannel::new();
        let (ap, bp) = (a.nonce_pub(), b.nonce_pub());
        a.init_ciphers(&bp);
        b.init_ciphers(&ap);
        (a, b)
    }

    #[test]
    fn directions_pair_up() {
        let (mut a, mut b) = established_pair();

        let mut wire = b"the quick brown fox".to_vec();
        a.encrypt(&mut wire);
        assert_ne!(&wire, b"the quick brown fox");
        b.decrypt(&mut wire);
        assert_eq!(&wire, b"the quick brown fox");

        // and the opposite direction uses an independent keystream
        let mut wire2 = b"jumps over".to_vec();
        b.encrypt(&mut wire2);
        a.decrypt(&mut wire2);
        assert_eq!(&wire2, b"jumps over");
    }

    #[test]
    fn keystream_is_positional() {
        let (mut a, mut b) = established_pair();

        let mut w1 = vec![0u8; 10];
        let mut w2 = vec![0u8; 10];
        a.encrypt(&mut w1);
        a.encrypt(&mut w2);
        assert_ne!(w1, w2);

        b.decrypt(&mut w1);
        b.decrypt(&mut w2);
        assert_eq!(w1, vec![0u8; 10]);
        assert_eq!(w2, vec![0u8; 10]);
    }

    #[test]
    fn mac_rejects_tamper() {
        let (a, b) = established_pair();

        let frame = b"header+payload".to_vec();
        let mac = a.sign(&frame).unwrap();
        assert!(b.verify(&frame, &mac));

        let mut bad = mac;
        bad[0] ^= 1;
        assert!(!b.verify(&frame, &bad));

        let mut tampered = frame.clone();
        tampered[3] ^= 1;
        assert!(!b.verify(&tampered, &mac));
    }

    #[test]
    fn plaintext_mode_is_identity() {
        let mut c = SChannel::new();
        assert_eq!(c.mode(), Mode::Plaintext);
        assert_eq!(c.mac_size_in(), 0);

        let mut data = b"hello".to_vec();
        c.encrypt(&mut data);
        assert_eq!(&data, b"hello");
        assert!(c.verify(&data, &[]));
    }

    #[test]
    fn auth_round_trip() {
        let key = IdentityKey::generate();
        let peer_nonce = [7u8; 32];

        let sig = key.sign_auth(&peer_nonce, IdentityType::Node);
        assert!(verify_auth(&key.peer_id(), b'N', &sig, &peer_nonce));

        // wrong nonce (different connection) fails
        assert!(!verify_auth(&key.peer_id(), b'N', &sig, &[8u8; 32]));
        // wrong type tag fails
        assert!(!verify_auth(&key.peer_id(), b'O', &sig, &peer_nonce));
    }

    #[test]
    fn identity_restores_from_secret() {
        let key = IdentityKey::generate();
        let again = IdentityKey::from_bytes(&key.secret_bytes());
        assert_eq!(key.peer_id(), again.peer_id());
    }
}
