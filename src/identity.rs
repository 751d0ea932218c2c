//! # Node Identity and Cryptographic Envelope
//!
//! This module defines the identity types used throughout weft:
//!
//! - [`NodeId`]: 128-bit identifier derived from the peer's public key
//! - [`Keypair`]: RSA keypair owned by the local node (sign + decrypt)
//! - [`PublicKey`]: a peer's RSA public key with its canonical X.509 encoding
//! - [`PeerEnvelope`]: per-peer asymmetric operations (encrypt + verify)
//!
//! ## Identity Model
//!
//! A node's identity is not the key itself but a name-based (version 3) UUID
//! computed over the key's X.509 SubjectPublicKeyInfo encoding. The id is
//! deterministic and collision-resistant against honest parties, but it is
//! not cryptographically binding: two parties can claim the same fingerprint.
//! Disputes are settled by challenging the claimant to decrypt a nonce sealed
//! to the claimed key (see [`seal_challenge`]).
//!
//! ## Distance Metric
//!
//! Routing uses the XOR metric in its bit-length form:
//! `distance(a, b) = bit_length(a ^ b)`, ranging over `[0, 128]` and zero
//! exactly when the ids are equal. See [`NodeId::distance`].
//!
//! ## Envelope Limits
//!
//! The asymmetric channel seals at most one RSA block (modulus length minus
//! the PKCS#1 v1.5 padding overhead). It exists for handshake sealing and
//! key wrapping; anything larger belongs in a negotiated symmetric session.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Default RSA modulus size for newly generated identities.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Smallest modulus accepted for peer keys.
///
/// Tests with the `test-keys` feature lower the floor so suites can generate
/// keypairs in milliseconds while still exercising every crypto code path.
#[cfg(not(any(test, feature = "test-keys")))]
pub const MIN_KEY_BITS: usize = 2048;

#[cfg(any(test, feature = "test-keys"))]
pub const MIN_KEY_BITS: usize = 512;

/// PKCS#1 v1.5 padding overhead in bytes; the envelope seals at most
/// `modulus_len - PKCS1_OVERHEAD` bytes per call.
const PKCS1_OVERHEAD: usize = 11;

/// Namespace for the name-based id derivation. Fixed for the lifetime of the
/// protocol; changing it re-keys the entire id space.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x8d4d_7e6a_1f02_4c33_9a50_b6e1_83f7_21cd);

/// Bytes of the key digest exposed as the human-readable fingerprint.
const FINGERPRINT_LEN: usize = 8;

/// Nonce length for identity challenges.
const CHALLENGE_NONCE_LEN: usize = 24;

// ============================================================================
// Error Types
// ============================================================================

/// Failures raised by the asymmetric envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Signature did not verify against the peer's public key.
    BadSignature,
    /// Local private-key decryption failed (wrong key or corrupt block).
    DecryptFailure,
    /// Sealing failed, typically because the plaintext exceeds one RSA block.
    EncryptFailure,
    /// Signing failed in the underlying RSA implementation.
    SignFailure,
    /// Key bytes did not parse as an X.509 SubjectPublicKeyInfo RSA key.
    MalformedKey,
    /// Key modulus is below the accepted floor.
    KeyTooSmall { bits: usize },
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::BadSignature => write!(f, "signature verification failed"),
            CryptoError::DecryptFailure => write!(f, "decryption failed"),
            CryptoError::EncryptFailure => {
                write!(f, "encryption failed (payload too large for one RSA block?)")
            }
            CryptoError::SignFailure => write!(f, "signing failed"),
            CryptoError::MalformedKey => write!(f, "malformed public key encoding"),
            CryptoError::KeyTooSmall { bits } => {
                write!(f, "key modulus of {} bits is below the {} bit floor", bits, MIN_KEY_BITS)
            }
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// NodeId
// ============================================================================

/// 128-bit node identifier.
///
/// Equality is bit-equality; ordering is only meaningful through
/// [`NodeId::distance`]. The `Ord` impl exists solely for deterministic
/// tie-breaking during lookups (lowest numeric id wins).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u128);

impl NodeId {
    /// Derive the identifier for a public key from its X.509
    /// SubjectPublicKeyInfo encoding.
    pub fn from_public_key_der(der: &[u8]) -> Self {
        Self(Uuid::new_v3(&ID_NAMESPACE, der).as_u128())
    }

    #[inline]
    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    #[inline]
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    #[inline]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid.as_u128())
    }

    #[inline]
    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_u128(self.0)
    }

    /// XOR distance in bit-length form: the index of the most significant
    /// differing bit plus one. `0` iff the ids are equal, at most `128`.
    #[inline]
    pub fn distance(&self, other: &NodeId) -> u32 {
        128 - (self.0 ^ other.0).leading_zeros()
    }

    /// Raw XOR of the two ids, for full-precision closeness comparisons
    /// within a single distance bucket.
    #[inline]
    pub fn xor(&self, other: &NodeId) -> u128 {
        self.0 ^ other.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// Public Key
// ============================================================================

/// A peer's RSA public key together with its canonical encoding and the
/// identifier derived from it.
///
/// The derived id is computed once at construction; the invariant
/// `id == NodeId::from_public_key_der(der)` therefore holds for every
/// instance by construction and is never trusted from the wire.
#[derive(Clone)]
pub struct PublicKey {
    key: RsaPublicKey,
    der: Vec<u8>,
    id: NodeId,
}

impl PublicKey {
    /// Parse a key from its X.509 SubjectPublicKeyInfo encoding.
    ///
    /// Rejects moduli below [`MIN_KEY_BITS`].
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_der(der).map_err(|_| CryptoError::MalformedKey)?;
        let bits = key.n().bits();
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyTooSmall { bits });
        }
        let id = NodeId::from_public_key_der(der);
        Ok(Self { key, der: der.to_vec(), id })
    }

    fn from_rsa(key: RsaPublicKey) -> Result<Self, CryptoError> {
        let der = key
            .to_public_key_der()
            .map_err(|_| CryptoError::MalformedKey)?
            .as_bytes()
            .to_vec();
        let id = NodeId::from_public_key_der(&der);
        Ok(Self { key, der, id })
    }

    /// The canonical X.509 SubjectPublicKeyInfo bytes.
    #[inline]
    pub fn encoded_der(&self) -> &[u8] {
        &self.der
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Compact textual digest of the key, for display and early mismatch
    /// detection. Not unique; see the module docs on challenges.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.der)
    }

    /// Largest plaintext the envelope can seal to this key in one block.
    #[inline]
    pub fn max_sealed_len(&self) -> usize {
        self.key.size().saturating_sub(PKCS1_OVERHEAD)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Fingerprint of a key given its SubjectPublicKeyInfo encoding.
pub fn fingerprint_of(der: &[u8]) -> String {
    hex::encode(&blake3::hash(der).as_bytes()[..FINGERPRINT_LEN])
}

// ============================================================================
// Peer Envelope (encrypt + verify)
// ============================================================================

/// Asymmetric operations available against a remote peer: sealing short
/// payloads to its key and verifying its signatures.
///
/// One envelope exists per peer entry; the underlying key material is
/// immutable and every call is independent, so the envelope is freely
/// shared across tasks.
#[derive(Clone, Debug)]
pub struct PeerEnvelope {
    public_key: PublicKey,
}

impl PeerEnvelope {
    pub fn new(public_key: PublicKey) -> Self {
        Self { public_key }
    }

    #[inline]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Seal a short payload to the peer's key (RSA PKCS#1 v1.5, one block).
    ///
    /// Suitable only for handshake sealing and key wrapping; payloads above
    /// [`PublicKey::max_sealed_len`] fail with
    /// [`CryptoError::EncryptFailure`].
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > self.public_key.max_sealed_len() {
            return Err(CryptoError::EncryptFailure);
        }
        self.public_key
            .key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
            .map_err(|_| CryptoError::EncryptFailure)
    }

    /// Verify an RSA PKCS#1 v1.5 / SHA-256 signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let digest = Sha256::digest(data);
        self.public_key
            .key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

// ============================================================================
// Local Keypair (sign + decrypt)
// ============================================================================

/// The local node's RSA keypair.
///
/// Holds the private key for the process lifetime; key rotation is out of
/// scope. Signing and decryption keep no state between calls.
#[derive(Clone)]
pub struct Keypair {
    private: RsaPrivateKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a keypair with the default modulus size.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(DEFAULT_KEY_BITS)
    }

    /// Generate a keypair with an explicit modulus size.
    ///
    /// Sizes below [`MIN_KEY_BITS`] are rejected.
    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyTooSmall { bits });
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(|_| CryptoError::SignFailure)?;
        let public = PublicKey::from_rsa(private.to_public_key())?;
        Ok(Self { private, public })
    }

    #[inline]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.public.id()
    }

    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    /// Envelope for sealing data to ourselves, used by loopback challenges
    /// and tests.
    pub fn envelope(&self) -> PeerEnvelope {
        PeerEnvelope::new(self.public.clone())
    }

    /// Open a block previously sealed to our public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| CryptoError::DecryptFailure)
    }

    /// Sign `data` with RSA PKCS#1 v1.5 / SHA-256.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(data);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|_| CryptoError::SignFailure)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("id", &self.public.id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Identity Challenge
// ============================================================================

/// Seal a fresh random nonce to a claimed public key.
///
/// Returns `(nonce, sealed)`. A peer proving ownership of the key answers
/// with the decrypted nonce; the caller compares it against the retained
/// copy. This is the out-of-band resolution for fingerprint or id collisions.
pub fn seal_challenge(key: &PublicKey) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut nonce = vec![0u8; CHALLENGE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = PeerEnvelope::new(key.clone()).encrypt(&nonce)?;
    Ok((nonce, sealed))
}
