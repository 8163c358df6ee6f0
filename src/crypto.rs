//! Thin wrappers over RustCrypto crates for the primitives spec.md
//! consumes rather than implements: ECDSA-P256 signature verification,
//! ECDH-P256 key agreement, SHA-256 hashing/KDF1, and AES-128-CTR
//! streaming. No primitive is implemented here, only called.

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use digest::Digest;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::{EncodedPoint, PublicKey, SecretKey};
use sha2::Sha256;

pub const HASH_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;
pub const PUBKEY_BYTES: usize = 64;
pub const AES_KEY_SIZE: usize = 16;
pub const AES_BLOCK_SIZE: usize = 16;

/// Root public keys compiled into the bootloader; any one of them
/// accepting a signature suffices (spec.md §4.3 step 4). Real
/// deployments replace these with their actual signing keys, the same
/// way the teacher embeds its own key material as a build-time constant.
pub static ROOT_PUBLIC_KEYS: &[[u8; PUBKEY_BYTES]] = &[[0u8; PUBKEY_BYTES]];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoError;

/// SHA-256 over `data`.
pub fn hash(data: &[u8]) -> [u8; HASH_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Streaming SHA-256, for hashing an image body read from flash in
/// chunks rather than held in memory at once.
pub struct HashStream(Sha256);

impl HashStream {
    pub fn new() -> Self {
        HashStream(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; HASH_BYTES] {
        self.0.finalize().into()
    }
}

impl Default for HashStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies an ECDSA-P256 signature over a precomputed SHA-256 digest
/// against one compiled-in root public key. Returns `true` on the first
/// key that accepts.
pub fn verify_against_roots(digest: &[u8; HASH_BYTES], signature: &[u8; SIGNATURE_BYTES]) -> bool {
    ROOT_PUBLIC_KEYS.iter().any(|key| verify_one(digest, signature, key))
}

fn verify_one(digest: &[u8; HASH_BYTES], signature: &[u8; SIGNATURE_BYTES], pubkey: &[u8; PUBKEY_BYTES]) -> bool {
    let Some(verifying_key) = decode_public_key(pubkey) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    VerifyingKey::from(&verifying_key)
        .verify_prehash(digest, &sig)
        .is_ok()
}

fn decode_public_key(pubkey: &[u8; PUBKEY_BYTES]) -> Option<PublicKey> {
    let encoded = EncodedPoint::from_affine_coordinates(
        pubkey[0..32].into(),
        pubkey[32..64].into(),
        false,
    );
    PublicKey::from_encoded_point(&encoded).into_option()
}

/// `KDF1_SHA256(secret || ext) = SHA256(secret || ext)`, split into a
/// 16-byte AES key and a 16-byte CTR nonce.
fn kdf1(shared_secret: &[u8], ext: u8) -> ([u8; AES_KEY_SIZE], [u8; AES_KEY_SIZE]) {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update([ext]);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut key = [0u8; AES_KEY_SIZE];
    let mut nonce = [0u8; AES_KEY_SIZE];
    key.copy_from_slice(&digest[0..16]);
    nonce.copy_from_slice(&digest[16..32]);
    (key, nonce)
}

/// Derives `{key, nonce}` from `KDF1_SHA256(ECDH(bootloader_priv,
/// ephemeral_pub))` (spec.md §3.3, §4.3 step 6).
pub fn derive_encryption_key(
    bootloader_priv: &[u8; 32],
    ephemeral_pub: &[u8; PUBKEY_BYTES],
) -> Result<([u8; AES_KEY_SIZE], [u8; AES_KEY_SIZE]), CryptoError> {
    let secret = SecretKey::from_bytes(bootloader_priv.into()).map_err(|_| CryptoError)?;
    let public = decode_public_key(ephemeral_pub).ok_or(CryptoError)?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    Ok(kdf1(shared.raw_secret_bytes(), 0))
}

/// AES-128-CTR stream over the image body, seekable by byte offset so
/// the counter can be advanced by whole blocks before resuming at an
/// arbitrary sector boundary (spec.md §4.4 "AES-CTR stream alignment").
pub struct CtrStream(ctr::Ctr128BE<aes::Aes128>);

impl CtrStream {
    pub fn new(key: &[u8; AES_KEY_SIZE], nonce: &[u8; AES_KEY_SIZE]) -> Self {
        CtrStream(ctr::Ctr128BE::<aes::Aes128>::new(key.into(), nonce.into()))
    }

    /// Advances (or rewinds) the keystream position to `byte_offset`
    /// bytes from the start of the stream.
    pub fn seek(&mut self, byte_offset: u64) {
        self.0.seek(byte_offset);
    }

    /// XORs `buf` in place with the keystream at the current position,
    /// advancing it by `buf.len()` bytes.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}
