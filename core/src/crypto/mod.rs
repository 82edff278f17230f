// Cryptography: keccak digests, key addresses and salted signatures
//
// Signing flow:
// 1. Append a 32-byte random salt to the canonical bytes
// 2. hash = keccak256(bytes || salt)
// 3. sig = ed25519(hash)
//
// Verification recomputes the hash, checks the signature and then checks
// that the public key belongs to the claimed doer: either the key address is
// the head of the doer id, or a parent key with that address attests to it.

pub mod envelope;
pub mod keys;

use crate::types::{Address, PttID};
use crate::{PttError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha3::{Digest, Keccak256};

pub use envelope::{checksum_data, decrypt_data, encrypt_data, verify_checksum};
pub use keys::{derive_child_key, KeyExtraInfo, KeyInfo};

pub const SIZE_HASH: usize = 32;

pub fn keccak256(data: &[u8]) -> [u8; SIZE_HASH] {
    Keccak256::digest(data).into()
}

pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; SIZE_HASH] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Address of a public key: the last 20 bytes of its keccak256 digest.
pub fn pubkey_to_address(pubkey: &[u8]) -> Address {
    let hash = keccak256(pubkey);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[SIZE_HASH - 20..]);
    Address(addr)
}

/// Address of an arbitrary digest, used for Merkle node addresses.
pub fn hash_to_address(hash: &[u8]) -> Address {
    let mut addr = [0u8; 20];
    let start = hash.len().saturating_sub(20);
    let tail = &hash[start..];
    addr[20 - tail.len()..].copy_from_slice(tail);
    Address(addr)
}

pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

pub fn generate_signing_key() -> SigningKey {
    use zeroize::Zeroize;
    let mut secret_key_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
    let signing_key = SigningKey::from_bytes(&secret_key_bytes);
    secret_key_bytes.zeroize();
    signing_key
}

pub fn signing_key_from_bytes(bytes: &[u8]) -> Result<SigningKey> {
    let secret: [u8; 32] = bytes
        .try_into()
        .map_err(|_| PttError::Crypto("invalid secret key".to_string()))?;
    Ok(SigningKey::from_bytes(&secret))
}

/// Result of a salted signature.
#[derive(Debug, Clone)]
pub struct SignedData {
    pub bytes_with_salt: Vec<u8>,
    pub hash: Vec<u8>,
    pub sig: Vec<u8>,
    pub pubkey: Vec<u8>,
}

impl SignedData {
    pub fn salt(&self, bytes_len: usize) -> &[u8] {
        &self.bytes_with_salt[bytes_len.min(self.bytes_with_salt.len())..]
    }
}

pub fn sign_data(bytes: &[u8], key: &SigningKey) -> SignedData {
    let salt = random_bytes(crate::config::SIZE_SALT);
    sign_data_with_salt(bytes, &salt, key)
}

pub fn sign_data_with_salt(bytes: &[u8], salt: &[u8], key: &SigningKey) -> SignedData {
    let mut bytes_with_salt = Vec::with_capacity(bytes.len() + salt.len());
    bytes_with_salt.extend_from_slice(bytes);
    bytes_with_salt.extend_from_slice(salt);

    let hash = keccak256(&bytes_with_salt);
    let sig = key.sign(&hash);

    SignedData {
        bytes_with_salt,
        hash: hash.to_vec(),
        sig: sig.to_bytes().to_vec(),
        pubkey: key.verifying_key().to_bytes().to_vec(),
    }
}

pub fn verify_signature(pubkey: &[u8], msg: &[u8], sig: &[u8]) -> Result<()> {
    let pubkey: [u8; 32] = pubkey.try_into().map_err(|_| PttError::InvalidSign)?;
    let verifying_key = VerifyingKey::from_bytes(&pubkey).map_err(|_| PttError::InvalidSign)?;
    let sig: [u8; 64] = sig.try_into().map_err(|_| PttError::InvalidSign)?;
    verifying_key
        .verify(msg, &Signature::from_bytes(&sig))
        .map_err(|_| PttError::InvalidSign)
}

/// Checks hash, signature, and that `pubkey` belongs to `doer_id`.
pub fn verify_data(
    bytes_with_salt: &[u8],
    hash: &[u8],
    sig: &[u8],
    pubkey: &[u8],
    doer_id: &PttID,
    extra: Option<&KeyExtraInfo>,
) -> Result<()> {
    if keccak256(bytes_with_salt).as_slice() != hash {
        return Err(PttError::InvalidSign);
    }
    verify_signature(pubkey, hash, sig)?;
    verify_key_owner(pubkey, doer_id, extra)
}

pub fn verify_key_owner(pubkey: &[u8], doer_id: &PttID, extra: Option<&KeyExtraInfo>) -> Result<()> {
    if pubkey_to_address(pubkey) == doer_id.address() {
        return Ok(());
    }
    match extra {
        Some(extra) if pubkey_to_address(&extra.parent_pubkey) == doer_id.address() => {
            extra.verify_child(pubkey)
        }
        _ => Err(PttError::InvalidKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_known_vector() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(keccak256(b"abcd"), keccak256_concat(&[b"ab", b"cd"]));
    }

    #[test]
    fn test_sign_and_verify_own_key() {
        let key = generate_signing_key();
        let addr = pubkey_to_address(key.verifying_key().as_bytes());
        let doer = PttID::from_pubkey_address(&addr);

        let signed = sign_data(b"payload", &key);
        assert_eq!(signed.salt(7).len(), crate::config::SIZE_SALT);
        verify_data(
            &signed.bytes_with_salt,
            &signed.hash,
            &signed.sig,
            &signed.pubkey,
            &doer,
            None,
        )
        .unwrap();
    }

    #[test]
    fn test_verify_rejects_foreign_doer_and_tampering() {
        let key = generate_signing_key();
        let signed = sign_data(b"payload", &key);
        let stranger = PttID::random();
        assert_eq!(
            verify_data(
                &signed.bytes_with_salt,
                &signed.hash,
                &signed.sig,
                &signed.pubkey,
                &stranger,
                None
            ),
            Err(PttError::InvalidKey)
        );

        let doer = PttID::from_pubkey_address(&pubkey_to_address(&signed.pubkey));
        let mut tampered = signed.bytes_with_salt.clone();
        tampered[0] ^= 1;
        assert_eq!(
            verify_data(&tampered, &signed.hash, &signed.sig, &signed.pubkey, &doer, None),
            Err(PttError::InvalidSign)
        );
    }

    #[test]
    fn test_verify_child_key_through_extra() {
        let parent = generate_signing_key();
        let user_id = PttID::from_pubkey_address(&pubkey_to_address(parent.verifying_key().as_bytes()));
        let (child, extra) = derive_child_key(&parent).unwrap();

        let signed = sign_data(b"hello", &child);
        verify_data(
            &signed.bytes_with_salt,
            &signed.hash,
            &signed.sig,
            &signed.pubkey,
            &user_id,
            Some(&extra),
        )
        .unwrap();
    }
}
