// Symmetric envelope and checksum
//
// enc_data = iv(16) || AES-256-CFB( pkcs7( op_be32 || payload ) )
// ev_with_salt = event_bytes || salt(32), checksum = keccak256(ev_with_salt)
//
// The checksum detects corruption only; it authenticates nothing.

use super::keys::KeyInfo;
use super::{keccak256, random_bytes, SIZE_HASH};
use crate::config::SIZE_SALT;
use crate::{PttError, Result};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

const BLOCK_SIZE: usize = 16;
const SIZE_OP: usize = 4;

fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = BLOCK_SIZE - buf.len() % BLOCK_SIZE;
    buf.extend(std::iter::repeat(pad as u8).take(pad));
}

fn pkcs7_unpad(buf: &mut Vec<u8>) -> Result<()> {
    let pad = *buf.last().ok_or(PttError::InvalidData)? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > buf.len() {
        return Err(PttError::InvalidData);
    }
    if !buf[buf.len() - pad..].iter().all(|b| *b as usize == pad) {
        return Err(PttError::InvalidData);
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}

pub fn encrypt_data(op: u32, data: &[u8], key: &KeyInfo) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(SIZE_OP + data.len() + BLOCK_SIZE);
    buf.extend_from_slice(&op.to_be_bytes());
    buf.extend_from_slice(data);
    pkcs7_pad(&mut buf);

    let iv = random_bytes(BLOCK_SIZE);
    Aes256CfbEnc::new_from_slices(key.cipher_key(), &iv)
        .map_err(|e| PttError::Crypto(e.to_string()))?
        .encrypt(&mut buf);

    let mut enc = iv;
    enc.extend_from_slice(&buf);
    Ok(enc)
}

pub fn decrypt_data(enc: &[u8], key: &KeyInfo) -> Result<(u32, Vec<u8>)> {
    if enc.len() < BLOCK_SIZE * 2 || (enc.len() - BLOCK_SIZE) % BLOCK_SIZE != 0 {
        return Err(PttError::InvalidData);
    }
    let (iv, body) = enc.split_at(BLOCK_SIZE);
    let mut buf = body.to_vec();
    Aes256CfbDec::new_from_slices(key.cipher_key(), iv)
        .map_err(|e| PttError::Crypto(e.to_string()))?
        .decrypt(&mut buf);

    pkcs7_unpad(&mut buf)?;
    if buf.len() < SIZE_OP {
        return Err(PttError::InvalidData);
    }
    let op = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok((op, buf.split_off(SIZE_OP)))
}

/// Returns `(event_bytes || salt, keccak256 of it)`.
pub fn checksum_data(ev_bytes: &[u8]) -> (Vec<u8>, [u8; SIZE_HASH]) {
    let mut ev_with_salt = Vec::with_capacity(ev_bytes.len() + SIZE_SALT);
    ev_with_salt.extend_from_slice(ev_bytes);
    ev_with_salt.extend_from_slice(&random_bytes(SIZE_SALT));
    let checksum = keccak256(&ev_with_salt);
    (ev_with_salt, checksum)
}

/// Verifies and strips the salt.
pub fn verify_checksum<'a>(ev_with_salt: &'a [u8], checksum: &[u8]) -> Result<&'a [u8]> {
    if ev_with_salt.len() < SIZE_SALT || keccak256(ev_with_salt).as_slice() != checksum {
        return Err(PttError::InvalidChecksum);
    }
    Ok(&ev_with_salt[..ev_with_salt.len() - SIZE_SALT])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;
    use crate::types::PttID;
    use proptest::prelude::*;

    fn test_key() -> KeyInfo {
        KeyInfo::from_signing_key(&generate_signing_key(), None, &PttID::random(), &PttID::random())
    }

    #[test]
    fn test_encrypt_roundtrip_with_block_aligned_payload() {
        let key = test_key();
        // 4-byte op + 12 bytes = exactly one block, so a whole pad block is added
        let data = vec![9u8; 12];
        let enc = encrypt_data(7, &data, &key).unwrap();
        assert_eq!(enc.len(), 16 + 32);
        assert_eq!(decrypt_data(&enc, &key).unwrap(), (7, data));
    }

    #[test]
    fn test_wrong_key_is_rejected_or_garbled() {
        let key = test_key();
        let other = test_key();
        let enc = encrypt_data(3, b"secret payload", &key).unwrap();
        match decrypt_data(&enc, &other) {
            Err(_) => {}
            Ok((op, data)) => assert!(op != 3 || data != b"secret payload"),
        }
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = test_key();
        assert_eq!(decrypt_data(&[0u8; 16], &key), Err(PttError::InvalidData));
        assert_eq!(decrypt_data(&[0u8; 40], &key), Err(PttError::InvalidData));
    }

    #[test]
    fn test_checksum_bit_flip() {
        let (ev_with_salt, checksum) = checksum_data(b"event bytes");
        assert_eq!(verify_checksum(&ev_with_salt, &checksum).unwrap(), b"event bytes");

        let mut flipped = ev_with_salt.clone();
        flipped[3] ^= 0x10;
        assert_eq!(
            verify_checksum(&flipped, &checksum),
            Err(PttError::InvalidChecksum)
        );
    }

    proptest! {
        #[test]
        fn prop_envelope_roundtrip(op in any::<u32>(), data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let key = test_key();
            let enc = encrypt_data(op, &data, &key).unwrap();
            prop_assert_eq!(decrypt_data(&enc, &key).unwrap(), (op, data));
        }

        #[test]
        fn prop_checksum_detects_any_flip(data in proptest::collection::vec(any::<u8>(), 1..256), idx in any::<usize>(), bit in 0u8..8) {
            let (mut ev_with_salt, checksum) = checksum_data(&data);
            let i = idx % ev_with_salt.len();
            ev_with_salt[i] ^= 1 << bit;
            prop_assert!(verify_checksum(&ev_with_salt, &checksum).is_err());
        }
    }
}
