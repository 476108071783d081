//! The `Decrypt` capability (§1, §6): treated everywhere else as opaque, but
//! owned here as a narrow trait so [`crate::gateway`] depends on an
//! interface rather than a concrete cipher.

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use subtle::ConstantTimeEq as _;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext is not in `<ivHex>:<ctHex>` form")]
    MalformedEnvelope,
    #[error("invalid hex in ciphertext envelope")]
    InvalidHex,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("decrypted plaintext is not valid UTF-8")]
    InvalidUtf8,
}

/// The opaque decryption capability §1 carves out as an external
/// collaborator. Production wires [`AesCbcSecretCipher`]; tests substitute a
/// pass-through fake.
pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;
}

/// AES-256-CBC with the IV prefixed as `"<ivHex>:<ctHex>"` (§6).
pub struct AesCbcSecretCipher {
    key: [u8; 32],
}

impl AesCbcSecretCipher {
    pub fn new(key: [u8; 32]) -> Self {
        AesCbcSecretCipher { key }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = key.try_into().map_err(|_| CryptoError::MalformedEnvelope)?;
        Ok(Self::new(arr))
    }
}

impl SecretCipher for AesCbcSecretCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let (iv_hex, ct_hex) = ciphertext
            .split_once(':')
            .ok_or(CryptoError::MalformedEnvelope)?;
        let iv = decode_hex(iv_hex)?;
        let mut buf = decode_hex(ct_hex)?;
        if iv.len() != 16 {
            return Err(CryptoError::MalformedEnvelope);
        }

        let decryptor = Aes256CbcDec::new(self.key.as_slice().into(), iv.as_slice().into());
        let plain = decryptor
            .decrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf)
            .map_err(|_| CryptoError::DecryptFailed)?;

        String::from_utf8(plain.to_vec()).map_err(|_| CryptoError::InvalidUtf8)
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, CryptoError> {
    if s.len() % 2 != 0 {
        return Err(CryptoError::InvalidHex);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| CryptoError::InvalidHex))
        .collect()
}

/// A pass-through fake for tests that don't exercise real ciphertext.
pub struct PlaintextCipher;

impl SecretCipher for PlaintextCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        Ok(ciphertext.to_string())
    }
}

/// Constant-time compare for webhook signature verification (§4.7): a
/// timing side-channel here would undermine a capability this engine does
/// own, unlike secret decryption.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    fn encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &str) -> String {
        type Enc = cbc::Encryptor<Aes256>;
        let mut buf = plaintext.as_bytes().to_vec();
        buf.resize(buf.len() + 16, 0);
        let pt_len = plaintext.len();
        let enc = Enc::new(key.into(), iv.into());
        let ct = enc
            .encrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf, pt_len)
            .unwrap();
        let iv_hex: String = iv.iter().map(|b| format!("{b:02x}")).collect();
        let ct_hex: String = ct.iter().map(|b| format!("{b:02x}")).collect();
        format!("{iv_hex}:{ct_hex}")
    }

    #[test]
    fn round_trips_aes_cbc() {
        let key = [7u8; 32];
        let iv = [3u8; 16];
        let envelope = encrypt(&key, &iv, "hunter2");
        let cipher = AesCbcSecretCipher::new(key);
        assert_eq!(cipher.decrypt(&envelope).unwrap(), "hunter2");
    }

    #[test]
    fn rejects_malformed_envelope() {
        let cipher = AesCbcSecretCipher::new([0u8; 32]);
        assert!(matches!(
            cipher.decrypt("not-an-envelope"),
            Err(CryptoError::MalformedEnvelope)
        ));
    }

    #[test]
    fn rejects_wrong_key() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let envelope = encrypt(&key, &iv, "secret");
        let wrong = AesCbcSecretCipher::new([9u8; 32]);
        assert!(wrong.decrypt(&envelope).is_err());
    }

    #[test]
    fn constant_time_eq_matches_plain_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
