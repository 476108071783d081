//! HMAC signature helpers shared by connectors that verify webhooks (§4.7):
//! Close's single-value `close-sig-hash` and Stripe's `t=...,v1=...` scheme
//! both reduce to "HMAC-SHA256 over some signed payload, compared in
//! constant time."

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_a_64_char_hex_digest() {
        let digest = hmac_sha256_hex("secret", b"payload");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn is_deterministic() {
        assert_eq!(
            hmac_sha256_hex("secret", b"payload"),
            hmac_sha256_hex("secret", b"payload")
        );
    }
}
