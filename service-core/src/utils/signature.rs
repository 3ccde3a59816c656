use hmac::{Hmac, Mac};
use sha2::Sha512;
use subtle::ConstantTimeEq;

type HmacSha512 = Hmac<Sha512>;

/// Hex-encoded HMAC-SHA512 of `payload` under `secret`.
///
/// Payment providers sign the exact bytes they send, so callers must pass the
/// raw request body, never a re-serialised copy.
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha512::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a hex signature against `payload` in constant time.
///
/// Comparison is case-insensitive on the hex digits; any other mismatch,
/// including length, yields `false`.
pub fn verify_payload_signature(
    secret: &[u8],
    payload: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = sign_payload(secret, payload)?;
    let provided = signature.trim().to_ascii_lowercase();

    if expected.len() != provided.len() {
        return Ok(false);
    }

    Ok(expected.as_bytes().ct_eq(provided.as_bytes()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"sk_test_webhook";
    const BODY: &[u8] = br#"{"event":"charge.success","data":{"reference":"sub_1"}}"#;

    #[test]
    fn signature_is_sha512_hex() {
        let signature = sign_payload(SECRET, BODY).unwrap();
        assert_eq!(signature.len(), 128);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn accepts_matching_signature_in_any_case() {
        let signature = sign_payload(SECRET, BODY).unwrap();
        assert!(verify_payload_signature(SECRET, BODY, &signature).unwrap());
        assert!(verify_payload_signature(SECRET, BODY, &signature.to_uppercase()).unwrap());
    }

    #[test]
    fn rejects_tampered_body() {
        let signature = sign_payload(SECRET, BODY).unwrap();
        let tampered = br#"{"event":"charge.success","data":{"reference":"sub_2"}}"#;
        assert!(!verify_payload_signature(SECRET, tampered, &signature).unwrap());
    }

    #[test]
    fn rejects_wrong_secret_and_truncated_signature() {
        let signature = sign_payload(b"another-secret", BODY).unwrap();
        assert!(!verify_payload_signature(SECRET, BODY, &signature).unwrap());

        let good = sign_payload(SECRET, BODY).unwrap();
        assert!(!verify_payload_signature(SECRET, BODY, &good[..64]).unwrap());
    }
}
