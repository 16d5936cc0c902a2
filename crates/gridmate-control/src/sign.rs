use base64::Engine;
use k256::ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};

/// Verify an account-manager URL signature.
///
/// `signing_key_b64` is the manager's ECDSA public key (SEC1 bytes,
/// base64); `signature_b64` is the DER-less fixed-size signature over the
/// canonical URL bytes. Any decode or verification failure is just
/// `false`: the caller logs and skips the line item, it never aborts the
/// reply.
pub fn verify_url_signature(signing_key_b64: &str, url: &str, signature_b64: &str) -> bool {
    let engine = base64::engine::general_purpose::STANDARD;
    let Ok(key_bytes) = engine.decode(signing_key_b64) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_sec1_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = engine.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(url.as_bytes(), &signature).is_ok()
}

#[cfg(test)]
pub mod test_keys {
    use base64::Engine;
    use k256::ecdsa::signature::Signer;
    use k256::ecdsa::{Signature, SigningKey};

    /// Deterministic test keypair plus a signer for URL signatures.
    pub fn keypair() -> (SigningKey, String) {
        let signing = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let verifying = signing.verifying_key();
        let key_b64 = base64::engine::general_purpose::STANDARD
            .encode(verifying.to_sec1_bytes());
        (signing, key_b64)
    }

    pub fn sign_url(signing: &SigningKey, url: &str) -> String {
        let signature: Signature = signing.sign(url.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }
}
