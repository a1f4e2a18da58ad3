use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let verifying_key = decode_verifying_key(public_key_hex)?;
    let signature = decode_signature(signature_hex)?;
    Ok(verifying_key.verify(payload, &signature).is_ok())
}

/// Verifies a detached signature over the full contents of a release
/// package. A mismatch is an error, not `Ok(false)`.
pub fn verify_release_signature(
    artifact_path: &Path,
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<()> {
    let payload = fs::read(artifact_path).with_context(|| {
        format!(
            "failed to read release artifact for signature check: {}",
            artifact_path.display()
        )
    })?;
    if !verify_ed25519_signature_hex(&payload, public_key_hex, signature_hex)? {
        return Err(anyhow!(
            "release signature does not match artifact: {}",
            artifact_path.display()
        ));
    }
    Ok(())
}

fn decode_verifying_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let bytes =
        hex::decode(public_key_hex.trim()).context("failed to decode Ed25519 public key hex")?;
    let len = bytes.len();
    let array: [u8; 32] = bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 public key length: expected 32 bytes, got {len}")
    })?;
    VerifyingKey::from_bytes(&array).context("invalid Ed25519 public key bytes")
}

fn decode_signature(signature_hex: &str) -> Result<Signature> {
    let bytes =
        hex::decode(signature_hex.trim()).context("failed to decode Ed25519 signature hex")?;
    let len = bytes.len();
    let array: [u8; 64] = bytes
        .try_into()
        .map_err(|_| anyhow!("invalid Ed25519 signature length: expected 64 bytes, got {len}"))?;
    Ok(Signature::from_bytes(&array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    // RFC 8032 test 1: empty message.
    const RFC_PUBLIC_KEY: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";
    const RFC_SIGNATURE: &str = concat!(
        "e5564300c360ac729086e2cc806e828a84877f1eb8e5d974d873e06522490155",
        "5fb8821590a33bacc61e39701cf9b46bd25bf5f0595bbe24655141438e7a100b"
    );

    #[test]
    fn accepts_rfc8032_vector() {
        assert!(verify_ed25519_signature_hex(b"", RFC_PUBLIC_KEY, RFC_SIGNATURE)
            .expect("verification must complete"));
    }

    #[test]
    fn rejects_tampered_payload() {
        assert!(
            !verify_ed25519_signature_hex(b"tampered", RFC_PUBLIC_KEY, RFC_SIGNATURE)
                .expect("verification must complete")
        );
    }

    #[test]
    fn errors_for_malformed_key_or_signature() {
        assert!(verify_ed25519_signature_hex(b"", RFC_PUBLIC_KEY, "zz").is_err());
        assert!(verify_ed25519_signature_hex(b"", RFC_PUBLIC_KEY, "00").is_err());
        assert!(verify_ed25519_signature_hex(b"", "zz", RFC_SIGNATURE).is_err());
        assert!(verify_ed25519_signature_hex(b"", "00", RFC_SIGNATURE).is_err());
    }

    #[test]
    fn release_signature_checks_whole_file() {
        let signing_key = SigningKey::from_bytes(&[7_u8; 32]);
        let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());
        let payload = b"release-2.1.0.tar.gz bytes";
        let signature_hex = hex::encode(signing_key.sign(payload).to_bytes());

        let path = std::env::temp_dir().join(format!(
            "upkeep-security-signature-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system time")
                .as_nanos()
        ));
        std::fs::write(&path, payload).expect("must write fixture");
        verify_release_signature(&path, &public_key_hex, &signature_hex)
            .expect("signature must verify");

        std::fs::write(&path, b"swapped payload").expect("must rewrite fixture");
        let err = verify_release_signature(&path, &public_key_hex, &signature_hex)
            .expect_err("tampered artifact must fail");
        assert!(err.to_string().contains("does not match"));

        let _ = std::fs::remove_file(&path);
    }
}
