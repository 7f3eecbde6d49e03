//! Artifact signing: `x-artifact-tag` is `base64(HMAC-SHA256(key, hash || team || body))`.

use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

const BLOCK_SIZE: usize = 64;
const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5C;

/// Signs uploads and verifies downloads with a shared key.
pub struct ArtifactSigner {
    key: Vec<u8>,
    team_id: Vec<u8>,
}

impl std::fmt::Debug for ArtifactSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactSigner")
            .field("team_id", &String::from_utf8_lossy(&self.team_id))
            .finish_non_exhaustive()
    }
}

impl ArtifactSigner {
    /// Signer for artifacts belonging to `team_id`.
    pub fn new(key: impl Into<Vec<u8>>, team_id: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::Signature {
                message: "signature key is empty".to_string(),
            });
        }
        Ok(Self {
            key,
            team_id: team_id.into(),
        })
    }

    /// Tag for an artifact body.
    #[must_use]
    pub fn tag(&self, hash: &str, body: &[u8]) -> String {
        STANDARD.encode(self.mac(hash, body))
    }

    /// Check `tag` against the body; mismatches and undecodable tags fail.
    pub fn verify(&self, hash: &str, body: &[u8], tag: &str) -> Result<()> {
        let invalid = || Error::InvalidTag {
            hash: hash.to_string(),
        };
        let provided = STANDARD.decode(tag.trim()).map_err(|_| invalid())?;
        if constant_time_eq(&provided, &self.mac(hash, body)) {
            Ok(())
        } else {
            Err(invalid())
        }
    }

    fn mac(&self, hash: &str, body: &[u8]) -> Vec<u8> {
        hmac_sha256(&self.key, &[hash.as_bytes(), self.team_id.as_slice(), body])
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let key = if key.len() > BLOCK_SIZE {
        Sha256::digest(key).to_vec()
    } else {
        key.to_vec()
    };

    let mut padded = [0u8; BLOCK_SIZE];
    padded[..key.len()].copy_from_slice(&key);
    let ipad_key = padded.map(|b| b ^ IPAD);
    let opad_key = padded.map(|b| b ^ OPAD);

    let mut inner = Sha256::new();
    inner.update(ipad_key);
    for part in parts {
        inner.update(*part);
    }
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(opad_key);
    outer.update(inner_hash);
    outer.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_hmac_matches_rfc4231_case_1() {
        let mac = hmac_sha256(&[0x0b; 20], &[b"Hi There".as_slice()]);
        assert_eq!(
            to_hex(&mac),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    #[test]
    fn test_hmac_long_key_is_hashed_first() {
        // RFC 4231 test case 6
        let mac = hmac_sha256(
            &[0xaa; 131],
            &[b"Test Using Larger Than Block-Size Key - Hash Key First".as_slice()],
        );
        assert_eq!(
            to_hex(&mac),
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }

    #[test]
    fn test_tag_verifies_and_detects_tampering() {
        let signer = ArtifactSigner::new("shared-key", "team_1").unwrap();
        let tag = signer.tag("abc", b"body");
        assert!(signer.verify("abc", b"body", &tag).is_ok());
        assert!(matches!(
            signer.verify("abc", b"bodY", &tag),
            Err(Error::InvalidTag { .. })
        ));
        assert!(signer.verify("abd", b"body", &tag).is_err());
        assert!(signer.verify("abc", b"body", "%%%not-base64").is_err());
    }

    #[test]
    fn test_team_is_part_of_the_tag() {
        let a = ArtifactSigner::new("shared-key", "team_a").unwrap();
        let b = ArtifactSigner::new("shared-key", "team_b").unwrap();
        assert_ne!(a.tag("abc", b"body"), b.tag("abc", b"body"));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            ArtifactSigner::new("", "team"),
            Err(Error::Signature { .. })
        ));
    }
}
