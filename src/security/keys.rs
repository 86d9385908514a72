//! Ed25519 signing and verification of wire messages.
//!
//! A message's tag is the hex-encoded signature over its signing payload.
//! Clients sign with the shared client key, the coordinator with the ECS key;
//! storage nodes only ever verify.

use crate::error::AuthError;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};

/// Seed of the built-in client key used when none is configured.
const DEV_CLIENT_SEED: [u8; 32] = [0x11; 32];

/// Seed of the built-in coordinator key used when none is configured.
const DEV_ECS_SEED: [u8; 32] = [0x22; 32];

/// A message that can carry a signature tag.
pub trait Signable {
    /// Bytes covered by the signature.
    fn signing_payload(&self) -> Vec<u8>;

    /// The current tag, if any.
    fn tag(&self) -> Option<&str>;

    /// Attach a tag.
    fn set_tag(&mut self, tag: String);
}

/// Holds a private key and tags messages with it.
#[derive(Clone)]
pub struct MessageSigner {
    key: SigningKey,
}

impl MessageSigner {
    /// Create a signer from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Create a signer from a hex-encoded seed.
    pub fn from_hex(seed: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(seed).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::InvalidKey("seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(seed))
    }

    /// Built-in client key for development clusters and tests.
    pub fn development_client() -> Self {
        Self::from_seed(DEV_CLIENT_SEED)
    }

    /// Built-in coordinator key for development clusters and tests.
    pub fn development_ecs() -> Self {
        Self::from_seed(DEV_ECS_SEED)
    }

    /// Hex-encoded public half of this key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Matching verifier.
    pub fn verifier(&self) -> MessageVerifier {
        MessageVerifier {
            key: self.key.verifying_key(),
        }
    }

    /// Sign raw bytes, returning the hex tag.
    pub fn sign_bytes(&self, payload: &[u8]) -> String {
        hex::encode(self.key.sign(payload).to_bytes())
    }

    /// Tag a message in place.
    pub fn sign<T: Signable>(&self, msg: &mut T) {
        let tag = self.sign_bytes(&msg.signing_payload());
        msg.set_tag(tag);
    }
}

impl std::fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSigner")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Holds a public key and checks message tags against it.
#[derive(Debug, Clone)]
pub struct MessageVerifier {
    key: VerifyingKey,
}

impl MessageVerifier {
    /// Create a verifier from a hex-encoded public key.
    pub fn from_hex(public_key: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(public_key).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::InvalidKey("public key must be 32 bytes".to_string()))?;
        let key =
            VerifyingKey::from_bytes(&bytes).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Verify a hex tag over raw bytes.
    pub fn verify_bytes(&self, payload: &[u8], tag: &str) -> Result<(), AuthError> {
        let raw = hex::decode(tag).map_err(|_| AuthError::MalformedTag)?;
        let signature = Signature::from_slice(&raw).map_err(|_| AuthError::MalformedTag)?;
        self.key
            .verify(payload, &signature)
            .map_err(|_| AuthError::BadSignature)
    }

    /// Verify a message's tag.
    pub fn verify<T: Signable>(&self, msg: &T) -> Result<(), AuthError> {
        let tag = msg.tag().ok_or(AuthError::MissingTag)?;
        self.verify_bytes(&msg.signing_payload(), tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Note {
        body: String,
        tag: Option<String>,
    }

    impl Signable for Note {
        fn signing_payload(&self) -> Vec<u8> {
            self.body.as_bytes().to_vec()
        }

        fn tag(&self) -> Option<&str> {
            self.tag.as_deref()
        }

        fn set_tag(&mut self, tag: String) {
            self.tag = Some(tag);
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = MessageSigner::development_client();
        let mut note = Note {
            body: "hello".to_string(),
            tag: None,
        };
        signer.sign(&mut note);
        assert!(signer.verifier().verify(&note).is_ok());
    }

    #[test]
    fn test_tampered_message_rejected() {
        let signer = MessageSigner::development_client();
        let mut note = Note {
            body: "hello".to_string(),
            tag: None,
        };
        signer.sign(&mut note);
        note.body = "hellp".to_string();
        assert_eq!(
            signer.verifier().verify(&note),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let client = MessageSigner::development_client();
        let ecs = MessageSigner::development_ecs();
        let mut note = Note {
            body: "hello".to_string(),
            tag: None,
        };
        client.sign(&mut note);
        assert!(ecs.verifier().verify(&note).is_err());
    }

    #[test]
    fn test_missing_and_malformed_tag() {
        let verifier = MessageSigner::development_ecs().verifier();
        let mut note = Note {
            body: "x".to_string(),
            tag: None,
        };
        assert_eq!(verifier.verify(&note), Err(AuthError::MissingTag));
        note.tag = Some("zz".to_string());
        assert_eq!(verifier.verify(&note), Err(AuthError::MalformedTag));
    }

    #[test]
    fn test_verifier_from_hex() {
        let signer = MessageSigner::development_ecs();
        let verifier = MessageVerifier::from_hex(&signer.public_key_hex()).unwrap();
        let tag = signer.sign_bytes(b"payload");
        assert!(verifier.verify_bytes(b"payload", &tag).is_ok());
        assert!(MessageVerifier::from_hex("abcd").is_err());
    }
}
