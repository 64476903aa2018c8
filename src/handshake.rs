//! The challenge/response handshake performed on every new pool connection.
//!
//! Immediately after the TLS session is established, the remote sends a single
//! challenge blob. The client parses it, signs the challenge nonce with the
//! tunnel's private key, and replies with exactly one response frame: the
//! compressed public key followed by a fixed-width ECDSA signature. The remote
//! recovers the tunnel id from the public key and verifies the signature; the
//! client does not wait for an acknowledgement. After this exchange the
//! connection carries opaque user bytes in both directions.

use {
    k256::ecdsa::{signature::Signer, Signature, SigningKey},
    thiserror::Error,
};

/// Length of the challenge nonce issued by the remote.
pub const NONCE_LENGTH: usize = 32;

/// Length of the compressed SEC1 public key in the response frame.
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// Length of the fixed-width ECDSA signature in the response frame.
pub const SIGNATURE_LENGTH: usize = 64;

/// Total length of the response frame.
pub const RESPONSE_LENGTH: usize = PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH;

/// The error returned when a challenge blob cannot be parsed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("malformed challenge: {0} bytes is shorter than the challenge nonce")]
    TruncatedChallenge(usize),
}

/// A parsed challenge, ready to be signed.
///
/// The nonce is the first [`NONCE_LENGTH`] bytes of the blob; any trailing
/// bytes are tolerated and ignored, so the remote is free to extend the
/// challenge format without breaking older agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    nonce: [u8; NONCE_LENGTH],
}

impl Handshake {
    /// Parse a challenge blob as received from the remote.
    pub fn from_bytes(blob: &[u8]) -> Result<Self, HandshakeError> {
        if blob.len() < NONCE_LENGTH {
            return Err(HandshakeError::TruncatedChallenge(blob.len()));
        }
        let mut nonce = [0; NONCE_LENGTH];
        nonce.copy_from_slice(&blob[..NONCE_LENGTH]);
        Ok(Handshake { nonce })
    }

    pub fn nonce(&self) -> &[u8; NONCE_LENGTH] {
        &self.nonce
    }

    /// Sign the challenge nonce, producing the response frame to send back.
    ///
    /// Signatures are deterministic (RFC 6979), so signing the same challenge
    /// with the same key always yields the same frame.
    pub fn sign(&self, signing_key: &SigningKey) -> SignedResponse {
        let signature: Signature = signing_key.sign(&self.nonce);
        let mut public_key = [0; PUBLIC_KEY_LENGTH];
        public_key.copy_from_slice(
            signing_key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes(),
        );
        SignedResponse {
            public_key,
            signature,
        }
    }
}

/// A signed challenge response: compressed public key, then signature.
#[derive(Debug, Clone)]
pub struct SignedResponse {
    public_key: [u8; PUBLIC_KEY_LENGTH],
    signature: Signature,
}

impl SignedResponse {
    /// Serialize the response as the single frame written to the remote.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RESPONSE_LENGTH);
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(self.signature.to_bytes().as_slice());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{signature::Verifier, VerifyingKey};

    fn signing_key() -> SigningKey {
        SigningKey::from_slice(&[7; 32]).expect("test key must be a valid scalar")
    }

    #[test]
    fn rejects_short_challenge() {
        match Handshake::from_bytes(&[0; NONCE_LENGTH - 1]) {
            Err(HandshakeError::TruncatedChallenge(len)) => assert_eq!(len, NONCE_LENGTH - 1),
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn ignores_trailing_challenge_bytes() {
        let mut blob = vec![9; NONCE_LENGTH];
        blob.extend_from_slice(b"future extension fields");
        let handshake = Handshake::from_bytes(&blob).expect("long challenge parses");
        assert_eq!(handshake.nonce(), &[9; NONCE_LENGTH]);
    }

    #[test]
    fn response_frame_has_fixed_layout() {
        let handshake = Handshake::from_bytes(&[3; NONCE_LENGTH]).expect("challenge parses");
        let frame = handshake.sign(&signing_key()).to_bytes();
        assert_eq!(frame.len(), RESPONSE_LENGTH);
        assert_eq!(
            &frame[..PUBLIC_KEY_LENGTH],
            signing_key()
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes()
        );
    }

    #[test]
    fn response_verifies_against_embedded_public_key() {
        let nonce = [42; NONCE_LENGTH];
        let handshake = Handshake::from_bytes(&nonce).expect("challenge parses");
        let frame = handshake.sign(&signing_key()).to_bytes();

        let public_key = VerifyingKey::from_sec1_bytes(&frame[..PUBLIC_KEY_LENGTH])
            .expect("frame starts with a valid public key");
        let signature = Signature::from_slice(&frame[PUBLIC_KEY_LENGTH..])
            .expect("frame ends with a valid signature");
        assert!(public_key.verify(&nonce, &signature).is_ok());
    }

    #[test]
    fn signing_is_deterministic() {
        let handshake = Handshake::from_bytes(&[5; NONCE_LENGTH]).expect("challenge parses");
        let first = handshake.sign(&signing_key()).to_bytes();
        let second = handshake.sign(&signing_key()).to_bytes();
        assert_eq!(first, second);
    }
}
