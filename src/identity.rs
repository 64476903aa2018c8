//! Key material and the tunnel identity derived from it.
//!
//! A tunnel is addressed by a 40-character hex id computed from its secp256k1
//! private key: the compressed public key is hashed with SHA-256 and the
//! result with RIPEMD-160. The id is stable for the lifetime of the key, so
//! the public URL of the tunnel survives restarts and reconnections.

use {
    k256::ecdsa::SigningKey,
    rand::rngs::OsRng,
    ripemd::Ripemd160,
    serde::{de, Deserialize, Deserializer, Serialize, Serializer},
    sha2::{Digest, Sha256},
    std::fmt,
    thiserror::Error,
    zeroize::Zeroize,
};

/// The exact length, in bytes, of a tunnel private key.
pub const KEY_LENGTH: usize = 32;

/// A 32-byte secp256k1 private key identifying one tunnel.
///
/// The key is zeroed on drop. In configuration files it is written as 64 hex
/// characters; the [`Default`] instance is freshly random.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey([u8; KEY_LENGTH]);

/// The error returned when a private key is not a valid secp256k1 scalar.
#[derive(Debug, Error)]
#[error("private key is not a valid secp256k1 scalar")]
pub struct InvalidPrivateKey;

impl PrivateKey {
    /// Wrap raw key bytes. The bytes are not checked here; validity as a
    /// scalar is checked when the signing key is derived.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        PrivateKey(bytes)
    }

    /// Generate a fresh random private key.
    pub fn random() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let mut bytes = [0; KEY_LENGTH];
        bytes.copy_from_slice(signing_key.to_bytes().as_slice());
        PrivateKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Derive the signing key, rejecting bytes outside the curve order.
    pub fn signing_key(&self) -> Result<SigningKey, InvalidPrivateKey> {
        SigningKey::from_slice(&self.0).map_err(|_| InvalidPrivateKey)
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        PrivateKey::random()
    }
}

// Key material never appears in logs or debug output.
impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        let bytes = hex::decode(&string)
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&string), &"a hex string"))?;
        if bytes.len() != KEY_LENGTH {
            return Err(de::Error::invalid_length(
                bytes.len(),
                &"exactly 32 bytes of key material",
            ));
        }
        let mut key = [0; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(PrivateKey(key))
    }
}

/// The identity a tunnel presents to the world, derived from its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelIdentity {
    id: String,
}

impl TunnelIdentity {
    /// Derive the identity: `RIPEMD160(SHA256(compressed public key))`,
    /// rendered as lowercase hex.
    pub fn new(signing_key: &SigningKey) -> Self {
        let public_key = signing_key.verifying_key().to_encoded_point(true);
        let sha = Sha256::digest(public_key.as_bytes());
        let digest = Ripemd160::digest(&sha);
        TunnelIdentity {
            id: hex::encode(digest),
        }
    }

    /// The 40-character hex tunnel id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The public URL users hit to reach this tunnel.
    pub fn public_url(&self, remote_address: &str) -> String {
        format!("https://{}.{}", self.id, remote_address)
    }

    /// The URL form for a caller-supplied alias registered with the remote.
    pub fn alias_url(alias: &str, remote_address: &str) -> String {
        format!("https://{}.{}", alias, remote_address)
    }
}

impl fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
