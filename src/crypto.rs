use blst::min_sig::{PublicKey as BlstPublicKey, SecretKey, Signature as BlstSignature};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 256-bit hash (SHA-256). Block hashes and vote signing hashes use it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// -----------------------------------------------------------------------------
// BLS keys (blst::min_sig)
// min_sig: Signatures in G1 (48 bytes), Public Keys in G2 (96 bytes).
// Votes are signed far more often than keys are exchanged.
// -----------------------------------------------------------------------------

/// BLS Public Key (96 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub BlstPublicKey);

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = self.0.to_bytes();
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let pk = BlstPublicKey::from_bytes(&bytes)
            .map_err(|e| serde::de::Error::custom(format!("{:?}", e)))?;
        Ok(PublicKey(pk))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pub({})", hex::encode(self.0.to_bytes()))
    }
}

/// BLS Private Key.
#[derive(Clone)]
pub struct PrivateKey(pub SecretKey);

impl PrivateKey {
    /// Generate a new random Private Key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut ikm = [0u8; 32];
            rng.fill_bytes(&mut ikm);
            if let Ok(sk) = SecretKey::key_gen(&ikm, &[]) {
                return PrivateKey(sk);
            }
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priv({:?})", self.public_key())
    }
}

/// Domain separation tag for vote signatures.
const DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_POP_";

/// Signs a message and returns the compressed signature bytes.
pub fn sign(priv_key: &PrivateKey, message: &[u8]) -> Vec<u8> {
    priv_key.0.sign(message, DST, &[]).to_bytes().to_vec()
}

/// Verifies compressed signature bytes. Malformed signatures fail verification.
pub fn verify(pub_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig) = BlstSignature::from_bytes(signature) else {
        return false;
    };
    let err = sig.verify(true, message, DST, &[], &pub_key.0, true);
    err == blst::BLST_ERROR::BLST_SUCCESS
}

/// SHA-256 of raw bytes.
pub fn sha256(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Hash(hasher.finalize().into())
}

/// Helper to hash any serializable object via its bincode encoding.
pub fn hash_data<T: Serialize>(data: &T) -> Hash {
    let serialized = bincode::serialize(data).unwrap_or_default();
    sha256(&serialized)
}

/// Generate a KeyPair (Public, Private).
pub fn generate_keypair() -> (PublicKey, PrivateKey) {
    let sk = PrivateKey::generate();
    let pk = sk.public_key();
    (pk, sk)
}

/// Generate a KeyPair from a u64 ID (deterministic).
/// Useful for fixed delegate sets in tests and local networks.
pub fn generate_keypair_from_id(id: u64) -> (PublicKey, PrivateKey) {
    let mut ikm = [0u8; 32];
    ikm[24..32].copy_from_slice(&id.to_be_bytes());
    // IKM is 32 bytes, which key_gen always accepts.
    let sk = match SecretKey::key_gen(&ikm, &[]) {
        Ok(sk) => sk,
        Err(e) => unreachable!("key_gen rejected 32-byte ikm: {:?}", e),
    };
    let pk = sk.sk_to_pk();
    (PublicKey(pk), PrivateKey(sk))
}
