use crate::protocol::AdbError;
use crate::tls::TlsContext;
use base64::{engine::general_purpose, Engine as _};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding},
    traits::PublicKeyParts,
    BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Size of the random token sent by the daemon in AUTH(TOKEN)
pub const TOKEN_SIZE: usize = 20;

const KEY_BITS: usize = 2048;
const MODULUS_BYTES: usize = KEY_BITS / 8;
const MODULUS_WORDS: u32 = (MODULUS_BYTES / 4) as u32;

/// Storage key for the PEM-encoded private key
pub const PRIVATE_KEY_ENTRY: &str = "adb_private_key";
/// Storage key set once pairing succeeded
pub const PAIRED_ENTRY: &str = "adb_paired";

/// ADB key pair for authentication
#[derive(Clone)]
pub struct AdbKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl AdbKeyPair {
    /// Generate a new 2048-bit RSA key pair
    pub fn generate() -> Result<Self, AdbError> {
        use rsa::rand_core::OsRng;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| AdbError::KeyError(format!("Failed to generate key: {}", e)))?;

        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Load from PEM-encoded private key string
    pub fn from_pem(pem: &str) -> Result<Self, AdbError> {
        // Try PKCS#1 first
        let private_key = if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            key
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|e| AdbError::KeyError(format!("Failed to parse PEM: {}", e)))?
        };

        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Sign a token (challenge from device).
    ///
    /// The daemon verifies the signature as if the token were a SHA-1 digest,
    /// so the token is padded with the SHA-1 DigestInfo and not hashed again.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, AdbError> {
        if token.len() != TOKEN_SIZE {
            return Err(AdbError::AuthenticationFailed(format!(
                "Token must be {} bytes, got {}",
                TOKEN_SIZE,
                token.len()
            )));
        }

        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), token)
            .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to sign token: {}", e)))
    }

    /// Get public key in ADB format
    /// Format: base64(android RSA public key struct) + " " + name + "\x00"
    pub fn get_public_key(&self, name: &str) -> Result<Vec<u8>, AdbError> {
        let encoded = general_purpose::STANDARD.encode(android_public_key(&self.public_key)?);

        let mut result = encoded.into_bytes();
        result.push(b' ');
        result.extend_from_slice(name.as_bytes());
        result.push(0);

        Ok(result)
    }

    /// Get private key as PEM
    pub fn private_key_pem(&self) -> Result<String, AdbError> {
        let pem = self
            .private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| AdbError::KeyError(format!("Failed to encode private key: {}", e)))?;
        Ok(pem.to_string())
    }

    /// Get private key as PKCS#8 DER, the form TLS libraries consume
    pub fn private_key_pkcs8_der(&self) -> Result<Vec<u8>, AdbError> {
        let der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| AdbError::KeyError(format!("Failed to encode private key: {}", e)))?;
        Ok(der.as_bytes().to_vec())
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}

/// Encode `key` as the little-endian `RSAPublicKey` struct adbd parses:
/// `{ u32 len; u32 n0inv; u8 n[256]; u8 rr[256]; u32 exponent; }`
fn android_public_key(key: &RsaPublicKey) -> Result<Vec<u8>, AdbError> {
    let n = key.n();
    if n.bits() != KEY_BITS {
        return Err(AdbError::KeyError(format!(
            "Expected a {}-bit modulus, got {} bits",
            KEY_BITS,
            n.bits()
        )));
    }

    let n_le = n.to_bytes_le();
    let n0 = u32::from_le_bytes([n_le[0], n_le[1], n_le[2], n_le[3]]);
    let n0inv = inverse_mod_2_32(n0).wrapping_neg();

    // rr = (2^2048)^2 mod n
    let rr = (BigUint::from(1u32) << (2 * KEY_BITS)) % n;

    let exponent = key
        .e()
        .to_bytes_le()
        .iter()
        .rev()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);

    let mut out = Vec::with_capacity(4 + 4 + 2 * MODULUS_BYTES + 4);
    out.extend_from_slice(&MODULUS_WORDS.to_le_bytes());
    out.extend_from_slice(&n0inv.to_le_bytes());
    out.extend_from_slice(&padded_le(&n_le));
    out.extend_from_slice(&padded_le(&rr.to_bytes_le()));
    out.extend_from_slice(&exponent.to_le_bytes());
    Ok(out)
}

fn padded_le(bytes: &[u8]) -> [u8; MODULUS_BYTES] {
    let mut out = [0u8; MODULUS_BYTES];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// Multiplicative inverse of an odd `a` modulo 2^32 (Newton iteration).
fn inverse_mod_2_32(a: u32) -> u32 {
    let mut x = a;
    for _ in 0..4 {
        x = x.wrapping_mul(2u32.wrapping_sub(a.wrapping_mul(x)));
    }
    x
}

/// Persistent byte storage consumed by [`AdbKeyStore`].
#[cfg_attr(test, mockall::automock)]
pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdbError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), AdbError>;
}

/// Process-local store; contents are lost on exit.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdbError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| AdbError::KeyError("Key store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), AdbError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AdbError::KeyError("Key store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// JSON file mapping entry names to base64 values.
pub struct FileKeyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>, AdbError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AdbError::KeyError(format!("Corrupt key file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(AdbError::KeyError(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdbError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AdbError::KeyError("Key store lock poisoned".to_string()))?;

        match self.load()?.get(key) {
            Some(encoded) => general_purpose::STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| AdbError::KeyError(format!("Invalid entry {}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), AdbError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AdbError::KeyError("Key store lock poisoned".to_string()))?;

        let mut entries = self.load()?;
        entries.insert(key.to_string(), general_purpose::STANDARD.encode(value));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| AdbError::KeyError(format!("Failed to encode key file: {}", e)))?;
        std::fs::write(&self.path, json).map_err(|e| {
            AdbError::KeyError(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}

/// Everything needed to authenticate as this installation.
pub struct KeyIdentity {
    keypair: AdbKeyPair,
    public_key_blob: Vec<u8>,
    tls: TlsContext,
}

impl KeyIdentity {
    pub fn new(keypair: AdbKeyPair, device_name: &str) -> Result<Self, AdbError> {
        let public_key_blob = keypair.get_public_key(device_name)?;
        let tls = TlsContext::from_keypair(&keypair, device_name)?;
        Ok(Self {
            keypair,
            public_key_blob,
            tls,
        })
    }

    pub fn sign(&self, challenge: &[u8]) -> Result<Vec<u8>, AdbError> {
        self.keypair.sign_token(challenge)
    }

    /// `base64(key) name\0`, sent in AUTH(RSAPUBLICKEY) and in pairing peer info
    pub fn public_key_blob(&self) -> &[u8] {
        &self.public_key_blob
    }

    pub fn tls_context(&self) -> &TlsContext {
        &self.tls
    }

    pub fn keypair(&self) -> &AdbKeyPair {
        &self.keypair
    }
}

/// Loads or creates the installation key on top of a [`KeyStore`].
#[derive(Clone)]
pub struct AdbKeyStore {
    store: Arc<dyn KeyStore>,
    device_name: String,
}

impl AdbKeyStore {
    pub fn new(store: Arc<dyn KeyStore>, device_name: impl Into<String>) -> Self {
        Self {
            store,
            device_name: device_name.into(),
        }
    }

    /// Load the persisted key or generate and persist a new one.
    pub fn get_or_create_key(&self) -> Result<KeyIdentity, AdbError> {
        let keypair = match self.load_key()? {
            Some(keypair) => {
                log::info!("Loaded existing keypair from storage");
                keypair
            }
            None => {
                log::info!("Generating new keypair");
                let keypair = AdbKeyPair::generate()?;
                self.save_key(&keypair)?;
                keypair
            }
        };

        KeyIdentity::new(keypair, &self.device_name)
    }

    fn load_key(&self) -> Result<Option<AdbKeyPair>, AdbError> {
        let Some(bytes) = self.store.get(PRIVATE_KEY_ENTRY)? else {
            return Ok(None);
        };

        let parsed = std::str::from_utf8(&bytes)
            .map_err(|e| AdbError::KeyError(e.to_string()))
            .and_then(AdbKeyPair::from_pem);

        match parsed {
            Ok(keypair) => Ok(Some(keypair)),
            Err(e) => {
                log::warn!("Stored key is unusable, replacing it: {}", e);
                Ok(None)
            }
        }
    }

    fn save_key(&self, keypair: &AdbKeyPair) -> Result<(), AdbError> {
        let pem = keypair.private_key_pem()?;
        self.store.put(PRIVATE_KEY_ENTRY, pem.as_bytes())
    }

    pub fn mark_paired(&self) -> Result<(), AdbError> {
        self.store.put(PAIRED_ENTRY, &[1])
    }

    pub fn is_paired(&self) -> bool {
        matches!(self.store.get(PAIRED_ENTRY), Ok(Some(v)) if v == [1])
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}
