//! Wireless debugging pairing.
//!
//! The pairing daemon speaks TLS 1.3, then both sides run SPAKE2 over a
//! password made of the six-digit code followed by keying material exported
//! from the TLS session. The resulting key encrypts one [`PeerInfo`] record in
//! each direction: we send our public key, the daemon answers with its GUID.
//! A wrong code shows up as a record that fails to decrypt.

use crate::auth::KeyIdentity;
use crate::protocol::AdbError;
use crate::tls;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Label for TLS keying material export
pub const EXPORTED_KEY_LABEL: &[u8] = b"adb-label\0";
/// Bytes of keying material appended to the pairing code
pub const EXPORTED_KEY_SIZE: usize = 64;

/// Size of an encoded [`PeerInfo`] record
pub const PEER_INFO_SIZE: usize = 8192;
const PEER_INFO_DATA_SIZE: usize = PEER_INFO_SIZE - 1;

const PACKET_VERSION: u8 = 1;
const PACKET_HEADER_LEN: usize = 6;
/// Largest packet payload accepted
pub const MAX_PACKET_PAYLOAD: u32 = 2 * PEER_INFO_SIZE as u32;

const CLIENT_NAME: &[u8] = b"adb pair client\0";
const SERVER_NAME: &[u8] = b"adb pair server\0";
const HKDF_INFO: &[u8] = b"adb pairing_auth aes-128-gcm key";
const AES_KEY_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;

/// Pairing packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Spake2Msg = 0,
    PeerInfo = 1,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketType::Spake2Msg),
            1 => Some(PacketType::PeerInfo),
            _ => None,
        }
    }
}

/// Kind of data carried in a [`PeerInfo`] record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerInfoType {
    RsaPubKey = 0,
    DeviceGuid = 1,
}

/// Identity record exchanged once the channel is authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub kind: PeerInfoType,
    pub data: Vec<u8>,
}

impl PeerInfo {
    pub fn new(kind: PeerInfoType, data: &[u8]) -> Result<Self, AdbError> {
        if data.len() > PEER_INFO_DATA_SIZE {
            return Err(AdbError::PairingFailed(format!(
                "Peer info of {} bytes exceeds {}",
                data.len(),
                PEER_INFO_DATA_SIZE
            )));
        }
        Ok(Self {
            kind,
            data: data.to_vec(),
        })
    }

    /// Fixed-size encoding, zero padded
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; PEER_INFO_SIZE];
        bytes[0] = self.kind as u8;
        bytes[1..1 + self.data.len()].copy_from_slice(&self.data);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() != PEER_INFO_SIZE {
            return Err(AdbError::PairingFailed(format!(
                "Peer info must be {} bytes, got {}",
                PEER_INFO_SIZE,
                bytes.len()
            )));
        }

        let kind = match bytes[0] {
            0 => PeerInfoType::RsaPubKey,
            1 => PeerInfoType::DeviceGuid,
            other => {
                return Err(AdbError::PairingFailed(format!(
                    "Unknown peer info type: {}",
                    other
                )))
            }
        };

        let data = &bytes[1..];
        let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Ok(Self {
            kind,
            data: data[..end].to_vec(),
        })
    }
}

/// Which end of the exchange this side plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    Client,
    Server,
}

/// SPAKE2 exchange plus the AES-128-GCM channel derived from it
pub struct PairingAuth {
    spake: Option<Spake2<Ed25519Group>>,
    our_msg: Vec<u8>,
    cipher: Option<Aes128Gcm>,
    enc_sequence: u64,
    dec_sequence: u64,
}

impl PairingAuth {
    pub fn new(role: PairingRole, password: &[u8]) -> Self {
        let password = Password::new(password);
        let client = Identity::new(CLIENT_NAME);
        let server = Identity::new(SERVER_NAME);

        let (spake, our_msg) = match role {
            PairingRole::Client => Spake2::<Ed25519Group>::start_a(&password, &client, &server),
            PairingRole::Server => Spake2::<Ed25519Group>::start_b(&password, &client, &server),
        };

        Self {
            spake: Some(spake),
            our_msg,
            cipher: None,
            enc_sequence: 0,
            dec_sequence: 0,
        }
    }

    /// Our SPAKE2 message
    pub fn msg(&self) -> &[u8] {
        &self.our_msg
    }

    /// Finish SPAKE2 with the peer's message and derive the cipher
    pub fn init_cipher(&mut self, their_msg: &[u8]) -> Result<(), AdbError> {
        let spake = self
            .spake
            .take()
            .ok_or_else(|| AdbError::PairingFailed("Cipher already initialised".to_string()))?;

        let shared = spake
            .finish(their_msg)
            .map_err(|e| AdbError::PairingFailed(format!("SPAKE2 failed: {:?}", e)))?;

        let mut key = [0u8; AES_KEY_SIZE];
        Hkdf::<Sha256>::new(None, &shared)
            .expand(HKDF_INFO, &mut key)
            .map_err(|e| AdbError::PairingFailed(format!("Key derivation failed: {}", e)))?;

        let cipher = Aes128Gcm::new_from_slice(&key)
            .map_err(|e| AdbError::PairingFailed(format!("AES-128-GCM init failed: {}", e)))?;
        self.cipher = Some(cipher);
        Ok(())
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, AdbError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| AdbError::PairingFailed("Cipher not initialised".to_string()))?;

        let nonce = sequence_nonce(self.enc_sequence);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| AdbError::PairingFailed("Encryption failed".to_string()))?;
        self.enc_sequence += 1;
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, AdbError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| AdbError::PairingFailed("Cipher not initialised".to_string()))?;

        let nonce = sequence_nonce(self.dec_sequence);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| AdbError::PairingFailed("Decryption failed, wrong pairing code?".to_string()))?;
        self.dec_sequence += 1;
        Ok(plaintext)
    }
}

fn sequence_nonce(sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// Write one `{version, type, len BE}` framed packet
pub async fn write_packet<W>(writer: &mut W, kind: PacketType, payload: &[u8]) -> Result<(), AdbError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_PACKET_PAYLOAD)
        .ok_or_else(|| AdbError::PairingFailed(format!("Packet of {} bytes too large", payload.len())))?;

    let mut packet = Vec::with_capacity(PACKET_HEADER_LEN + payload.len());
    packet.push(PACKET_VERSION);
    packet.push(kind as u8);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(payload);

    writer.write_all(&packet).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed packet
pub async fn read_packet<R>(reader: &mut R) -> Result<(PacketType, Vec<u8>), AdbError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; PACKET_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| AdbError::PairingFailed(format!("Failed to read packet header: {}", e)))?;

    if header[0] != PACKET_VERSION {
        return Err(AdbError::PairingFailed(format!(
            "Unsupported packet version: {}",
            header[0]
        )));
    }
    let kind = PacketType::from_u8(header[1])
        .ok_or_else(|| AdbError::PairingFailed(format!("Unknown packet type: {}", header[1])))?;

    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    if len > MAX_PACKET_PAYLOAD {
        return Err(AdbError::PairingFailed(format!(
            "Packet payload of {} bytes exceeds {}",
            len, MAX_PACKET_PAYLOAD
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| AdbError::PairingFailed(format!("Failed to read packet payload: {}", e)))?;

    Ok((kind, payload))
}

/// Upper bound for the whole pairing exchange
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(15);

/// Pairs this installation's key with a wireless debugging daemon
pub struct PairingClient {
    identity: Arc<KeyIdentity>,
    timeout: Duration,
}

impl PairingClient {
    pub fn new(identity: Arc<KeyIdentity>) -> Self {
        Self {
            identity,
            timeout: PAIRING_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the full pairing exchange against the daemon at `addr`.
    ///
    /// Every failure, including a daemon that stops answering within the
    /// timeout, is reported as [`AdbError::PairingFailed`].
    pub async fn pair(&self, addr: SocketAddr, code: &str) -> Result<(), AdbError> {
        let result = match tokio::time::timeout(self.timeout, self.exchange(addr, code)).await {
            Ok(result) => result,
            Err(_) => Err(AdbError::Timeout),
        };

        result.map_err(|e| match e {
            AdbError::PairingFailed(_) => e,
            other => AdbError::PairingFailed(other.to_string()),
        })
    }

    async fn exchange(&self, addr: SocketAddr, code: &str) -> Result<(), AdbError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| AdbError::PairingFailed(format!("Failed to connect to {}: {}", addr, e)))?;

        let mut stream = self
            .identity
            .tls_context()
            .connector()
            .connect(tls::server_name()?, tcp)
            .await
            .map_err(|e| AdbError::PairingFailed(format!("TLS handshake failed: {}", e)))?;

        let exported = stream
            .get_ref()
            .1
            .export_keying_material([0u8; EXPORTED_KEY_SIZE], EXPORTED_KEY_LABEL, None)
            .map_err(|e| AdbError::PairingFailed(format!("Keying material export failed: {}", e)))?;

        let mut password = code.as_bytes().to_vec();
        password.extend_from_slice(&exported);
        let mut auth = PairingAuth::new(PairingRole::Client, &password);

        write_packet(&mut stream, PacketType::Spake2Msg, auth.msg()).await?;
        let (kind, their_msg) = read_packet(&mut stream).await?;
        if kind != PacketType::Spake2Msg {
            return Err(AdbError::PairingFailed(format!(
                "Expected SPAKE2 message, got {:?}",
                kind
            )));
        }
        auth.init_cipher(&their_msg)?;

        let ours = PeerInfo::new(PeerInfoType::RsaPubKey, self.identity.public_key_blob())?;
        let encrypted = auth.encrypt(&ours.to_bytes())?;
        write_packet(&mut stream, PacketType::PeerInfo, &encrypted).await?;

        let (kind, payload) = read_packet(&mut stream).await?;
        if kind != PacketType::PeerInfo {
            return Err(AdbError::PairingFailed(format!(
                "Expected peer info, got {:?}",
                kind
            )));
        }
        let theirs = PeerInfo::from_bytes(&auth.decrypt(&payload)?)?;
        if theirs.kind != PeerInfoType::DeviceGuid {
            return Err(AdbError::PairingFailed(format!(
                "Expected device GUID from daemon, got {:?}",
                theirs.kind
            )));
        }
        log::info!("Paired with {}", String::from_utf8_lossy(&theirs.data));

        if let Err(e) = stream.shutdown().await {
            log::debug!("Error while closing pairing connection: {}", e);
        }
        Ok(())
    }
}
