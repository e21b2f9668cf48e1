use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// ADB protocol version sent in CNXN (the first version allowed to skip checksums)
pub const ADB_VERSION: u32 = 0x01000001;

/// STLS protocol version
pub const ADB_STLS_VERSION: u32 = 0x01000000;

/// Maximum data payload size we advertise
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// Size of the fixed message header
pub const HEADER_LEN: usize = 24;

/// ADB command constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Connect
    Cnxn = 0x4e584e43,
    /// Authentication
    Auth = 0x48545541,
    /// Open stream
    Open = 0x4e45504f,
    /// OK/Ready
    Okay = 0x59414b4f,
    /// Close stream
    Clse = 0x45534c43,
    /// Write data
    Wrte = 0x45545257,
    /// Start TLS
    Stls = 0x534c5453,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x4e584e43 => Some(Command::Cnxn),
            0x48545541 => Some(Command::Auth),
            0x4e45504f => Some(Command::Open),
            0x59414b4f => Some(Command::Okay),
            0x45534c43 => Some(Command::Clse),
            0x45545257 => Some(Command::Wrte),
            0x534c5453 => Some(Command::Stls),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Cnxn => write!(f, "CNXN"),
            Command::Auth => write!(f, "AUTH"),
            Command::Open => write!(f, "OPEN"),
            Command::Okay => write!(f, "OKAY"),
            Command::Clse => write!(f, "CLSE"),
            Command::Wrte => write!(f, "WRTE"),
            Command::Stls => write!(f, "STLS"),
        }
    }
}

/// Authentication types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Token (challenge from device)
    Token = 1,
    /// Signature (response to challenge)
    Signature = 2,
    /// RSA public key
    RsaPublicKey = 3,
}

/// ADB message header (24 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_crc32: u32,
    pub magic: u32,
}

impl Message {
    /// Create a new message with the legacy byte-sum checksum
    pub fn new(command: Command, arg0: u32, arg1: u32, data: &[u8]) -> Self {
        let data_crc32 = if data.is_empty() { 0 } else { checksum(data) };
        Self::with_checksum(command, arg0, arg1, data, data_crc32)
    }

    /// Create a new message with a zero checksum, used once TLS carries integrity
    pub fn without_checksum(command: Command, arg0: u32, arg1: u32, data: &[u8]) -> Self {
        Self::with_checksum(command, arg0, arg1, data, 0)
    }

    fn with_checksum(command: Command, arg0: u32, arg1: u32, data: &[u8], data_crc32: u32) -> Self {
        Self {
            command,
            arg0,
            arg1,
            data_length: data.len() as u32,
            data_crc32,
            magic: (command as u32) ^ 0xffffffff,
        }
    }

    /// Serialize message header to bytes (little-endian)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        bytes.extend_from_slice(&(self.command as u32).to_le_bytes());
        bytes.extend_from_slice(&self.arg0.to_le_bytes());
        bytes.extend_from_slice(&self.arg1.to_le_bytes());
        bytes.extend_from_slice(&self.data_length.to_le_bytes());
        bytes.extend_from_slice(&self.data_crc32.to_le_bytes());
        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes
    }

    /// Deserialize message header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() < HEADER_LEN {
            return Err(AdbError::InvalidMessage("Message too short".to_string()));
        }

        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let raw_command = word(0);
        let magic = word(20);

        // Verify magic before trusting the command value
        if magic != raw_command ^ 0xffffffff {
            return Err(AdbError::InvalidMessage("Magic checksum mismatch".to_string()));
        }

        let command = Command::from_u32(raw_command).ok_or_else(|| {
            AdbError::InvalidMessage(format!("Unknown command: 0x{:08x}", raw_command))
        })?;

        Ok(Self {
            command,
            arg0: word(4),
            arg1: word(8),
            data_length: word(12),
            data_crc32: word(16),
            magic,
        })
    }

    /// Verify data checksum
    pub fn verify_data(&self, data: &[u8]) -> bool {
        if self.data_length as usize != data.len() {
            return false;
        }
        if data.is_empty() {
            return self.data_crc32 == 0;
        }
        checksum(data) == self.data_crc32
    }
}

/// Calculate the ADB payload checksum (sum of all bytes, wrapping)
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Encode a full frame: header followed by payload.
pub fn encode(message: &Message, data: &[u8]) -> Vec<u8> {
    let mut frame = message.to_bytes();
    frame.extend_from_slice(data);
    frame
}

/// Read one frame from `reader`.
///
/// Reads exactly [`HEADER_LEN`] bytes, validates the header, then reads the
/// announced payload. A stream that ends mid-frame is reported as
/// [`AdbError::InvalidMessage`]; checksum policy is left to the caller since it
/// depends on whether TLS is active.
pub async fn decode<R>(reader: &mut R, max_payload: u32) -> Result<(Message, Vec<u8>), AdbError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    read_full(reader, &mut header, "header").await?;
    let message = Message::from_bytes(&header)?;

    if message.data_length > max_payload {
        return Err(AdbError::InvalidMessage(format!(
            "Payload of {} bytes exceeds maximum {}",
            message.data_length, max_payload
        )));
    }

    let mut data = vec![0u8; message.data_length as usize];
    if !data.is_empty() {
        read_full(reader, &mut data, "payload").await?;
    }

    Ok((message, data))
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), AdbError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    reader.read_exact(buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            AdbError::InvalidMessage(format!("Connection closed while reading {}", what))
        }
        _ => AdbError::IoError(e.to_string()),
    })?;
    Ok(())
}

/// ADB connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
    Streaming,
    Closed,
}

/// Stream information
#[derive(Debug, Clone)]
pub struct Stream {
    pub local_id: u32,
    pub remote_id: u32,
}

/// ADB errors
#[derive(Error, Debug)]
pub enum AdbError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    #[error("Timed out")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Not connected")]
    NotConnected,
}

impl From<std::io::Error> for AdbError {
    fn from(value: std::io::Error) -> Self {
        AdbError::IoError(value.to_string())
    }
}
