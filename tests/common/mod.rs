//! Fakes shared by the integration tests: a scripted adbd, a scripted pairing
//! daemon, a scripted service browser and instrumented connectors.
#![allow(dead_code)]

use async_trait::async_trait;
use rsa::Pkcs1v15Sign;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use sha1::Sha1;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use wadb_rs::auth::{AdbKeyPair, KeyIdentity, KeyStore, MemoryKeyStore, PRIVATE_KEY_ENTRY, TOKEN_SIZE};
use wadb_rs::config::AdbConfig;
use wadb_rs::discovery::{AdbServiceType, BrowseEvent, DiscoveredService, ServiceBrowser, ServiceRef};
use wadb_rs::pairing::{
    read_packet, write_packet, PacketType, PairingAuth, PairingRole, PeerInfo, PeerInfoType,
    EXPORTED_KEY_LABEL, EXPORTED_KEY_SIZE,
};
use wadb_rs::protocol::{
    self, AdbError, AuthType, Command, Message, ADB_STLS_VERSION, ADB_VERSION, MAX_PAYLOAD,
};
use wadb_rs::transport::{BoxedStream, Connector};

pub const DEVICE_NAME: &str = "test-host";
pub const DEVICE_BANNER: &str = "device::ro.product.name=fake;";
const REMOTE_ID: u32 = 42;

/// One RSA key per test binary; generation is slow
pub fn shared_keypair() -> &'static AdbKeyPair {
    static KEY: OnceLock<AdbKeyPair> = OnceLock::new();
    KEY.get_or_init(|| AdbKeyPair::generate().unwrap())
}

pub fn test_identity() -> Arc<KeyIdentity> {
    Arc::new(KeyIdentity::new(shared_keypair().clone(), DEVICE_NAME).unwrap())
}

/// Key store that already holds the shared key
pub fn seeded_store() -> Arc<MemoryKeyStore> {
    let store = MemoryKeyStore::new();
    let pem = shared_keypair().private_key_pem().unwrap();
    store.put(PRIVATE_KEY_ENTRY, pem.as_bytes()).unwrap();
    Arc::new(store)
}

pub fn test_config() -> AdbConfig {
    AdbConfig {
        device_name: DEVICE_NAME.to_string(),
        connect_retry_delay_ms: 10,
        ..AdbConfig::default()
    }
}

/// Server TLS config that demands a client certificate and records it
pub fn server_tls_config(client_certs: Arc<RecordingClientCerts>) -> Arc<ServerConfig> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(client_certs.provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_client_cert_verifier(client_certs)
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .unwrap();
    Arc::new(config)
}

/// Accepts any client certificate, as adbd does before checking its key
#[derive(Debug)]
pub struct RecordingClientCerts {
    provider: Arc<CryptoProvider>,
    presented: Mutex<Vec<CertificateDer<'static>>>,
}

impl RecordingClientCerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            presented: Mutex::new(Vec::new()),
        })
    }

    pub fn presented(&self) -> Vec<CertificateDer<'static>> {
        self.presented.lock().unwrap().clone()
    }
}

impl ClientCertVerifier for RecordingClientCerts {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.presented
            .lock()
            .unwrap()
            .push(end_entity.clone().into_owned());
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// How the fake daemon answers the client's CNXN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Replies CNXN straight away
    Open,
    /// Upgrades to TLS first
    Tls,
    /// Legacy AUTH; accepts the shared key's signature
    Legacy,
    /// Legacy AUTH; rejects every signature and asks for the public key
    LegacyUnknownKey,
}

/// What the fake daemon does once the shell stream is open
#[derive(Debug, Clone)]
pub enum ShellReply {
    Output(Vec<u8>),
    EmptyWriteThenOutput(Vec<u8>),
    Close,
    /// Sends a frame that does not belong in a stream
    Unexpected,
    /// Opens the stream and then never answers
    Stall,
}

struct Script {
    auth: AuthMode,
    reply: ShellReply,
    tls: Arc<ServerConfig>,
    opened: Arc<Mutex<Vec<String>>>,
    public_keys: Arc<Mutex<Vec<Vec<u8>>>>,
    sessions: Arc<AtomicUsize>,
}

/// adbd stand-in listening on 127.0.0.1
pub struct FakeDaemon {
    pub addr: SocketAddr,
    pub opened: Arc<Mutex<Vec<String>>>,
    pub public_keys: Arc<Mutex<Vec<Vec<u8>>>>,
    pub sessions: Arc<AtomicUsize>,
    pub client_certs: Arc<RecordingClientCerts>,
    task: JoinHandle<()>,
}

impl FakeDaemon {
    pub async fn start(auth: AuthMode, reply: ShellReply) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let opened = Arc::new(Mutex::new(Vec::new()));
        let public_keys = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let client_certs = RecordingClientCerts::new();
        let script = Arc::new(Script {
            auth,
            reply,
            tls: server_tls_config(client_certs.clone()),
            opened: opened.clone(),
            public_keys: public_keys.clone(),
            sessions: sessions.clone(),
        });

        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let script = script.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_adb(socket, &script).await {
                        eprintln!("fake daemon: {}", e);
                    }
                });
            }
        });

        Self {
            addr,
            opened,
            public_keys,
            sessions,
            client_certs,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn public_keys(&self) -> Vec<Vec<u8>> {
        self.public_keys.lock().unwrap().clone()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send(
    io: &mut BoxedStream,
    command: Command,
    arg0: u32,
    arg1: u32,
    data: &[u8],
    tls: bool,
) -> Result<(), AdbError> {
    let message = if tls {
        Message::without_checksum(command, arg0, arg1, data)
    } else {
        Message::new(command, arg0, arg1, data)
    };
    io.write_all(&protocol::encode(&message, data)).await?;
    io.flush().await?;
    Ok(())
}

async fn expect(io: &mut BoxedStream, command: Command) -> Result<(Message, Vec<u8>), AdbError> {
    let (message, data) = protocol::decode(io, MAX_PAYLOAD).await?;
    if message.command != command {
        return Err(AdbError::InvalidMessage(format!(
            "expected {}, got {}",
            command, message.command
        )));
    }
    Ok((message, data))
}

async fn serve_adb(socket: TcpStream, script: &Script) -> Result<(), AdbError> {
    let mut io: BoxedStream = Box::new(socket);
    expect(&mut io, Command::Cnxn).await?;

    let mut tls = false;
    match script.auth {
        AuthMode::Open => {}
        AuthMode::Tls => {
            send(&mut io, Command::Stls, ADB_STLS_VERSION, 0, &[], false).await?;
            expect(&mut io, Command::Stls).await?;
            io = Box::new(TlsAcceptor::from(script.tls.clone()).accept(io).await?);
            tls = true;
        }
        AuthMode::Legacy | AuthMode::LegacyUnknownKey => {
            let token = [0x5a; TOKEN_SIZE];
            send(&mut io, Command::Auth, AuthType::Token as u32, 0, &token, false).await?;

            let (message, signature) = expect(&mut io, Command::Auth).await?;
            assert_eq!(message.arg0, AuthType::Signature as u32);

            let trusted = script.auth == AuthMode::Legacy
                && shared_keypair()
                    .public_key()
                    .verify(Pkcs1v15Sign::new::<Sha1>(), &token, &signature)
                    .is_ok();

            if !trusted {
                send(&mut io, Command::Auth, AuthType::Token as u32, 0, &token, false).await?;
                let (message, key) = expect(&mut io, Command::Auth).await?;
                assert_eq!(message.arg0, AuthType::RsaPublicKey as u32);
                script.public_keys.lock().unwrap().push(key);
            }
        }
    }

    let banner = format!("{}\0", DEVICE_BANNER);
    send(&mut io, Command::Cnxn, ADB_VERSION, MAX_PAYLOAD, banner.as_bytes(), tls).await?;
    script.sessions.fetch_add(1, Ordering::SeqCst);

    let (open, destination) = expect(&mut io, Command::Open).await?;
    script
        .opened
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&destination).trim_end_matches('\0').to_string());

    let local_id = open.arg0;
    send(&mut io, Command::Okay, REMOTE_ID, local_id, &[], tls).await?;

    match &script.reply {
        ShellReply::Output(data) => {
            send(&mut io, Command::Wrte, REMOTE_ID, local_id, data, tls).await?;
        }
        ShellReply::EmptyWriteThenOutput(data) => {
            send(&mut io, Command::Wrte, REMOTE_ID, local_id, &[], tls).await?;
            expect(&mut io, Command::Okay).await?;
            send(&mut io, Command::Wrte, REMOTE_ID, local_id, data, tls).await?;
        }
        ShellReply::Close => {
            send(&mut io, Command::Clse, REMOTE_ID, local_id, &[], tls).await?;
            expect(&mut io, Command::Clse).await?;
        }
        ShellReply::Unexpected => {
            send(&mut io, Command::Auth, AuthType::Token as u32, local_id, &[0; TOKEN_SIZE], tls).await?;
        }
        ShellReply::Stall => {}
    }

    // Hold the session open until the client hangs up
    let mut rest = Vec::new();
    let _ = io.read_to_end(&mut rest).await;
    Ok(())
}

/// Pairing daemon stand-in that knows one pairing code
pub struct FakePairingServer {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<PeerInfo>>>,
    task: JoinHandle<()>,
}

impl FakePairingServer {
    pub async fn start(code: &str) -> Self {
        Self::start_replying(code, PeerInfoType::DeviceGuid).await
    }

    /// Like [`start`](Self::start), but answers with a record of `reply_kind`
    pub async fn start_replying(code: &str, reply_kind: PeerInfoType) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let tls = server_tls_config(RecordingClientCerts::new());
        let code = code.to_string();

        let task = {
            let received = received.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    match serve_pairing(socket, &code, tls.clone(), reply_kind).await {
                        Ok(info) => received.lock().unwrap().push(info),
                        Err(e) => eprintln!("fake pairing server: {}", e),
                    }
                }
            })
        };

        Self {
            addr,
            received,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn received(&self) -> Vec<PeerInfo> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for FakePairingServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_pairing(
    socket: TcpStream,
    code: &str,
    tls: Arc<ServerConfig>,
    reply_kind: PeerInfoType,
) -> Result<PeerInfo, AdbError> {
    let mut stream = TlsAcceptor::from(tls).accept(socket).await?;

    let exported = stream
        .get_ref()
        .1
        .export_keying_material([0u8; EXPORTED_KEY_SIZE], EXPORTED_KEY_LABEL, None)
        .map_err(|e| AdbError::TlsError(e.to_string()))?;

    let mut password = code.as_bytes().to_vec();
    password.extend_from_slice(&exported);
    let mut auth = PairingAuth::new(PairingRole::Server, &password);

    let (kind, client_msg) = read_packet(&mut stream).await?;
    assert_eq!(kind, PacketType::Spake2Msg);
    write_packet(&mut stream, PacketType::Spake2Msg, auth.msg()).await?;
    auth.init_cipher(&client_msg)?;

    let (kind, payload) = read_packet(&mut stream).await?;
    assert_eq!(kind, PacketType::PeerInfo);
    // A client with the wrong code fails here and sees the connection drop
    let info = PeerInfo::from_bytes(&auth.decrypt(&payload)?)?;

    let reply = PeerInfo::new(reply_kind, b"adb-FAKE0001")?;
    let encrypted = auth.encrypt(&reply.to_bytes())?;
    write_packet(&mut stream, PacketType::PeerInfo, &encrypted).await?;

    let _ = stream.shutdown().await;
    Ok(info)
}

pub fn announced(name: &str, service_type: AdbServiceType, host: IpAddr, port: u16) -> DiscoveredService {
    DiscoveredService {
        name: name.to_string(),
        service_type,
        host,
        port,
    }
}

pub fn local_service(name: &str, service_type: AdbServiceType, port: u16) -> DiscoveredService {
    announced(name, service_type, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Browser whose announcements are controlled by the test
#[derive(Default)]
pub struct ScriptedBrowser {
    services: Mutex<Vec<DiscoveredService>>,
    listeners: Mutex<HashMap<AdbServiceType, mpsc::Sender<BrowseEvent>>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl ScriptedBrowser {
    pub fn new(services: Vec<DiscoveredService>) -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(services),
            ..Self::default()
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    /// Add a service, reporting it right away if its type is being browsed
    pub fn announce(&self, service: DiscoveredService) {
        let found = BrowseEvent::Found(ServiceRef {
            name: service.name.clone(),
            service_type: service.service_type,
        });
        let service_type = service.service_type;
        self.services.lock().unwrap().push(service);
        self.emit(service_type, found);
    }

    pub fn withdraw(&self, name: &str, service_type: AdbServiceType) {
        self.services.lock().unwrap().retain(|s| s.name != name);
        self.emit(
            service_type,
            BrowseEvent::Lost(ServiceRef {
                name: name.to_string(),
                service_type,
            }),
        );
    }

    fn emit(&self, service_type: AdbServiceType, event: BrowseEvent) {
        if let Some(events) = self.listeners.lock().unwrap().get(&service_type) {
            events.try_send(event).unwrap();
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceBrowser for ScriptedBrowser {
    fn start_browsing(
        &self,
        service_type: AdbServiceType,
        events: mpsc::Sender<BrowseEvent>,
    ) -> Result<(), AdbError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        for service in self.services.lock().unwrap().iter() {
            if service.service_type == service_type {
                let found = BrowseEvent::Found(ServiceRef {
                    name: service.name.clone(),
                    service_type,
                });
                events
                    .try_send(found)
                    .map_err(|e| AdbError::DiscoveryError(e.to_string()))?;
            }
        }
        self.listeners.lock().unwrap().insert(service_type, events);
        Ok(())
    }

    async fn resolve(&self, service: &ServiceRef) -> Option<DiscoveredService> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name == service.name && s.service_type == service.service_type)
            .cloned()
    }

    fn stop_browsing(&self, service_type: AdbServiceType) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().remove(&service_type);
    }
}

/// Connector that always fails with "connection refused"
#[derive(Default)]
pub struct RefusingConnector {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, _addr: SocketAddr) -> io::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::from(io::ErrorKind::ConnectionRefused))
    }
}

/// TCP connector that tracks how many of its streams are alive at once
#[derive(Default)]
pub struct CountingConnector {
    pub connects: AtomicUsize,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl CountingConnector {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let inner = TcpStream::connect(addr).await?;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(TrackedStream {
            inner,
            active: self.active.clone(),
        }))
    }
}

struct TrackedStream {
    inner: TcpStream,
    active: Arc<AtomicUsize>,
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
