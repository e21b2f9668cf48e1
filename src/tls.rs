//! TLS client identity derived from the installation's RSA key.
//!
//! adbd authenticates TLS clients by the public key inside their certificate,
//! so the certificate only has to be self-signed by the same key used for
//! legacy AUTH. The daemon's own certificate is self-signed as well and is not
//! checked against any root store.

use crate::auth::AdbKeyPair;
use crate::protocol::AdbError;
use rcgen::{CertificateParams, DistinguishedName, DnType, PKCS_RSA_SHA256};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Client-side TLS configuration carrying the ADB identity
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    certificate: CertificateDer<'static>,
}

impl TlsContext {
    /// Build a TLS 1.3 client context whose certificate is signed by `keypair`
    pub fn from_keypair(keypair: &AdbKeyPair, common_name: &str) -> Result<Self, AdbError> {
        let key_der = keypair.private_key_pkcs8_der()?;

        let signing_key = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(key_der.as_slice()),
            &PKCS_RSA_SHA256,
        )
        .map_err(|e| AdbError::TlsError(format!("Failed to load key for certificate: {}", e)))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| AdbError::TlsError(format!("Invalid certificate parameters: {}", e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let certificate = params
            .self_signed(&signing_key)
            .map_err(|e| AdbError::TlsError(format!("Failed to sign certificate: {}", e)))?
            .der()
            .clone();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| AdbError::TlsError(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_client_auth_cert(
                vec![certificate.clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
            )
            .map_err(|e| AdbError::TlsError(format!("Failed to install client certificate: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
            certificate,
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }
}

/// Name presented in SNI; adbd ignores it.
pub fn server_name() -> Result<ServerName<'static>, AdbError> {
    ServerName::try_from("adb.localhost").map_err(|e| AdbError::TlsError(e.to_string()))
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
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
