//! Active certificate fetch: for flows bound at TCP port 443, dials the
//! server over TLS (no certificate verification — we only want the leaf
//! cert, not to validate trust) and captures the first peer certificate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::ErrorClass;
use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::tables::cert_cache::FetchOutcome;
use crate::tables::SessionRef;

use super::cert_common::{parse_der, project_cert};
use super::context::PluginContext;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts any certificate chain; this dial only needs the leaf cert, not
/// trust validation.
#[derive(Debug)]
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
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

    fn verify_tls12_signature(&self, _message: &[u8], _cert: &CertificateDer<'_>, _dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(&self, _message: &[u8], _cert: &CertificateDer<'_>, _dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

async fn dial_and_capture(server_addr: &str, host: &str) -> anyhow::Result<Vec<u8>> {
    let connect = async {
        let stream = TcpStream::connect(server_addr).await?;
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth();
        config.enable_sni = true;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())?;
        let tls_stream = connector.connect(server_name, stream).await?;
        let (_, conn) = tls_stream.get_ref();
        let certs = conn.peer_certificates().ok_or_else(|| anyhow::anyhow!("no peer certificates presented"))?;
        let first = certs.first().ok_or_else(|| anyhow::anyhow!("empty certificate chain"))?;
        Ok::<Vec<u8>, anyhow::Error>(first.to_vec())
    };
    tokio::time::timeout(DIAL_TIMEOUT, connect).await?
}

pub struct CertFetchPlugin {
    ctx: Arc<PluginContext>,
}

impl CertFetchPlugin {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Plugin for CertFetchPlugin {
    fn name(&self) -> &'static str {
        "certfetch"
    }

    fn priority(&self) -> i32 {
        super::priority::CERTFETCH_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, _new_session: bool) -> NfqueueResult {
        if !msg.client_to_server || msg.tuple.protocol != crate::model::Tuple::PROTO_TCP || msg.tuple.server_port != 443 {
            return NfqueueResult::default();
        }

        {
            let mut guard = session.lock().await;
            if guard.attachments.contains("certfetch_started") {
                return NfqueueResult::default();
            }
            guard.put("certfetch_started", Value::Bool(true));
        }

        let server_ip = msg.tuple.server_addr;
        let server_port = msg.tuple.server_port;
        let server_addr = format!("{server_ip}:{server_port}");
        let cache = self.ctx.cert_cache.clone();
        let dict = self.ctx.dict.clone();
        let disable_dict = self.ctx.config.disable_dict;
        let metrics = self.ctx.metrics.clone();
        let session = session.clone();
        let conntrack_id = msg.conntrack_id;

        metrics.cert_cache_fetches.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        tokio::spawn(async move {
            let outcome = cache.get_or_insert(&server_addr);
            let holder = match outcome {
                FetchOutcome::YouFetch(holder) => {
                    match dial_and_capture(&server_addr, &server_ip.to_string()).await {
                        Ok(der) => match parse_der(der) {
                            Some(cert) => holder.fulfil(Arc::new(cert)).await,
                            None => holder.fail().await,
                        },
                        Err(e) => {
                            debug!("certfetch dial to {server_addr} failed: {e}");
                            metrics.record_error(ErrorClass::TransientExternal);
                            holder.fail().await;
                        }
                    }
                    holder
                }
                FetchOutcome::Wait(holder) => holder,
            };

            if let Some(cert) = holder.wait_ready().await {
                project_cert(&session, &dict, disable_dict, conntrack_id, cert).await;
            } else {
                let mut guard = session.lock().await;
                guard.put("certificate_status", Value::Str("unavailable".to_string()));
            }
        });

        NfqueueResult::release()
    }
}
