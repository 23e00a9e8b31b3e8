use crate::error::{Result, ScanError};
use reqwest::{Client, ClientBuilder};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use url::Url;
use x509_parser::parse_x509_certificate;

pub const USER_AGENT: &str = concat!("stackprint/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Issuer name components of a TLS peer certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCertificate {
    pub issuer: Vec<String>,
}

impl PeerCertificate {
    pub fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = parse_x509_certificate(der).ok()?;
        let issuer = cert
            .issuer()
            .iter_attributes()
            .filter_map(|attr| attr.as_str().ok())
            .map(str::to_string)
            .collect();
        Some(Self { issuer })
    }
}

/// Accepts every server certificate and remembers the chain each server
/// presented, keyed by server name.
#[derive(Debug)]
pub(crate) struct ChainRecorder {
    chains: Mutex<HashMap<String, Vec<PeerCertificate>>>,
    schemes: Vec<SignatureScheme>,
}

impl ChainRecorder {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
            schemes: provider.signature_verification_algorithms.supported_schemes(),
        }
    }

    /// Leaf first, then intermediates in the order the server sent them.
    pub(crate) fn chain_for(&self, host: &str) -> Vec<PeerCertificate> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.chains
            .lock()
            .map(|chains| chains.get(host).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl ServerCertVerifier for ChainRecorder {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let chain: Vec<PeerCertificate> = std::iter::once(end_entity)
            .chain(intermediates)
            .filter_map(|der| PeerCertificate::from_der(der))
            .collect();

        if let Ok(mut chains) = self.chains.lock() {
            chains.insert(server_name.to_str().into_owned(), chain);
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Everything the fingerprint engine needs from one successful GET.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub certificates: Vec<PeerCertificate>,
    pub body: String,
}

impl FetchedPage {
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn cookie_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Single-shot HTTP GET client. Certificate validation is disabled so that
/// misconfigured hosts can still be fingerprinted.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    chains: Arc<ChainRecorder>,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(timeout_secs: u64) -> Result<Self> {
        Self::build(timeout_secs, |builder| builder)
    }

    /// Build a fetcher whose client settings can be adjusted before the
    /// client is created, e.g. to pin host names to local addresses.
    pub fn build<F>(timeout_secs: u64, configure: F) -> Result<Self>
    where
        F: FnOnce(ClientBuilder) -> ClientBuilder,
    {
        let provider = Arc::new(ring::default_provider());
        let chains = Arc::new(ChainRecorder::new(&provider));

        let mut tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(chains.clone())
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let timeout = Duration::from_secs(timeout_secs);
        let builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .pool_idle_timeout(timeout)
            .use_preconfigured_tls(tls);
        let client = configure(builder).build()?;

        Ok(Self { client, chains })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        debug!("Fetching {}", url);

        let parsed =
            Url::parse(url).map_err(|e| ScanError::InvalidUrl(format!("{}: {}", url, e)))?;
        let response = self.client.get(parsed).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::BadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let cookies = response
            .cookies()
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();

        // Redirects may land on another host; the chain belongs to the final one.
        let final_url = response.url();
        let certificates = match (final_url.scheme(), final_url.host_str()) {
            ("https", Some(host)) => self.chains.chain_for(host),
            _ => Vec::new(),
        };

        let body = response.text().await?;

        Ok(FetchedPage {
            url: url.to_string(),
            status: status.as_u16(),
            headers,
            cookies,
            certificates,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn test_fetch_captures_headers_cookies_and_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-powered-by", "PHP/8.2")
                    .append_header("set-cookie", "PHPSESSID=abc123; Path=/")
                    .set_body_string("<html><body>hello</body></html>"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let page = fetcher.fetch(&mock_server.uri()).await.unwrap();

        assert_eq!(page.status, 200);
        assert!(page.body.contains("hello"));
        assert!(
            page.header_pairs()
                .any(|(n, v)| n == "x-powered-by" && v == "PHP/8.2")
        );
        assert_eq!(
            page.cookies,
            vec![("PHPSESSID".to_string(), "abc123".to_string())]
        );
        assert!(page.certificates.is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let result = fetcher.fetch(&mock_server.uri()).await;

        assert!(matches!(result, Err(ScanError::BadStatus { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let fetcher = Fetcher::new().unwrap();
        let result = fetcher.fetch("not a url").await;

        assert!(matches!(result, Err(ScanError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::with_timeout(1).unwrap();
        let result = fetcher.fetch(&mock_server.uri()).await;

        assert!(matches!(result, Err(ScanError::HttpError(_))));
    }

    const SITE_CERT: &[u8] = include_bytes!("../tests/fixtures/site.test.der");
    const INTERMEDIATE_CERT: &[u8] = include_bytes!("../tests/fixtures/intermediate.der");

    #[test]
    fn test_garbage_certificate_is_ignored() {
        assert!(PeerCertificate::from_der(b"definitely not DER").is_none());
    }

    #[test]
    fn test_issuer_components_from_der() {
        let cert = PeerCertificate::from_der(SITE_CERT).unwrap();
        assert_eq!(
            cert.issuer,
            vec!["US", "Stackprint Test CA", "Stackprint Test Intermediate"]
        );
    }

    #[test]
    fn test_chain_recorder_keeps_leaf_and_intermediates() {
        let recorder = ChainRecorder::new(&ring::default_provider());
        let leaf = CertificateDer::from(SITE_CERT.to_vec());
        let intermediates = [
            CertificateDer::from(INTERMEDIATE_CERT.to_vec()),
            CertificateDer::from(b"not a certificate".to_vec()),
        ];
        let server_name = ServerName::try_from("site.test").unwrap();

        let verified = recorder.verify_server_cert(
            &leaf,
            &intermediates,
            &server_name,
            &[],
            UnixTime::now(),
        );
        assert!(verified.is_ok());

        let chain = recorder.chain_for("site.test");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].issuer[1], "Stackprint Test CA");
        assert_eq!(
            chain[1].issuer,
            vec!["US", "Stackprint Root Authority", "Stackprint Test Root"]
        );
        assert!(recorder.chain_for("other.test").is_empty());
    }

    #[test]
    fn test_chain_recorder_keys_ip_addresses_without_brackets() {
        let recorder = ChainRecorder::new(&ring::default_provider());
        let leaf = CertificateDer::from(SITE_CERT.to_vec());
        let server_name = ServerName::try_from("::1").unwrap();

        recorder
            .verify_server_cert(&leaf, &[], &server_name, &[], UnixTime::now())
            .unwrap();

        assert_eq!(recorder.chain_for("[::1]").len(), 1);
    }

    #[tokio::test]
    async fn test_plain_http_has_no_certificates() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let page = fetcher.fetch(&mock_server.uri()).await.unwrap();
        assert!(page.certificates.is_empty());
    }

    #[tokio::test]
    async fn test_build_can_pin_host_names() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("host", "pinned.test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pinned"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let addr = *mock_server.address();
        let fetcher = Fetcher::build(2, |builder| builder.resolve("pinned.test", addr)).unwrap();
        let page = fetcher.fetch("http://pinned.test").await.unwrap();

        assert_eq!(page.body, "pinned");
    }
}
