#![allow(dead_code)]

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use telemetry_gateway::db::Store;
use telemetry_gateway::mqtt::{
    Broker, BrokerConfig, Hook, Hooks, HooksBuilder, IngestConfig, IngestHook, LoggingHook,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DATA_PREFIX: &str = "/peripherals/readings/";

/// Adds a test hook to the broker's chain
pub type ExtraHook = Box<dyn FnOnce(HooksBuilder) -> HooksBuilder>;

/// A throwaway PKI: one CA, a server certificate for localhost and one
/// device certificate, all written as PEM into a temporary directory. Also
/// holds a device certificate from an unrelated CA.
pub struct Pki {
    _dir: TempDir,
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub ca_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
    pub rogue_cert_pem: String,
    pub rogue_key_pem: String,
}

fn named(common_name: &str, mut params: CertificateParams) -> CertificateParams {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    params.distinguished_name = name;
    params
}

fn authority(common_name: &str) -> (Certificate, Issuer<'static, KeyPair>) {
    let key = KeyPair::generate().unwrap();
    let mut params = named(common_name, CertificateParams::default());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let cert = params.self_signed(&key).unwrap();
    (cert, Issuer::new(params, key))
}

/// A device certificate and its key, both PEM
fn device(common_name: &str, issuer: &Issuer<'static, KeyPair>) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let mut params = named(common_name, CertificateParams::default());
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let cert = params.signed_by(&key, issuer).unwrap();
    (cert.pem(), key.serialize_pem())
}

impl Pki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let (ca_cert, issuer) = authority("Test Gateway CA");

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = named(
            "localhost",
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap(),
        );
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params.signed_by(&server_key, &issuer).unwrap();

        let (client_cert_pem, client_key_pem) = device("device-001", &issuer);

        // Same device name, signed by a CA the gateway does not trust
        let (_, rogue_issuer) = authority("Rogue CA");
        let (rogue_cert_pem, rogue_key_pem) = device("device-001", &rogue_issuer);

        let pki = Pki {
            ca_cert: dir.path().join("ca.crt"),
            server_cert: dir.path().join("server.crt"),
            server_key: dir.path().join("server.key"),
            ca_pem: ca_cert.pem(),
            client_cert_pem,
            client_key_pem,
            rogue_cert_pem,
            rogue_key_pem,
            _dir: dir,
        };
        fs::write(&pki.ca_cert, &pki.ca_pem).unwrap();
        fs::write(&pki.server_cert, server_cert.pem()).unwrap();
        fs::write(&pki.server_key, server_key.serialize_pem()).unwrap();
        pki
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            cert_path: self.server_cert.clone(),
            key_path: self.server_key.clone(),
            ca_path: self.ca_cert.clone(),
            max_packet_size: 256 * 1024,
        }
    }
}

/// A broker running in the background with the logging and ingest hooks,
/// plus any extra hooks the test supplies.
pub struct RunningBroker {
    pub pki: Pki,
    pub store: Store,
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<telemetry_gateway::errors::Result<()>>,
}

impl RunningBroker {
    pub async fn start(extra: Vec<ExtraHook>) -> Self {
        let pki = Pki::generate();
        let store = Store::connect(":memory:").await.unwrap();

        let ingest = IngestHook::new(IngestConfig {
            topic_prefix: DATA_PREFIX.to_string(),
            store: store.clone(),
        })
        .unwrap();
        let mut builder = Hooks::builder().add(LoggingHook).unwrap().add(ingest).unwrap();
        for add in extra {
            builder = add(builder);
        }

        let broker = Broker::bind(&pki.broker_config(), builder.build()).await.unwrap();
        let addr = broker.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(broker.run(shutdown.clone()));

        RunningBroker {
            pki,
            store,
            addr,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
        self.store.close().await;
    }
}

/// Adds `hook` to the chain built by [`RunningBroker::start`].
pub fn with_hook<H: Hook + 'static>(hook: H) -> ExtraHook {
    Box::new(move |builder| builder.add(hook).unwrap())
}

/// Polls `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
