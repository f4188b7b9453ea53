//! Test Harness - loopback servers, clients and throwaway TLS material

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ftcomm_transport::tls::TlsProviderKind;
use ftcomm_transport::{Client, ClientOptions, RetryConfig, Server, ServerOptions, TlsOptions, TransportOptions};
use tempfile::TempDir;

/// Routes transport logs to the test writer; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `predicate` until it holds or `timeout` passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }
}

/// Small, fast transport settings for loopback runs.
pub fn transport_options(workers: usize, links_per_worker: usize) -> TransportOptions {
    TransportOptions {
        worker_count: workers,
        max_links_per_worker: links_per_worker,
        poll_timeout_ms: 20,
        cleanup_delay_ms: 50,
        handshake_timeout_ms: 2_000,
        ..TransportOptions::default()
    }
}

pub fn server_options(workers: usize, links_per_worker: usize) -> ServerOptions {
    ServerOptions {
        listen_addr: "127.0.0.1:0".to_string(),
        transport: transport_options(workers, links_per_worker),
        ..ServerOptions::default()
    }
}

pub fn client_options(server: SocketAddr, rank: u64) -> ClientOptions {
    ClientOptions {
        server_addr: server.to_string(),
        rank_id: rank,
        transport: transport_options(1, 4),
        connect_retry: RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
            jitter: false,
        },
        connect_timeout_ms: 2_000,
        ..ClientOptions::default()
    }
}

/// Starts `server` and returns its bound address.
pub fn start_server(server: &Server) -> SocketAddr {
    server.start().expect("server start");
    server.local_addr().expect("server bound")
}

/// Starts one client per rank against `addr` and waits until the server sees them all.
pub fn connect_clients(server: &Server, addr: SocketAddr, ranks: &[u64], setup: impl Fn(&Arc<Client>)) -> Vec<Arc<Client>> {
    let clients: Vec<Arc<Client>> = ranks
        .iter()
        .map(|&rank| {
            let client = Arc::new(Client::new(client_options(addr, rank)));
            setup(&client);
            client.start().expect("client start");
            client
        })
        .collect();
    let all_seen = wait_until(Duration::from_secs(5), || {
        ranks.iter().all(|rank| server.link(*rank).is_some())
    });
    assert!(all_seen, "server did not register every rank");
    clients
}

/// A CA plus one node certificate valid for 127.0.0.1, written under a tempdir.
#[derive(Debug)]
pub struct TlsFixture {
    env: TestEnv,
    base: PathBuf,
}

impl TlsFixture {
    pub fn new() -> Self {
        let env = TestEnv::new("tls");
        let ca_key = rcgen::KeyPair::generate().expect("ca key");
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).expect("ca params");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        // leaf and CA need distinct subjects or OpenSSL sees a self-signed leaf
        ca_params.distinguished_name.push(rcgen::DnType::CommonName, "ftcomm test ca");
        let ca = ca_params.self_signed(&ca_key).expect("ca cert");

        let node_key = rcgen::KeyPair::generate().expect("node key");
        let mut node_params = rcgen::CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .expect("node params");
        node_params.distinguished_name.push(rcgen::DnType::CommonName, "node");
        let node = node_params.signed_by(&node_key, &ca, &ca_key).expect("node cert");

        fs::write(env.tempdir().join("ca.pem"), ca.pem()).expect("write ca");
        fs::write(env.tempdir().join("node.pem"), node.pem()).expect("write cert");
        fs::write(env.tempdir().join("node.key"), node_key.serialize_pem()).expect("write key");
        let base = fs::canonicalize(env.tempdir()).expect("canonical base");
        Self { env, base }
    }

    pub fn dir(&self) -> &Path {
        self.env.tempdir()
    }

    pub fn options(&self) -> TlsOptions {
        self.options_for(TlsProviderKind::Rustls)
    }

    pub fn options_for(&self, provider: TlsProviderKind) -> TlsOptions {
        TlsOptions {
            enabled: true,
            provider,
            ca_paths: vec![self.base.join("ca.pem")],
            cert_path: Some(self.base.join("node.pem")),
            key_path: Some(self.base.join("node.key")),
            base_dir: self.base.clone(),
            ..TlsOptions::default()
        }
    }
}

impl Default for TlsFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_tempdir_unique() {
        let env1 = TestEnv::new("test1");
        let env2 = TestEnv::new("test2");
        assert_ne!(env1.tempdir(), env2.tempdir());
        assert_eq!(env1.test_name(), "test1");
    }

    #[test]
    fn test_tls_fixture_files() {
        let fixture = TlsFixture::new();
        let options = fixture.options();
        assert!(options.validate().is_ok());
        assert!(fixture.dir().join("node.key").exists());
        assert!(options.cert_path.unwrap().starts_with(&options.base_dir));
    }

    #[test]
    fn test_wait_until_times_out() {
        let start = Instant::now();
        assert!(!wait_until(Duration::from_millis(30), || false));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(wait_until(Duration::from_millis(30), || true));
    }
}
