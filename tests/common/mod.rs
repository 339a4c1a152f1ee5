//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use tunnel_fleet::config::schema::{FleetConfig, PathsConfig, StoreConfig, SupervisorConfig};
use tunnel_fleet::registry::StaticRegistry;
use tunnel_fleet::Fleet;

/// Spawning processes while another test thread holds a freshly written
/// script open for writing fails with ETXTBSY; process tests take this first.
pub static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// A fleet rooted in a temporary data directory.
pub struct TestFleet {
    pub dir: TempDir,
    pub config: FleetConfig,
    pub registry: Arc<StaticRegistry>,
    pub fleet: Fleet,
}

impl TestFleet {
    /// A fleet with the given registered clients, each with an empty
    /// directory and no document.
    pub fn new(client_ids: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = FleetConfig {
            paths: PathsConfig {
                data_dir: dir.path().to_path_buf(),
                ..PathsConfig::default()
            },
            store: StoreConfig {
                lock_timeout_ms: 2_000,
                lock_poll_interval_ms: 10,
            },
            supervisor: SupervisorConfig {
                stop_timeout_ms: 1_000,
                stop_poll_interval_ms: 25,
                ..SupervisorConfig::default()
            },
            ..FleetConfig::default()
        };
        for id in client_ids {
            std::fs::create_dir_all(dir.path().join(id)).unwrap();
        }
        let registry = Arc::new(StaticRegistry::new(client_ids.iter().copied()));
        let fleet = Fleet::new(&config, registry.clone());
        Self {
            dir,
            config,
            registry,
            fleet,
        }
    }

    pub fn document_path(&self, client_id: &str) -> PathBuf {
        self.dir.path().join(client_id).join("frpc.toml")
    }

    /// Write a document directly, bypassing validation.
    pub fn write_document(&self, client_id: &str, text: &str) {
        let path = self.document_path(client_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    pub fn read_document(&self, client_id: &str) -> String {
        std::fs::read_to_string(self.document_path(client_id)).unwrap()
    }

    /// Install a shell script as the client's executable.
    #[cfg(unix)]
    pub fn install_executable(&self, client_id: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join(client_id).join("frpc");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn client_dir(&self, client_id: &str) -> PathBuf {
        self.dir.path().join(client_id)
    }
}

/// A client that runs until SIGTERM and records each start in `starts.log`.
pub const WELL_BEHAVED: &str = "#!/bin/sh\n\
trap 'echo stopping; exit 0' TERM\n\
echo $$ >> starts.log\n\
echo \"started with $1 $2\"\n\
while true; do sleep 0.05; done\n";

/// A client that ignores SIGTERM.
pub const STUBBORN: &str = "#!/bin/sh\n\
trap '' TERM\n\
echo $$ >> starts.log\n\
while true; do sleep 0.05; done\n";

/// A client that exits on its own with code 3.
pub const CRASHING: &str = "#!/bin/sh\n\
echo boom >&2\n\
exit 3\n";

pub fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// One request seen by the mock admin endpoint.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
}

pub type RequestLog = Arc<Mutex<Vec<RecordedRequest>>>;

/// Start a programmable mock admin endpoint on an ephemeral loopback port.
///
/// `f` maps the request path to a status code and body.
pub async fn start_admin_endpoint<F, Fut>(f: F) -> (SocketAddr, RequestLog)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);

    let requests = log.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let f = f.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let (reader, mut writer) = socket.into_split();
                        let mut lines = BufReader::new(reader).lines();

                        let Ok(Some(request_line)) = lines.next_line().await else {
                            return;
                        };
                        let mut parts = request_line.split_whitespace();
                        let method = parts.next().unwrap_or_default().to_string();
                        let path = parts.next().unwrap_or_default().to_string();

                        let mut authorization = None;
                        while let Ok(Some(line)) = lines.next_line().await {
                            if line.is_empty() {
                                break;
                            }
                            if let Some((name, value)) = line.split_once(':') {
                                if name.eq_ignore_ascii_case("authorization") {
                                    authorization = Some(value.trim().to_string());
                                }
                            }
                        }
                        requests.lock().unwrap().push(RecordedRequest {
                            method,
                            path: path.clone(),
                            authorization,
                        });

                        let (status, body) = f(path).await;
                        let status_text = match status {
                            200 => "200 OK",
                            401 => "401 Unauthorized",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            _ => "200 OK",
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = writer.write_all(response.as_bytes()).await;
                        let _ = writer.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    (addr, log)
}

/// Document text whose admin endpoint points at `addr`.
pub fn document_with_admin(addr: SocketAddr) -> String {
    format!(
        "serverAddr = \"relay.example.com\"\nserverPort = 7000\n\n[webServer]\naddr = \"127.0.0.1\"\nport = {}\nuser = \"admin\"\npassword = \"secret\"\n",
        addr.port()
    )
}
