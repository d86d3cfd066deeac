//! Bearer-token handling.
//!
//! The token is opaque to the rest of the client. It is provisioned once,
//! cached in a [`CredentialStore`], reused across transport reconnects and
//! cleared on logout. Provisioning is a pluggable strategy: issued by the
//! identity endpoint ([`RemoteIssuer`]) or generated on this device
//! ([`LocalGenerator`]).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{IdentityConfig, IdentityMode};
use crate::error::{CredentialError, CredentialResult};

// ─── Stores ──────────────────────────────────────────────────────────────────

/// Where the token lives between uses.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<String>;
    fn set(&self, token: &str) -> CredentialResult<()>;
    fn clear(&self) -> CredentialResult<()>;
}

/// Process-local store; the token is lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    token: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    fn set(&self, token: &str) -> CredentialResult<()> {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token.to_owned());
        }
        Ok(())
    }

    fn clear(&self) -> CredentialResult<()> {
        if let Ok(mut slot) = self.token.lock() {
            *slot = None;
        }
        Ok(())
    }
}

/// Store backed by a single file holding the raw token.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<Option<String>>,
}

impl FileStore {
    /// Open the store, reading any token already on disk.
    pub fn open(path: impl Into<PathBuf>) -> CredentialResult<Self> {
        let path = path.into();
        let existing = match std::fs::read_to_string(&path) {
            Ok(s) => Some(s.trim().to_owned()).filter(|s| !s.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, cache: Mutex::new(existing) })
    }
}

impl CredentialStore for FileStore {
    fn get(&self) -> Option<String> {
        self.cache.lock().ok().and_then(|t| t.clone())
    }

    fn set(&self, token: &str) -> CredentialResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, token)?;
        if let Ok(mut slot) = self.cache.lock() {
            *slot = Some(token.to_owned());
        }
        Ok(())
    }

    fn clear(&self) -> CredentialResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Ok(mut slot) = self.cache.lock() {
            *slot = None;
        }
        Ok(())
    }
}

// ─── Provisioning strategies ─────────────────────────────────────────────────

/// Produces a fresh token.
#[async_trait]
pub trait TokenProvisioner: Send + Sync {
    async fn issue(&self) -> CredentialResult<String>;

    /// Called once per process when a cached token is reused.
    async fn touch(&self, _token: &str) {}
}

/// Generates a random device token locally. No network involved.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalGenerator;

#[async_trait]
impl TokenProvisioner for LocalGenerator {
    async fn issue(&self) -> CredentialResult<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Deserialize)]
struct DeviceUuid {
    uuid: Option<String>,
}

/// Asks the identity endpoint for a device token.
#[derive(Debug, Clone)]
pub struct RemoteIssuer {
    http: reqwest::Client,
    base_url: String,
}

impl RemoteIssuer {
    pub fn new(base_url: impl Into<String>) -> CredentialResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("Duet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base_url: base_url.into().trim_end_matches('/').to_owned() })
    }
}

#[async_trait]
impl TokenProvisioner for RemoteIssuer {
    async fn issue(&self) -> CredentialResult<String> {
        let url = format!("{}/api/auth/get-device-uuid/", self.base_url);
        let resp = self.http.post(&url).json(&json!({})).send().await?;
        if !resp.status().is_success() {
            return Err(CredentialError::Status { status: resp.status().as_u16() });
        }
        let body: DeviceUuid = resp.json().await?;
        body.uuid.filter(|u| !u.is_empty()).ok_or(CredentialError::MissingToken)
    }

    async fn touch(&self, token: &str) {
        let url = format!("{}/api/auth/update-activity/", self.base_url);
        match self.http.post(&url).json(&json!({ "uuid": token })).send().await {
            Ok(resp) if resp.status().is_success() => debug!("Device activity updated"),
            Ok(resp) => warn!(status = resp.status().as_u16(), "Device activity update rejected"),
            Err(e) => warn!(error = %e, "Failed to update device activity"),
        }
    }
}

// ─── Credentials ─────────────────────────────────────────────────────────────

/// A token store paired with the strategy that fills it.
#[derive(Clone)]
pub struct Credentials {
    store: Arc<dyn CredentialStore>,
    provisioner: Arc<dyn TokenProvisioner>,
    touched: Arc<AtomicBool>,
}

impl Credentials {
    pub fn new(store: Arc<dyn CredentialStore>, provisioner: Arc<dyn TokenProvisioner>) -> Self {
        Self { store, provisioner, touched: Arc::new(AtomicBool::new(false)) }
    }

    /// Build from the `identity` config section.
    pub fn from_config(cfg: &IdentityConfig) -> CredentialResult<Self> {
        let store: Arc<dyn CredentialStore> = match &cfg.token_path {
            Some(path) => Arc::new(FileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let provisioner: Arc<dyn TokenProvisioner> = match cfg.mode {
            IdentityMode::Remote => Arc::new(RemoteIssuer::new(&cfg.url)?),
            IdentityMode::Local => Arc::new(LocalGenerator),
        };
        Ok(Self::new(store, provisioner))
    }

    /// The cached token, if any.
    pub fn get(&self) -> Option<String> {
        self.store.get()
    }

    /// Return the cached token, provisioning one first if the store is empty.
    pub async fn ensure(&self) -> CredentialResult<String> {
        if let Some(token) = self.store.get() {
            if !self.touched.swap(true, Ordering::SeqCst) {
                self.provisioner.touch(&token).await;
            }
            return Ok(token);
        }

        let token = self.provisioner.issue().await?;
        self.store.set(&token)?;
        self.touched.store(true, Ordering::SeqCst);
        info!("Provisioned new device token");
        Ok(token)
    }

    /// Replace the cached token with a freshly provisioned one.
    ///
    /// On failure the previous token stays in place.
    pub async fn refresh(&self) -> CredentialResult<String> {
        let token = self.provisioner.issue().await?;
        self.store.set(&token)?;
        info!("Device token refreshed");
        Ok(token)
    }

    /// Forget the token (logout).
    pub fn clear(&self) -> CredentialResult<()> {
        self.touched.store(false, Ordering::SeqCst);
        self.store.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        issued: AtomicUsize,
        touched: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TokenProvisioner for Counting {
        async fn issue(&self) -> CredentialResult<String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CredentialError::MissingToken);
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{n}"))
        }

        async fn touch(&self, _token: &str) {
            self.touched.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("duet-{name}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_ensure_provisions_once_and_caches() {
        let prov = Arc::new(Counting::default());
        let creds = Credentials::new(Arc::new(MemoryStore::new()), prov.clone());

        assert_eq!(creds.ensure().await.unwrap(), "token-0");
        assert_eq!(creds.ensure().await.unwrap(), "token-0");
        assert_eq!(prov.issued.load(Ordering::SeqCst), 1);
        // A token we just issued is never "touched".
        assert_eq!(prov.touched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reused_token_is_touched_once() {
        let store = Arc::new(MemoryStore::new());
        store.set("existing").unwrap();
        let prov = Arc::new(Counting::default());
        let creds = Credentials::new(store, prov.clone());

        assert_eq!(creds.ensure().await.unwrap(), "existing");
        assert_eq!(creds.ensure().await.unwrap(), "existing");
        assert_eq!(prov.touched.load(Ordering::SeqCst), 1);
        assert_eq!(prov.issued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_forces_new_token() {
        let prov = Arc::new(Counting::default());
        let creds = Credentials::new(Arc::new(MemoryStore::new()), prov.clone());
        creds.ensure().await.unwrap();
        creds.clear().unwrap();
        assert!(creds.get().is_none());
        assert_eq!(creds.ensure().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_token() {
        let prov = Arc::new(Counting::default());
        let creds = Credentials::new(Arc::new(MemoryStore::new()), prov.clone());
        creds.ensure().await.unwrap();

        prov.fail.store(true, Ordering::SeqCst);
        assert!(creds.refresh().await.is_err());
        assert_eq!(creds.get().as_deref(), Some("token-0"));
    }

    #[tokio::test]
    async fn test_local_generator_issues_uuids() {
        let a = LocalGenerator.issue().await.unwrap();
        let b = LocalGenerator.issue().await.unwrap();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let path = temp_path("store");
        {
            let store = FileStore::open(&path).unwrap();
            assert!(store.get().is_none());
            store.set("persisted").unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get().as_deref(), Some("persisted"));
        store.clear().unwrap();
        assert!(!path.exists());
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[tokio::test]
    async fn test_remote_issuer_against_local_server() {
        use axum::{Json, Router, routing::post};

        let app = Router::new()
            .route(
                "/api/auth/get-device-uuid/",
                post(|| async { Json(json!({ "uuid": "remote-uuid" })) }),
            )
            .route("/api/auth/update-activity/", post(|| async { Json(json!({})) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let issuer = RemoteIssuer::new(format!("http://{addr}/")).unwrap();
        assert_eq!(issuer.issue().await.unwrap(), "remote-uuid");
        issuer.touch("remote-uuid").await;
    }

    #[tokio::test]
    async fn test_remote_issuer_maps_error_status() {
        use axum::{Router, http::StatusCode, routing::post};

        let app = Router::new().route(
            "/api/auth/get-device-uuid/",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let issuer = RemoteIssuer::new(format!("http://{addr}")).unwrap();
        match issuer.issue().await {
            Err(CredentialError::Status { status }) => assert_eq!(status, 503),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
