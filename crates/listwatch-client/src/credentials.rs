//! Credential pool shared by every request of a run.
//!
//! The pool is loaded from a JSON file, filtered by expiry with a safety
//! margin, and refilled through a [`CredentialIssuer`] when empty. Minting is
//! serialized: concurrent callers that find the pool empty (or a credential
//! rejected) wait on one refresh and reuse its result.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listwatch_core::config::CredentialConfig;
use listwatch_core::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

/// An upstream credential. Immutable once issued.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    /// Opaque session data returned alongside the token (cookies, device ids).
    #[serde(default)]
    pub session: Value,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, session: Value, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            session,
            issued_at: Utc::now(),
            expires_at,
        }
    }

    /// Short SHA-256 fingerprint used to identify the credential in logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
    }

    /// True when the credential stays valid beyond `now + margin`.
    pub fn is_usable(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at > now + margin
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    credentials: Vec<Credential>,
}

/// Reads a credential file. A missing file is an empty pool.
pub async fn read_credential_file(path: &Path) -> Result<Vec<Credential>, AppError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(file_error(path, e)),
    };
    let file: CredentialFile = serde_json::from_str(&raw)?;
    Ok(file.credentials)
}

/// Rewrites the credential file atomically through a uniquely named temp
/// file in the same directory. Callers serialize writes through the pool lock.
async fn write_credential_file(path: &Path, credentials: &[Credential]) -> Result<(), AppError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| file_error(&parent, e))?;

    let body = serde_json::to_vec_pretty(&CredentialFile {
        credentials: credentials.to_vec(),
    })?;
    let target = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| file_error(&parent, e))?;
        if let Err(e) = tmp.write_all(&body) {
            return Err(file_error(tmp.path(), e));
        }
        if let Err(e) = tmp.as_file().sync_all() {
            return Err(file_error(tmp.path(), e));
        }
        tmp.persist(&target)
            .map(|_| ())
            .map_err(|e| file_error(&target, e.error))
    })
    .await
    .map_err(|e| AppError::ConfigError(format!("credential file writer panicked: {}", e)))?
}

fn file_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::ConfigError(format!("credential file {}: {}", path.display(), e))
}

/// Mints a new credential when the pool runs dry.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self) -> Result<Credential, AppError>;
}

#[derive(Debug, Deserialize)]
struct IssuedCredential {
    token: String,
    #[serde(default)]
    session: Value,
    expires_at: Option<DateTime<Utc>>,
    expires_in: Option<i64>,
}

/// Parses the JSON printed by an acquisition command:
/// `{"token": "...", "session": {...}, "expires_at": "<RFC 3339>"}` or
/// `{"token": "...", "expires_in": <seconds>}`.
pub fn parse_issued_credential(stdout: &str, now: DateTime<Utc>) -> Result<Credential, AppError> {
    let issued: IssuedCredential = serde_json::from_str(stdout.trim()).map_err(|e| {
        AppError::CredentialUnavailable(format!("acquisition output is not valid JSON: {}", e))
    })?;

    if issued.token.trim().is_empty() {
        return Err(AppError::CredentialUnavailable(
            "acquisition output carries an empty token".to_string(),
        ));
    }

    let expires_at = match (issued.expires_at, issued.expires_in) {
        (Some(at), _) => at,
        (None, Some(secs)) => now + chrono::Duration::seconds(secs),
        (None, None) => {
            return Err(AppError::CredentialUnavailable(
                "acquisition output has neither expires_at nor expires_in".to_string(),
            ))
        }
    };

    Ok(Credential {
        token: issued.token,
        session: issued.session,
        issued_at: now,
        expires_at,
    })
}

/// Runs an operator-configured command (typically a browser login script)
/// and reads the credential from its stdout.
#[derive(Debug, Clone)]
pub struct CommandIssuer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandIssuer {
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, AppError> {
        let (program, args) = command.split_first().ok_or_else(|| {
            AppError::ConfigError("credentials.acquire_command is empty".to_string())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl CredentialIssuer for CommandIssuer {
    async fn issue(&self) -> Result<Credential, AppError> {
        tracing::info!(program = self.program.as_str(), "Running credential acquisition command");

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            AppError::CredentialUnavailable(format!(
                "acquisition command timed out after {}s",
                self.timeout.as_secs()
            ))
        })?
        .map_err(|e| {
            AppError::CredentialUnavailable(format!("cannot run {}: {}", self.program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::CredentialUnavailable(format!(
                "acquisition command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_issued_credential(&String::from_utf8_lossy(&output.stdout), Utc::now())
    }
}

/// Shared credential pool.
///
/// Inject one instance per process through an `Arc`; every fetcher and
/// every region run shares it.
pub struct CredentialStore {
    path: Option<PathBuf>,
    safety_margin: chrono::Duration,
    pool: Mutex<Vec<Credential>>,
    refresh_lock: Mutex<()>,
    issuer: Option<Arc<dyn CredentialIssuer>>,
}

impl CredentialStore {
    /// A pool that is never written to disk.
    pub fn in_memory(safety_margin: chrono::Duration) -> Self {
        Self {
            path: None,
            safety_margin,
            pool: Mutex::new(Vec::new()),
            refresh_lock: Mutex::new(()),
            issuer: None,
        }
    }

    /// Loads the pool from `path`, creating it on the first write.
    pub async fn open(path: PathBuf, safety_margin: chrono::Duration) -> Result<Self, AppError> {
        let credentials = read_credential_file(&path).await?;
        let now = Utc::now();
        let usable = credentials
            .iter()
            .filter(|c| c.is_usable(now, safety_margin))
            .count();
        tracing::info!(
            path = %path.display(),
            total = credentials.len(),
            usable,
            "Loaded credential pool"
        );

        Ok(Self {
            path: Some(path),
            safety_margin,
            pool: Mutex::new(credentials),
            refresh_lock: Mutex::new(()),
            issuer: None,
        })
    }

    /// Builds the store described by the `[credentials]` section, including
    /// the acquisition command when one is configured.
    pub async fn from_config(config: &CredentialConfig) -> Result<Self, AppError> {
        let margin = chrono::Duration::seconds(config.safety_margin_secs);
        let store = match config.file_path() {
            Some(path) => Self::open(path, margin).await?,
            None => Self::in_memory(margin),
        };

        match &config.acquire_command {
            Some(command) => {
                let issuer = CommandIssuer::new(
                    command,
                    Duration::from_secs(config.acquire_timeout_secs),
                )?;
                Ok(store.with_issuer(Arc::new(issuer)))
            }
            None => Ok(store),
        }
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn CredentialIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the usable credential that expires last, minting one when
    /// the pool holds none.
    ///
    /// # Errors
    ///
    /// `AppError::CredentialUnavailable` when the pool is empty and no
    /// issuer is configured or the issuer fails.
    pub async fn acquire(&self) -> Result<Credential, AppError> {
        if let Some(credential) = self.pick().await {
            return Ok(credential);
        }

        let _refresh = self.refresh_lock.lock().await;
        // Another caller may have minted while we waited.
        if let Some(credential) = self.pick().await {
            return Ok(credential);
        }
        self.mint().await
    }

    /// Drops a rejected credential and returns a replacement.
    ///
    /// Concurrent callers holding the same stale credential share a single
    /// refresh: the first one mints, the others pick the new credential up.
    pub async fn refresh_after(&self, stale: &Credential) -> Result<Credential, AppError> {
        self.invalidate(stale).await;

        let _refresh = self.refresh_lock.lock().await;
        if let Some(credential) = self.pick().await {
            tracing::debug!(
                stale = stale.fingerprint().as_str(),
                fresh = credential.fingerprint().as_str(),
                "Reusing credential from pool"
            );
            return Ok(credential);
        }
        self.mint().await
    }

    /// Removes a credential from the pool. Returns false when it was already gone.
    pub async fn invalidate(&self, credential: &Credential) -> bool {
        let mut pool = self.pool.lock().await;
        let before = pool.len();
        pool.retain(|c| c.token != credential.token);
        if pool.len() == before {
            return false;
        }

        tracing::info!(
            credential = credential.fingerprint().as_str(),
            "Credential invalidated"
        );
        if let Err(e) = self.persist(&pool).await {
            tracing::warn!(error = %e, "Failed to persist credential pool after invalidation");
        }
        true
    }

    /// Adds a credential supplied by an operator and persists the pool.
    pub async fn add(&self, credential: Credential) -> Result<(), AppError> {
        let mut pool = self.pool.lock().await;
        pool.retain(|c| c.token != credential.token);
        pool.push(credential);
        self.persist(&pool).await
    }

    /// Drops credentials that are expired or inside the safety margin.
    pub async fn prune(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let mut pool = self.pool.lock().await;
        let before = pool.len();
        pool.retain(|c| c.is_usable(now, self.safety_margin));
        let removed = before - pool.len();
        if removed > 0 {
            self.persist(&pool).await?;
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Vec<Credential> {
        self.pool.lock().await.clone()
    }

    pub async fn usable_count(&self) -> usize {
        let now = Utc::now();
        self.pool
            .lock()
            .await
            .iter()
            .filter(|c| c.is_usable(now, self.safety_margin))
            .count()
    }

    async fn pick(&self) -> Option<Credential> {
        let now = Utc::now();
        self.pool
            .lock()
            .await
            .iter()
            .filter(|c| c.is_usable(now, self.safety_margin))
            .max_by_key(|c| c.expires_at)
            .cloned()
    }

    /// Caller must hold `refresh_lock`.
    async fn mint(&self) -> Result<Credential, AppError> {
        let issuer = self.issuer.as_ref().ok_or_else(|| {
            AppError::CredentialUnavailable(
                "credential pool is empty and no acquisition command is configured".to_string(),
            )
        })?;

        let credential = issuer.issue().await?;
        if !credential.is_usable(Utc::now(), self.safety_margin) {
            return Err(AppError::CredentialUnavailable(format!(
                "issued credential {} expires at {}, inside the safety margin",
                credential.fingerprint(),
                credential.expires_at
            )));
        }

        {
            let mut pool = self.pool.lock().await;
            pool.push(credential.clone());
            self.persist(&pool).await?;
        }

        tracing::info!(
            credential = credential.fingerprint().as_str(),
            expires_at = %credential.expires_at,
            "Minted new credential"
        );
        Ok(credential)
    }

    /// Writes `credentials` to the pool file. Call with the pool lock held so
    /// the file always reflects the latest in-memory state.
    async fn persist(&self, credentials: &[Credential]) -> Result<(), AppError> {
        match &self.path {
            Some(path) => write_credential_file(path, credentials).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn margin() -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn credential(token: &str, expires_in_minutes: i64) -> Credential {
        Credential::new(
            token,
            Value::Null,
            Utc::now() + chrono::Duration::minutes(expires_in_minutes),
        )
    }

    /// Issues `minted-N` tokens, slowly enough for callers to pile up.
    #[derive(Default)]
    struct CountingIssuer {
        minted: AtomicUsize,
    }

    #[async_trait]
    impl CredentialIssuer for CountingIssuer {
        async fn issue(&self) -> Result<Credential, AppError> {
            let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(credential(&format!("minted-{}", n), 60))
        }
    }

    #[tokio::test]
    async fn test_acquire_skips_credentials_inside_margin() {
        let store = CredentialStore::in_memory(margin());
        store.add(credential("soon", 3)).await.unwrap();
        store.add(credential("later", 30)).await.unwrap();
        store.add(credential("latest", 90)).await.unwrap();

        let picked = store.acquire().await.unwrap();
        assert_eq!(picked.token, "latest");
        assert_eq!(store.usable_count().await, 2);
    }

    #[tokio::test]
    async fn test_empty_pool_without_issuer_fails() {
        let store = CredentialStore::in_memory(margin());
        store.add(credential("expired", -10)).await.unwrap();

        let err = store.acquire().await.unwrap_err();
        assert!(matches!(err, AppError::CredentialUnavailable(_)));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_mints_once() {
        let issuer = Arc::new(CountingIssuer::default());
        let store = Arc::new(CredentialStore::in_memory(margin()).with_issuer(issuer.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.acquire().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().token, "minted-1");
        }
        assert_eq!(issuer.minted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_after_shares_one_mint() {
        let issuer = Arc::new(CountingIssuer::default());
        let store = Arc::new(CredentialStore::in_memory(margin()).with_issuer(issuer.clone()));
        let stale = credential("stale", 60);
        store.add(stale.clone()).await.unwrap();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let store = store.clone();
                let stale = stale.clone();
                tokio::spawn(async move { store.refresh_after(&stale).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().token, "minted-1");
        }
        assert_eq!(issuer.minted.load(Ordering::SeqCst), 1);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_minted_credential_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");
        let store = CredentialStore::open(path.clone(), margin())
            .await
            .unwrap()
            .with_issuer(Arc::new(CountingIssuer::default()));

        let minted = store.acquire().await.unwrap();

        let on_disk = read_credential_file(&path).await.unwrap();
        assert_eq!(on_disk, vec![minted]);
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("credentials.json")]);
    }

    #[tokio::test]
    async fn test_invalidate_and_prune_rewrite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = CredentialStore::open(path.clone(), margin()).await.unwrap();

        let keep = credential("keep", 60);
        let drop = credential("drop", 60);
        store.add(keep.clone()).await.unwrap();
        store.add(drop.clone()).await.unwrap();
        store.add(credential("old", -1)).await.unwrap();

        assert!(store.invalidate(&drop).await);
        assert!(!store.invalidate(&drop).await);
        assert_eq!(store.prune().await.unwrap(), 1);

        let reopened = CredentialStore::open(path, margin()).await.unwrap();
        assert_eq!(reopened.list().await, vec![keep]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_keep_file_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let issuer = Arc::new(CountingIssuer::default());
        let store = Arc::new(
            CredentialStore::open(path.clone(), margin())
                .await
                .unwrap()
                .with_issuer(issuer),
        );

        for round in 0..10 {
            let seeded: Vec<Credential> = (0..8)
                .map(|i| credential(&format!("r{}-old-{}", round, i), 60))
                .collect();
            for c in &seeded {
                store.add(c.clone()).await.unwrap();
            }

            let mut handles = Vec::new();
            for (i, stale) in seeded.into_iter().enumerate() {
                let task_store = store.clone();
                handles.push(tokio::spawn(async move {
                    if i == 0 {
                        task_store.refresh_after(&stale).await.map(|_| ())
                    } else {
                        task_store.invalidate(&stale).await;
                        Ok(())
                    }
                }));
                let add_store = store.clone();
                let fresh = credential(&format!("r{}-new-{}", round, i), 60);
                handles.push(tokio::spawn(async move { add_store.add(fresh).await }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let on_disk = read_credential_file(&path).await.unwrap();
            assert_eq!(on_disk, store.list().await, "round {}", round);
        }

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_parse_issued_credential_variants() {
        let now = Utc::now();

        let relative = parse_issued_credential(r#"{"token": "abc", "expires_in": 3600}"#, now)
            .unwrap();
        assert_eq!(relative.expires_at, now + chrono::Duration::seconds(3600));
        assert_eq!(relative.session, Value::Null);

        let absolute = parse_issued_credential(
            r#"{"token": "abc", "session": {"cookie": "x"}, "expires_at": "2030-01-01T00:00:00Z"}"#,
            now,
        )
        .unwrap();
        assert_eq!(absolute.session, json!({"cookie": "x"}));
        assert_eq!(absolute.expires_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");

        assert!(parse_issued_credential(r#"{"token": "abc"}"#, now).is_err());
        assert!(parse_issued_credential(r#"{"token": " ", "expires_in": 1}"#, now).is_err());
        assert!(parse_issued_credential("login failed", now).is_err());
    }

    #[test]
    fn test_fingerprint_hides_token() {
        let c = credential("secret-token", 60);
        let fp = c.fingerprint();
        assert_eq!(fp.len(), 12);
        assert!(!format!("{:?}", c).contains("secret-token"));
    }

    #[test]
    fn test_command_issuer_requires_program() {
        assert!(CommandIssuer::new(&[], Duration::from_secs(1)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_issuer_reads_stdout() {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"echo '{"token": "from-cmd", "expires_in": 3600}'"#.to_string(),
        ];
        let issuer = CommandIssuer::new(&command, Duration::from_secs(10)).unwrap();

        let credential = issuer.issue().await.unwrap();
        assert_eq!(credential.token, "from-cmd");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_issuer_failure_is_credential_unavailable() {
        let command = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let issuer = CommandIssuer::new(&command, Duration::from_secs(10)).unwrap();

        let err = issuer.issue().await.unwrap_err();
        assert!(matches!(err, AppError::CredentialUnavailable(_)));
    }
}
