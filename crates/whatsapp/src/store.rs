//! Durable credential stores.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    anyhow::{Context, bail},
    async_trait::async_trait,
    tracing::debug,
    wagate_channels::{CredentialStore, Credentials, MemoryCredentialStore},
    wagate_config::{CredentialBackend, CredentialsConfig},
};

const CREDS_FILE: &str = "creds.json";

/// Build the store selected in config. Relative paths resolve under `data_dir`.
pub fn open_store(
    cfg: &CredentialsConfig,
    data_dir: &Path,
) -> anyhow::Result<Arc<dyn CredentialStore>> {
    let resolve = |default: &str| match &cfg.dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => data_dir.join(dir),
        None => data_dir.join(default),
    };

    let store: Arc<dyn CredentialStore> = match cfg.backend {
        CredentialBackend::Memory => Arc::new(MemoryCredentialStore::new()),
        CredentialBackend::File => Arc::new(FileCredentialStore::new(resolve("sessions"))),
        CredentialBackend::Sled => Arc::new(SledCredentialStore::open(&resolve("credentials.db"))?),
    };
    debug!(backend = ?cfg.backend, "credential store ready");
    Ok(store)
}

/// Ids become directory names, so anything that could escape the root is refused.
fn check_session_id(session_id: &str) -> anyhow::Result<()> {
    if session_id.is_empty()
        || session_id == "."
        || session_id == ".."
        || session_id
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
    {
        bail!("session id {session_id:?} cannot be used as a directory name");
    }
    Ok(())
}

// ── File ─────────────────────────────────────────────────────────────────────

/// One directory per session holding a `creds.json` snapshot.
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &str) -> anyhow::Result<PathBuf> {
        check_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, session_id: &str) -> anyhow::Result<Option<Credentials>> {
        let path = self.session_dir(session_id)?.join(CREDS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let creds = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt credentials at {}", path.display()))?;
                Ok(Some(creds))
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> anyhow::Result<()> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let tmp = dir.join(format!("{CREDS_FILE}.tmp"));
        let path = dir.join(CREDS_FILE);
        tokio::fs::write(&tmp, serde_json::to_vec(credentials)?).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> anyhow::Result<()> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", dir.display())),
        }
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !tokio::fs::try_exists(entry.path().join(CREDS_FILE)).await? {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ── Sled ─────────────────────────────────────────────────────────────────────

/// Embedded key-value store; one key per session.
pub struct SledCredentialStore {
    db: sled::Db,
}

impl SledCredentialStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("failed to open credential db at {}", path.display()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl CredentialStore for SledCredentialStore {
    async fn load(&self, session_id: &str) -> anyhow::Result<Option<Credentials>> {
        self.db
            .get(session_id)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .with_context(|| format!("corrupt credentials for session {session_id}"))
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> anyhow::Result<()> {
        self.db.insert(session_id, serde_json::to_vec(credentials)?)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> anyhow::Result<()> {
        self.db.remove(session_id)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        self.db
            .iter()
            .keys()
            .map(|key| -> anyhow::Result<String> { Ok(String::from_utf8_lossy(&key?).into_owned()) })
            .collect()
    }
}
