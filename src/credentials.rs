// =============================================================================
// Credential Store — scoped secret retrieval
// =============================================================================
//
// Secrets are addressed by dotted scope keys ("tradovate.api_key",
// "webhook.secret"). Resolution order:
//
//   1. Environment override: TT_CRED_<SCOPE> with dots mapped to underscores
//      and upper-cased (TT_CRED_TRADOVATE_API_KEY).
//   2. JSON credentials file named by TT_CREDENTIALS_FILE (flat string map).
//
// Secret values never appear in logs or serialized payloads. The file is
// checked for group/world readability on unix and a warning is emitted once
// per load if the mode is too permissive.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

/// Environment variable naming the credentials file.
pub const CREDENTIALS_FILE_ENV: &str = "TT_CREDENTIALS_FILE";
/// Prefix for per-scope environment overrides.
const ENV_OVERRIDE_PREFIX: &str = "TT_CRED_";

/// Scoped secret store. File contents are loaded once and refreshed on
/// explicit `reload`; env overrides are consulted on every lookup so that
/// rotation does not require a restart.
pub struct CredentialStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, String>>,
}

impl CredentialStore {
    /// Build the store from the process environment. A missing credentials
    /// file is not an error: broker feeds without credentials simply report
    /// unhealthy, and the webhook endpoint runs in development mode.
    pub fn from_env() -> Self {
        let path = std::env::var(CREDENTIALS_FILE_ENV).ok().map(PathBuf::from);

        let store = Self {
            path,
            entries: RwLock::new(HashMap::new()),
        };

        if let Err(e) = store.reload() {
            warn!(error = %e, "credentials file not loaded — env overrides only");
        }
        store
    }

    /// Construct an empty store with an explicit file path (used by tests).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: Some(path.into()),
            entries: RwLock::new(HashMap::new()),
        };
        if let Err(e) = store.reload() {
            warn!(error = %e, "credentials file not loaded");
        }
        store
    }

    /// Re-read the credentials file, replacing the in-memory map wholesale.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials from {}", path.display()))?;

        check_permissions(path);

        let parsed: HashMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse credentials from {}", path.display()))?;

        let count = parsed.len();
        *self.entries.write() = parsed;
        info!(path = %path.display(), scopes = count, "credentials loaded");
        Ok(())
    }

    /// Resolve a secret by scope key. Env override wins over the file.
    pub fn get(&self, scope: &str) -> Option<String> {
        if let Ok(v) = std::env::var(env_override_name(scope)) {
            if !v.is_empty() {
                return Some(v);
            }
        }
        self.entries.read().get(scope).cloned()
    }

    /// True when a secret exists for the scope, without exposing its value.
    pub fn has(&self, scope: &str) -> bool {
        self.get(scope).is_some()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("scopes", &self.entries.read().len())
            .finish()
    }
}

fn env_override_name(scope: &str) -> String {
    format!(
        "{}{}",
        ENV_OVERRIDE_PREFIX,
        scope.replace('.', "_").to_uppercase()
    )
}

#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{:o}", mode & 0o777),
                "credentials file is group/world readable — chmod 600 recommended"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_lookup_and_miss() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"tradovate.api_key": "k-123", "webhook.secret": "s-456"}}"#
        )
        .unwrap();

        let store = CredentialStore::with_path(f.path());
        assert_eq!(store.get("tradovate.api_key").as_deref(), Some("k-123"));
        assert_eq!(store.get("webhook.secret").as_deref(), Some("s-456"));
        assert!(store.get("schwab.api_key").is_none());
        assert!(store.has("webhook.secret"));
    }

    #[test]
    fn env_override_wins() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"topstepx.token": "from-file"}}"#).unwrap();

        std::env::set_var("TT_CRED_TOPSTEPX_TOKEN", "from-env");
        let store = CredentialStore::with_path(f.path());
        assert_eq!(store.get("topstepx.token").as_deref(), Some("from-env"));
        std::env::remove_var("TT_CRED_TOPSTEPX_TOKEN");
    }

    #[test]
    fn override_name_mapping() {
        assert_eq!(
            env_override_name("tastytrade.client_secret"),
            "TT_CRED_TASTYTRADE_CLIENT_SECRET"
        );
    }

    #[test]
    fn missing_file_is_not_fatal() {
        let store = CredentialStore::with_path("/nonexistent/creds.json");
        assert!(store.get("anything").is_none());
    }
}
