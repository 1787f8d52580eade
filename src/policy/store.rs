use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwap;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Envelope, Result, RoutingPolicy, ValidationError, internal::ticker};

/// Holds the active [`RoutingPolicy`] and swaps it atomically on reload.
///
/// Readers never block: validation works on a snapshot of the policy taken
/// at the start of the check. A reload that fails to read or parse keeps the
/// last-known-good policy in effect.
#[derive(Debug)]
pub struct PolicyStore {
    current: ArcSwap<RoutingPolicy>,
}

impl PolicyStore {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
        }
    }

    /// Snapshot of the active policy.
    pub fn current(&self) -> Arc<RoutingPolicy> {
        self.current.load_full()
    }

    pub fn validate(&self, envelope: &Envelope) -> std::result::Result<(), ValidationError> {
        self.current.load().validate(envelope)
    }

    /// Install a new policy unconditionally.
    pub fn replace(&self, policy: RoutingPolicy) {
        self.current.store(Arc::new(policy));
        info!("routing policy replaced");
    }

    /// Parse `json` and install it, or keep the previous policy on error.
    pub fn reload_from_str(&self, json: &str) -> Result<()> {
        match RoutingPolicy::from_json(json) {
            Ok(policy) => {
                self.current.store(Arc::new(policy));
                info!("routing policy reloaded");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "routing policy reload failed, keeping previous policy");
                Err(e)
            }
        }
    }

    /// Read a policy document from `path` and install it, or keep the
    /// previous policy on error.
    pub async fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "couldn't read routing policy, keeping previous policy");
                return Err(e.into());
            }
        };
        self.reload_from_str(&json)
    }

    /// Poll `path` every `interval` and reload whenever its modification time
    /// changes. Runs until `cancel` fires.
    ///
    /// The file is loaded once on start.
    pub async fn watch(self: Arc<Self>, path: PathBuf, interval: Duration, cancel: CancellationToken) {
        let mut last_modified = None;
        let mut ticker = ticker(interval);

        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let modified = modified_at(&path).await;
                    if modified.is_some() && modified != last_modified {
                        last_modified = modified;
                        // Failures are logged by the reload itself
                        let _ = self.reload_from_path(&path).await;
                    }
                }
            }
        }
        debug!(path = %path.display(), "policy watcher stopped");
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const POLICY: &str = r#"{ "domains": { "risk": { "types": ["RISK_CHECK"] } } }"#;

    fn risk_check() -> Envelope {
        Envelope::new("RISK_CHECK", "risk", "workbench")
    }

    #[test]
    fn test_reload_swaps_policy() {
        let store = PolicyStore::new(RoutingPolicy::new());
        assert!(store.validate(&risk_check()).is_err());

        store.reload_from_str(POLICY).unwrap();
        assert_eq!(store.validate(&risk_check()), Ok(()));
    }

    #[test]
    fn test_failed_reload_keeps_previous_policy() {
        let store = PolicyStore::new(RoutingPolicy::from_json(POLICY).unwrap());
        let before = store.current();

        let result = store.reload_from_str(r#"{ "domains": { "risk": "#);

        assert!(matches!(result, Err(Error::InvalidPolicy(_))));
        assert_eq!(*store.current(), *before);
        assert_eq!(store.validate(&risk_check()), Ok(()));
    }

    #[tokio::test]
    async fn test_reload_from_missing_file_keeps_previous_policy() {
        let store = PolicyStore::new(RoutingPolicy::from_json(POLICY).unwrap());
        let result = store
            .reload_from_path("/nonexistent/switchboard/policy.json")
            .await;
        assert!(matches!(result, Err(Error::IOError(_))));
        assert_eq!(store.validate(&risk_check()), Ok(()));
    }

    #[tokio::test]
    async fn test_watch_loads_file() {
        watch_loads_file(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_watch_with_zero_interval() {
        watch_loads_file(Duration::ZERO).await;
    }

    async fn watch_loads_file(interval: Duration) {
        let path = std::env::temp_dir().join(format!("switchboard-policy-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, POLICY).unwrap();

        let store = Arc::new(PolicyStore::new(RoutingPolicy::new()));
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(store.clone().watch(path.clone(), interval, cancel.clone()));

        for _ in 0..100 {
            if store.validate(&risk_check()).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.validate(&risk_check()), Ok(()));

        cancel.cancel();
        watcher.await.unwrap();
        let _ = std::fs::remove_file(path);
    }
}
