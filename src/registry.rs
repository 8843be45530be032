//! Explicit one-manager-per-database registry.
//!
//! The composition root owns a [`ManagerRegistry`] and hands out shared
//! handles keyed by canonicalized database path, preserving the
//! one-manager-per-file guarantee without hidden global state. Repeated
//! lookups for the same path return the same manager instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::manager::{ManagerConfig, MigrationManager};
use crate::migration::{MigrationError, MigrationScript};

#[derive(Default)]
pub struct ManagerRegistry {
    managers: Mutex<HashMap<PathBuf, Arc<MigrationManager>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the manager for `config.db_path`, constructing it on first
    /// use. `scripts` is only invoked when a new manager must be built.
    pub fn get_or_create(
        &self,
        config: ManagerConfig,
        scripts: impl FnOnce() -> Vec<Box<dyn MigrationScript>>,
    ) -> Result<Arc<MigrationManager>, MigrationError> {
        let mut managers = self.managers.lock();
        if let Some(existing) = lookup(&managers, &config.db_path) {
            return Ok(existing);
        }

        let manager = Arc::new(MigrationManager::new(config, scripts())?);
        // The manager has created the database file, so the path
        // canonicalizes now even for a fresh database.
        let key = manager.config().db_path.canonicalize()?;
        managers.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    /// Look up an existing manager without constructing one.
    pub fn get(&self, db_path: &Path) -> Option<Arc<MigrationManager>> {
        lookup(&self.managers.lock(), db_path)
    }

    pub fn len(&self) -> usize {
        self.managers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.lock().is_empty()
    }
}

fn lookup(
    managers: &HashMap<PathBuf, Arc<MigrationManager>>,
    db_path: &Path,
) -> Option<Arc<MigrationManager>> {
    let key = db_path.canonicalize().ok()?;
    managers.get(&key).cloned()
}
