//! Temporary workspace management.
//!
//! Every sort call owns one uniquely named directory holding its run files. Workspaces are registered in a
//! [`CleanupRegistry`] for as long as they live, so that a host can remove abandoned directories from its own
//! shutdown hook (signal handler, panic hook, etc.) by calling [`CleanupRegistry::teardown`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Name of the directory grouping all workspaces under the temporary directory root.
pub const WORKSPACE_NAMESPACE: &str = "large-sort";

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Registry of pending cleanup actions keyed by workspace id.
#[derive(Default)]
pub struct CleanupRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, CleanupFn>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        CleanupRegistry::default()
    }

    /// Process wide registry used by sorters unless another one is configured.
    pub fn process() -> Arc<CleanupRegistry> {
        static PROCESS_REGISTRY: OnceLock<Arc<CleanupRegistry>> = OnceLock::new();
        PROCESS_REGISTRY.get_or_init(|| Arc::new(CleanupRegistry::new())).clone()
    }

    /// Registers a cleanup action. Returns the id to deregister it with.
    pub fn register(&self, cleanup: impl FnOnce() + Send + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, Box::new(cleanup));
        id
    }

    /// Removes a cleanup action without running it.
    pub fn deregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs and removes every registered action.
    pub fn teardown(&self) {
        let entries: Vec<CleanupFn> = self.lock().drain().map(|(_, cleanup)| cleanup).collect();
        log::debug!("running {} pending cleanup action(s)", entries.len());
        for cleanup in entries {
            cleanup();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CleanupFn>> {
        // cleanup actions never panic while the lock is held, a poisoned map is still consistent
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupRegistry").field("pending", &self.len()).finish()
    }
}

/// Directory owning the run files of a single sort call.
/// The directory is deleted and deregistered when the workspace is closed or dropped.
pub struct TempWorkspace {
    dir: Option<tempfile::TempDir>,
    path: PathBuf,
    registry: Arc<CleanupRegistry>,
    registration: u64,
}

impl TempWorkspace {
    /// Creates a workspace under `<root>/large-sort/`.
    ///
    /// # Arguments
    /// * `root` - Temporary directory root. If the parameter is [`None`] the OS temporary directory is used.
    /// * `registry` - Registry the workspace cleanup is registered in
    pub fn create(root: Option<&Path>, registry: Arc<CleanupRegistry>) -> io::Result<Self> {
        let root = match root {
            Some(root) => root.to_path_buf(),
            None => std::env::temp_dir(),
        };
        let namespace = root.join(WORKSPACE_NAMESPACE);
        fs::create_dir_all(&namespace)?;

        let dir = tempfile::Builder::new().prefix("temp_").tempdir_in(&namespace)?;
        let path = dir.path().to_path_buf();

        let cleanup_path = path.clone();
        let registration = registry.register(move || {
            let _ = fs::remove_dir_all(&cleanup_path);
        });

        log::info!("using {} as a temporary directory", path.display());

        return Ok(TempWorkspace {
            dir: Some(dir),
            path,
            registry,
            registration,
        });
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the run file holding records up to `records_total` (cumulative count).
    pub fn run_path(&self, records_total: usize) -> PathBuf {
        self.path.join(format!("{}_{:010}.txt", WORKSPACE_NAMESPACE, records_total))
    }

    /// Deletes the workspace. Failures are logged and ignored.
    pub fn close(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        self.registry.deregister(self.registration);
        if let Some(dir) = self.dir.take() {
            if let Err(err) = dir.close() {
                log::debug!("temporary directory {} not removed: {}", self.path.display(), err);
            }
        }
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}
