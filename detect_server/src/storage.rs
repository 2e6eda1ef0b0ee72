//! Upload and result directories.
//!
//! Every upload gets its own [`Workspace`]: a pair of directories below the upload and result
//! roots named after a unique id. Uploaded files are removed when the workspace is dropped,
//! annotated results survive only if the workspace was persisted.
use std::{
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};

pub const UPLOADS_DIR: &str = "uploads";
pub const RESULTS_DIR: &str = "results";

/// URL prefix under which the static directory is served.
pub const STATIC_URL: &str = "/static";

pub struct Storage {
    static_dir: PathBuf,
    uploads_dir: PathBuf,
    results_dir: PathBuf,
    keep_results: usize,
    persisted: Mutex<VecDeque<PathBuf>>,
    counter: AtomicU64,
    epoch: u64,
}

impl Storage {
    /// Create a storage below `static_dir`, retaining the results of the last `keep_results`
    /// uploads.
    pub fn new(static_dir: impl Into<PathBuf>, keep_results: usize) -> Self {
        let static_dir = static_dir.into();
        // Distinguishes ids of consecutive server runs
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            uploads_dir: static_dir.join(UPLOADS_DIR),
            results_dir: static_dir.join(RESULTS_DIR),
            static_dir,
            keep_results: keep_results.max(1),
            persisted: Mutex::new(VecDeque::new()),
            counter: AtomicU64::new(0),
            epoch,
        }
    }

    pub fn static_dir(&self) -> &Path {
        &self.static_dir
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Delete and recreate the upload and result directories.
    ///
    /// Everything stored before is gone afterwards. Calling it repeatedly is fine.
    pub fn reset(&self) -> Result<()> {
        for dir in [&self.uploads_dir, &self.results_dir] {
            remove_dir_if_exists(dir)
                .with_context(|| format!("failed to clear {}", dir.display()))?;
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        if let Ok(mut persisted) = self.persisted.lock() {
            persisted.clear();
        }

        log::info!(
            "Cleared {} and {}",
            self.uploads_dir.display(),
            self.results_dir.display()
        );

        Ok(())
    }

    /// Acquire a fresh workspace for a single upload.
    pub fn acquire(&self) -> Result<Workspace<'_>> {
        let id = format!(
            "{:x}-{:04x}",
            self.epoch,
            self.counter.fetch_add(1, Ordering::Relaxed)
        );
        let upload_dir = self.uploads_dir.join(&id);
        let result_dir = self.results_dir.join(&id);

        fs::create_dir_all(&upload_dir)
            .with_context(|| format!("failed to create {}", upload_dir.display()))?;
        let workspace = Workspace {
            storage: self,
            id,
            upload_dir,
            result_dir,
            persisted: false,
        };
        fs::create_dir_all(&workspace.result_dir)
            .with_context(|| format!("failed to create {}", workspace.result_dir.display()))?;

        log::debug!("Acquired workspace {}", &workspace.id);

        Ok(workspace)
    }

    /// Keep `result_dir`, evicting the oldest kept results beyond the retention limit.
    fn retain(&self, result_dir: PathBuf) {
        let evicted: Vec<PathBuf> = match self.persisted.lock() {
            Ok(mut persisted) => {
                persisted.push_back(result_dir);
                let excess = persisted.len().saturating_sub(self.keep_results);
                persisted.drain(..excess).collect()
            }
            Err(_) => {
                log::error!("Result retention queue poisoned");
                Vec::new()
            }
        };

        for dir in evicted {
            log::debug!("Evicting result {}", dir.display());
            if let Err(err) = remove_dir_if_exists(&dir) {
                log::warn!("Failed to remove {}: {}", dir.display(), err);
            }
        }
    }
}

/// Directories of a single upload.
///
/// The upload directory is removed on drop, the result directory as well unless
/// [`Workspace::persist`] was called.
pub struct Workspace<'a> {
    storage: &'a Storage,
    id: String,
    upload_dir: PathBuf,
    result_dir: PathBuf,
    persisted: bool,
}

impl<'a> Workspace<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Where the uploaded file `filename` is stored.
    pub fn upload_path(&self, filename: &str) -> PathBuf {
        self.upload_dir.join(filename)
    }

    /// Where the annotated version of `filename` is stored.
    pub fn result_path(&self, filename: &str) -> PathBuf {
        self.result_dir.join(result_filename(filename))
    }

    /// URL of the annotated version of `filename`.
    pub fn result_url(&self, filename: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            STATIC_URL,
            RESULTS_DIR,
            &self.id,
            result_filename(filename)
        )
    }

    /// Keep the results after the workspace is gone.
    pub fn persist(mut self) {
        self.persisted = true;
        self.storage.retain(self.result_dir.clone());
    }
}

impl<'a> Drop for Workspace<'a> {
    fn drop(&mut self) {
        let mut dirs = vec![&self.upload_dir];
        if !self.persisted {
            dirs.push(&self.result_dir);
        }

        for dir in dirs {
            if let Err(err) = remove_dir_if_exists(dir) {
                log::warn!("Failed to clean up {}: {}", dir.display(), err);
            }
        }

        log::debug!("Released workspace {}", &self.id);
    }
}

fn result_filename(filename: &str) -> String {
    format!("result_{filename}")
}

fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn is_empty_dir(dir: &Path) -> bool {
        dir.is_dir() && fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false)
    }

    #[test]
    fn reset_is_idempotent() -> Result<()> {
        let root = tempfile::tempdir()?;
        let storage = Storage::new(root.path().join("static"), 4);

        storage.reset()?;
        fs::write(storage.uploads_dir().join("old.jpg"), b"old")?;
        fs::create_dir_all(storage.results_dir().join("abc"))?;

        storage.reset()?;
        storage.reset()?;

        assert!(is_empty_dir(storage.uploads_dir()));
        assert!(is_empty_dir(storage.results_dir()));

        Ok(())
    }

    #[test]
    fn workspace_paths_are_unique() -> Result<()> {
        let root = tempfile::tempdir()?;
        let storage = Storage::new(root.path(), 4);
        storage.reset()?;

        let first = storage.acquire()?;
        let second = storage.acquire()?;

        assert_ne!(first.id(), second.id());
        assert_ne!(first.upload_path("dog.jpg"), second.upload_path("dog.jpg"));
        assert_eq!(
            first.upload_path("dog.jpg"),
            storage.uploads_dir().join(first.id()).join("dog.jpg")
        );
        assert_eq!(
            first.result_path("dog.jpg"),
            storage
                .results_dir()
                .join(first.id())
                .join("result_dog.jpg")
        );
        assert_eq!(
            first.result_url("dog.jpg"),
            format!("/static/results/{}/result_dog.jpg", first.id())
        );

        Ok(())
    }

    #[test]
    fn dropped_workspace_is_cleaned_up() -> Result<()> {
        let root = tempfile::tempdir()?;
        let storage = Storage::new(root.path(), 4);
        storage.reset()?;

        {
            let workspace = storage.acquire()?;
            fs::write(workspace.upload_path("cat.png"), b"cat")?;
            fs::write(workspace.result_path("cat.png"), b"cat")?;
        }

        assert!(is_empty_dir(storage.uploads_dir()));
        assert!(is_empty_dir(storage.results_dir()));

        Ok(())
    }

    #[test]
    fn persisted_workspace_keeps_result_only() -> Result<()> {
        let root = tempfile::tempdir()?;
        let storage = Storage::new(root.path(), 4);
        storage.reset()?;

        let workspace = storage.acquire()?;
        fs::write(workspace.upload_path("cat.png"), b"cat")?;
        fs::write(workspace.result_path("cat.png"), b"cat")?;
        let result_path = workspace.result_path("cat.png");
        workspace.persist();

        assert!(is_empty_dir(storage.uploads_dir()));
        assert!(result_path.is_file());

        Ok(())
    }

    #[test]
    fn oldest_results_are_evicted() -> Result<()> {
        let root = tempfile::tempdir()?;
        let storage = Storage::new(root.path(), 2);
        storage.reset()?;

        let mut result_paths = Vec::new();
        for _ in 0..3 {
            let workspace = storage.acquire()?;
            let path = workspace.result_path("a.jpg");
            fs::write(&path, b"a")?;
            result_paths.push(path);
            workspace.persist();
        }

        assert!(!result_paths[0].exists());
        assert!(result_paths[1].exists());
        assert!(result_paths[2].exists());

        Ok(())
    }
}
