//! File watching for shader hot reload.
//!
//! A notify watcher on each watched file's parent directory feeds change
//! events through a channel. Events only nominate candidates: a file is
//! reported when its modification time differs from the last one seen, so
//! bursts of events for one save collapse into a single change. Files whose
//! directory could not be watched are checked on every poll instead.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::SystemTime;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug)]
struct WatchedFile {
    stamp: Option<SystemTime>,
    /// Watched parent directory, `None` when the file is polled every time
    dir: Option<PathBuf>,
}

/// Tracks the last seen modification time of each watched file.
pub(crate) struct ShaderWatcher {
    watcher: Option<RecommendedWatcher>,
    event_rx: mpsc::Receiver<notify::Event>,
    files: HashMap<PathBuf, WatchedFile>,
    /// Canonical directory -> number of watched files inside it
    dirs: HashMap<PathBuf, usize>,
}

impl std::fmt::Debug for ShaderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderWatcher")
            .field("notify", &self.watcher.is_some())
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl Default for ShaderWatcher {
    fn default() -> Self {
        let (tx, event_rx) = mpsc::channel::<notify::Event>();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        });
        let watcher = match watcher {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("File watcher unavailable, shader files will be polled: {e}");
                None
            }
        };
        Self {
            watcher,
            event_rx,
            files: HashMap::new(),
            dirs: HashMap::new(),
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn canonical_dir(path: &Path) -> PathBuf {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

impl ShaderWatcher {
    /// Start watching `path`. A file that does not exist yet is reported
    /// once it appears.
    pub(crate) fn watch(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.files.contains_key(&path) {
            return;
        }
        let stamp = modified(&path);
        let dir = self.watch_dir(canonical_dir(&path));
        log::debug!(
            "Watching shader file {}{}",
            path.display(),
            if dir.is_some() { "" } else { " (polled)" }
        );
        self.files.insert(path, WatchedFile { stamp, dir });
    }

    pub(crate) fn unwatch(&mut self, path: &Path) -> bool {
        let Some(file) = self.files.remove(path) else {
            return false;
        };
        if let Some(dir) = file.dir {
            self.release_dir(dir);
        }
        true
    }

    pub(crate) fn watched(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Paths whose modification time changed since the last poll.
    pub(crate) fn poll(&mut self) -> Vec<PathBuf> {
        let touched = self.drain_events();
        let mut changed = Vec::new();
        for (path, file) in &mut self.files {
            let candidate = file.dir.as_ref().map_or(true, |dir| touched.contains(dir));
            if !candidate {
                continue;
            }
            let current = modified(path);
            if current != file.stamp {
                file.stamp = current;
                if current.is_some() {
                    changed.push(path.clone());
                }
            }
        }
        changed.sort();
        changed
    }

    /// Directories with a create, modify or remove event since the last drain.
    fn drain_events(&self) -> HashSet<PathBuf> {
        let mut touched = HashSet::new();
        while let Ok(event) = self.event_rx.try_recv() {
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                continue;
            }
            for path in &event.paths {
                let dir = canonical_dir(path);
                if self.dirs.contains_key(&dir) {
                    touched.insert(dir);
                }
            }
        }
        touched
    }

    fn watch_dir(&mut self, dir: PathBuf) -> Option<PathBuf> {
        if let Some(count) = self.dirs.get_mut(&dir) {
            *count += 1;
            return Some(dir);
        }
        let watcher = self.watcher.as_mut()?;
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            log::warn!("Failed to watch {}: {e}", dir.display());
            return None;
        }
        self.dirs.insert(dir.clone(), 1);
        Some(dir)
    }

    fn release_dir(&mut self, dir: PathBuf) {
        let Some(count) = self.dirs.get_mut(&dir) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.dirs.remove(&dir);
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(e) = watcher.unwatch(&dir) {
                log::debug!("Failed to unwatch {}: {e}", dir.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("render-core-watch-{}-{name}", std::process::id()))
    }

    /// Events arrive from a background thread; poll until something shows up.
    fn poll_until_changed(watcher: &mut ShaderWatcher) -> Vec<PathBuf> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let changed = watcher.poll();
            if !changed.is_empty() || Instant::now() >= deadline {
                return changed;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_detects_modification() {
        let path = temp_path("modified.wgsl");
        std::fs::write(&path, "// v1").unwrap();

        let mut watcher = ShaderWatcher::default();
        watcher.watch(&path);
        assert!(watcher.poll().is_empty());

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        assert_eq!(poll_until_changed(&mut watcher), vec![path.clone()]);
        assert!(watcher.poll().is_empty());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_reported_when_created() {
        let path = temp_path("late.wgsl");
        let _ = std::fs::remove_file(&path);

        let mut watcher = ShaderWatcher::default();
        watcher.watch(&path);
        assert!(watcher.poll().is_empty());

        std::fs::write(&path, "// hello").unwrap();
        assert_eq!(poll_until_changed(&mut watcher), vec![path.clone()]);

        assert!(watcher.unwatch(&path));
        assert!(watcher.watched().is_empty());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_sibling_files_share_one_directory_watch() {
        let first = temp_path("first.wgsl");
        let second = temp_path("second.wgsl");
        std::fs::write(&first, "// a").unwrap();
        std::fs::write(&second, "// b").unwrap();

        let mut watcher = ShaderWatcher::default();
        watcher.watch(&first);
        watcher.watch(&second);
        watcher.watch(&first);
        assert_eq!(watcher.watched().len(), 2);
        if watcher.watcher.is_some() {
            assert_eq!(watcher.dirs.len(), 1);
            assert_eq!(watcher.dirs.values().sum::<usize>(), 2);
        }

        assert!(watcher.unwatch(&first));
        assert!(!watcher.unwatch(&first));
        assert!(watcher.unwatch(&second));
        assert!(watcher.dirs.is_empty());

        std::fs::remove_file(&first).unwrap();
        std::fs::remove_file(&second).unwrap();
    }

    #[test]
    fn test_events_outside_watched_files_are_ignored() {
        let watched = temp_path("watched.wgsl");
        let other = temp_path("other.txt");
        std::fs::write(&watched, "// watched").unwrap();

        let mut watcher = ShaderWatcher::default();
        watcher.watch(&watched);
        std::fs::write(&other, "noise").unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert!(watcher.poll().is_empty());

        std::fs::remove_file(&watched).unwrap();
        std::fs::remove_file(&other).unwrap();
    }
}
