//! Hot reload: watches shader sources and queues program reloads.
//!
//! Editors often save through a temporary file and a rename, so the watcher
//! follows each source's parent directory and matches event paths back to
//! programs. Bursts of events are collapsed until the sources have been quiet
//! for the scene's debounce interval.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use renderer::{ProgramId, ReloadHandle};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Keeps the file watcher and its forwarding thread alive.
pub struct ShaderWatcher {
    watcher: Option<RecommendedWatcher>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for ShaderWatcher {
    fn drop(&mut self) {
        // Dropping the watcher disconnects the worker's channel.
        self.watcher.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub fn spawn(
    targets: Vec<(ProgramId, PathBuf)>,
    debounce: Duration,
    reloads: ReloadHandle,
) -> Result<ShaderWatcher> {
    let targets: Vec<(ProgramId, PathBuf)> = targets
        .into_iter()
        .map(|(id, path)| {
            let path = path.canonicalize().unwrap_or(path);
            (id, path)
        })
        .collect();
    let directories: BTreeSet<PathBuf> = targets
        .iter()
        .filter_map(|(_, path)| path.parent().map(Path::to_path_buf))
        .collect();

    let (tx, rx) = unbounded::<Vec<PathBuf>>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event)
            if matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
            ) =>
        {
            let _ = tx.send(event.paths);
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "file watcher error"),
    })
    .context("failed to create file watcher")?;

    for directory in &directories {
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", directory.display()))?;
        debug!(directory = %directory.display(), "watching shader sources");
    }

    let worker = thread::Builder::new()
        .name("computeshader-watch".into())
        .spawn(move || {
            let mut debouncer = Debouncer::new(debounce);
            loop {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(paths) => debouncer.note(programs_for(&targets, &paths), Instant::now()),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(ready) = debouncer.take_ready(Instant::now()) else {
                    continue;
                };
                for id in ready {
                    info!(program = %id, "source changed; queueing reload");
                    if !reloads.reload(id.as_str()) {
                        return;
                    }
                }
            }
        })
        .context("failed to spawn watcher thread")?;

    Ok(ShaderWatcher {
        watcher: Some(watcher),
        worker: Some(worker),
    })
}

/// Programs whose sources appear in `changed`, each listed once.
fn programs_for(targets: &[(ProgramId, PathBuf)], changed: &[PathBuf]) -> Vec<ProgramId> {
    let mut ids = BTreeSet::new();
    for path in changed {
        let canonical = path.canonicalize().ok();
        for (id, target) in targets {
            if target == path || canonical.as_ref() == Some(target) {
                ids.insert(id.clone());
            }
        }
    }
    ids.into_iter().collect()
}

struct Debouncer {
    quiet: Duration,
    pending: BTreeSet<ProgramId>,
    last_change: Option<Instant>,
}

impl Debouncer {
    fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: BTreeSet::new(),
            last_change: None,
        }
    }

    fn note(&mut self, ids: Vec<ProgramId>, now: Instant) {
        if ids.is_empty() {
            return;
        }
        self.pending.extend(ids);
        self.last_change = Some(now);
    }

    /// Pending programs once nothing has changed for the quiet interval.
    fn take_ready(&mut self, now: Instant) -> Option<Vec<ProgramId>> {
        let last = self.last_change?;
        if now.saturating_duration_since(last) < self.quiet {
            return None;
        }
        self.last_change = None;
        Some(std::mem::take(&mut self.pending).into_iter().collect())
    }
}
