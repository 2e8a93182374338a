//! The file manager: owns the published snapshot, the change-notification
//! subscription and the resolver used by request handlers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, instrument, warn};

use crate::entry::Entry;
use crate::rules::RuleSet;
use crate::scan::{scan_dir, IdGen};
use crate::Error;

/// Pause after publishing a refreshed snapshot, to absorb notification
/// storms from mechanisms that redeliver duplicate events.
const REFRESH_PAUSE: Duration = Duration::from_secs(5);

/// Backoff after a failed rescan before trying again.
const RESCAN_BACKOFF: Duration = Duration::from_secs(30);

type Tree = HashMap<String, Arc<Entry>>;

/// A successful path resolution: the entry to serve and the request-facing
/// name it was found under (the alias or index name, not necessarily the
/// on-disk file name).
pub struct Resolved {
    pub entry: Arc<Entry>,
    pub name: String,
}

/// A change-notification subscription. The watcher must stay alive for
/// events to be delivered; dropping it discards anything still queued.
struct ArmedWatch {
    _watcher: RecommendedWatcher,
    rx: UnboundedReceiver<()>,
}

/// Keeps an authoritative snapshot of a directory tree in memory and
/// refreshes it when the filesystem changes.
///
/// Exactly one writer (the refresh loop) ever replaces the snapshot, always
/// wholesale under the write lock. Readers clone the snapshot `Arc` under
/// the read lock and walk it lock-free, so a request already holding an
/// entry keeps serving it even if a refresh (or a deletion on disk) races
/// the transfer.
pub struct TreeManager {
    root: PathBuf,
    rules: RuleSet,
    index_name: String,
    ids: IdGen,
    tree: RwLock<Arc<Tree>>,
    /// Armed during construction, consumed by the refresh loop.
    armed: Mutex<Option<ArmedWatch>>,
}

impl TreeManager {
    /// Performs one full synchronous scan before returning, so callers never
    /// see an empty or partial tree. The watch is armed *before* the first
    /// listing: a change racing the scan is then reported rather than
    /// missed.
    pub fn new(
        root: impl Into<PathBuf>,
        rules: RuleSet,
        index_name: impl Into<String>,
    ) -> Result<Self, Error> {
        let root = root.into();
        let armed = arm_watch(&root)?;
        let ids = IdGen::new();
        let tree = scan_dir(&root, &HashMap::new(), &rules, &ids)?;
        Ok(Self {
            root,
            rules,
            index_name: index_name.into(),
            ids,
            tree: RwLock::new(Arc::new(tree)),
            armed: Mutex::new(Some(armed)),
        })
    }

    /// Runs forever: blocks until the filesystem reports a change under the
    /// root, re-arms the watch, rescans and publishes the new snapshot.
    ///
    /// Rescan failures never disturb the snapshot being served; they are
    /// logged and retried after a backoff.
    pub async fn watch_and_refresh(self: Arc<Self>) {
        let mut armed = self.armed.lock().take();
        loop {
            let Some(mut watch) = armed.take() else {
                match arm_watch(&self.root) {
                    Ok(w) => {
                        armed = Some(w);
                    }
                    Err(e) => {
                        warn!(err = %e, "unable to arm watch");
                        tokio::time::sleep(RESCAN_BACKOFF).await;
                    }
                }
                continue;
            };

            if watch.rx.recv().await.is_none() {
                warn!("change notification channel closed");
            }
            drop(watch);

            // Re-arm before listing, so changes made while the rescan runs
            // are reported on the next round instead of being missed.
            armed = match arm_watch(&self.root) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(err = %e, "unable to re-arm watch");
                    None
                }
            };

            match self.refresh().await {
                Ok(()) => tokio::time::sleep(REFRESH_PAUSE).await,
                Err(e) => {
                    warn!(err = %e, "rescan failed, keeping previous snapshot");
                    tokio::time::sleep(RESCAN_BACKOFF).await;
                }
            }
        }
    }

    /// One rescan-and-swap step. Identities of unchanged entries carry over
    /// from the snapshot being replaced. After this returns, every
    /// subsequently resolved request observes the new tree.
    #[instrument(skip(self), fields(root = %self.root.display()), err)]
    pub async fn refresh(self: &Arc<Self>) -> Result<(), Error> {
        let prev = self.tree.read().clone();
        let this = self.clone();
        let tree =
            tokio::task::spawn_blocking(move || scan_dir(&this.root, &prev, &this.rules, &this.ids))
                .await??;
        *self.tree.write() = Arc::new(tree);
        debug!("published new snapshot");
        Ok(())
    }

    /// Resolves a request path against the current snapshot.
    ///
    /// The path is cleaned lexically; a final directory is rewritten to its
    /// index entry. Directories themselves are never returned.
    pub fn resolve(&self, request_path: &str) -> Option<Resolved> {
        // The lock is held only long enough to clone the snapshot pointer;
        // the walk and everything after it run lock-free.
        let tree = self.tree.read().clone();

        let clean = path_clean::clean(request_path);

        let mut found: Option<(&str, Arc<Entry>)> = None;
        let mut dir: &Tree = &tree;
        for seg in clean.split('/').filter(|s| !s.is_empty() && *s != ".") {
            let e = dir.get(seg)?;
            found = Some((seg, e.clone()));
            dir = &e.children;
        }

        let index = |dir: &Tree| {
            dir.get(&self.index_name)
                .filter(|e| !e.is_dir)
                .map(|e| Resolved {
                    entry: e.clone(),
                    name: self.index_name.clone(),
                })
        };

        match found {
            // "", "." and "/" all land here: the root's index entry.
            None => index(&tree),
            Some((_, e)) if e.is_dir => index(&e.children),
            Some((name, entry)) => Some(Resolved {
                name: name.to_owned(),
                entry,
            }),
        }
    }
}

fn arm_watch(root: &Path) -> Result<ArmedWatch, Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) if is_tree_change(&event.kind) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            // Watch errors (overflow, removed root) also force a rescan.
            Err(_) => {
                let _ = tx.send(());
            }
        }
    })
    .map_err(|e| Error::Watch(root.to_path_buf(), e))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| Error::Watch(root.to_path_buf(), e))?;
    Ok(ArmedWatch {
        _watcher: watcher,
        rx,
    })
}

fn is_tree_change(kind: &EventKind) -> bool {
    use notify::event::{AccessKind, AccessMode};
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}
