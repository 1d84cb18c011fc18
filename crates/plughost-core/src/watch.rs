use anyhow::Result;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BundleChange {
    /// Something inside this bundle directory (by directory name) changed.
    Touched { dir: String },
    RescanRequired,
}

/// Watches a plugin directory and reports which bundles need a rescan.
pub struct BundleWatcher {
    _watcher: RecommendedWatcher,
    receiver: Receiver<notify::Result<notify::Event>>,
    root: PathBuf,
}

impl BundleWatcher {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blocks for the first event, then collects more for up to `debounce`.
    pub fn recv_batch(&self, debounce: Duration, max_batch: usize) -> Result<Vec<BundleChange>> {
        let first = match self.receiver.recv() {
            Ok(event) => event,
            Err(err) => anyhow::bail!("watch receiver closed: {err}"),
        };

        let mut out = Vec::new();
        push_event_changes(&self.root, first, &mut out);

        let started = Instant::now();
        while out.len() < max_batch && started.elapsed() < debounce {
            let remain = debounce
                .checked_sub(started.elapsed())
                .unwrap_or(Duration::ZERO);
            if remain.is_zero() {
                break;
            }

            match self.receiver.recv_timeout(remain) {
                Ok(event) => push_event_changes(&self.root, event, &mut out),
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("watch receiver disconnected")
                }
            }
        }

        Ok(dedup_changes(out))
    }
}

fn push_event_changes(
    root: &Path,
    event: notify::Result<notify::Event>,
    out: &mut Vec<BundleChange>,
) {
    let event = match event {
        Ok(event) => event,
        Err(_) => {
            out.push(BundleChange::RescanRequired);
            return;
        }
    };

    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }

    for path in &event.paths {
        match bundle_dir_name(root, path) {
            Some(dir) => out.push(BundleChange::Touched { dir }),
            None if path == root => out.push(BundleChange::RescanRequired),
            None => {}
        }
    }
}

/// Name of the bundle directory (first component below `root`) that `path`
/// belongs to.
pub fn bundle_dir_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    match rel.components().next()? {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}

fn dedup_changes(changes: Vec<BundleChange>) -> Vec<BundleChange> {
    if changes.contains(&BundleChange::RescanRequired) {
        return vec![BundleChange::RescanRequired];
    }
    changes
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_dir_name_uses_first_component() {
        let root = Path::new("/srv/plugins");
        assert_eq!(
            bundle_dir_name(root, Path::new("/srv/plugins/foo/server/plugin")),
            Some("foo".to_string())
        );
        assert_eq!(
            bundle_dir_name(root, Path::new("/srv/plugins/bar")),
            Some("bar".to_string())
        );
        assert_eq!(bundle_dir_name(root, Path::new("/srv/plugins")), None);
        assert_eq!(bundle_dir_name(root, Path::new("/elsewhere/foo")), None);
    }

    #[test]
    fn dedup_merges_repeated_touches() {
        let out = dedup_changes(vec![
            BundleChange::Touched {
                dir: "b".to_string(),
            },
            BundleChange::Touched {
                dir: "a".to_string(),
            },
            BundleChange::Touched {
                dir: "b".to_string(),
            },
        ]);
        assert_eq!(
            out,
            vec![
                BundleChange::Touched {
                    dir: "a".to_string()
                },
                BundleChange::Touched {
                    dir: "b".to_string()
                }
            ]
        );
    }

    #[test]
    fn dedup_keeps_rescan_as_single_signal() {
        let out = dedup_changes(vec![
            BundleChange::Touched {
                dir: "a".to_string(),
            },
            BundleChange::RescanRequired,
        ]);
        assert_eq!(out, vec![BundleChange::RescanRequired]);
    }

    #[test]
    fn watcher_reports_new_bundle_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        let root_path = root.path().canonicalize().expect("canonical root");
        let watcher = BundleWatcher::new(&root_path).expect("watch");

        std::fs::create_dir_all(root_path.join("fresh")).expect("create bundle");
        std::fs::write(root_path.join("fresh").join("plugin.json"), "{}")
            .expect("write manifest");

        let changes = watcher
            .recv_batch(Duration::from_millis(200), 64)
            .expect("recv batch");
        assert!(changes.iter().any(|change| matches!(
            change,
            BundleChange::Touched { dir } if dir == "fresh"
        ) || *change == BundleChange::RescanRequired));
    }
}
