use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no {MANIFEST_FILE_NAME} in bundle directory")]
    MissingManifest,
    #[error("manifest is unreadable: {0}")]
    Unreadable(String),
    #[error("manifest is malformed: {0}")]
    Parse(String),
    #[error("duplicate plugin id '{0}'")]
    DuplicateId(String),
}

/// A discovered plugin directory. Never mutated; a rescan builds new ones.
#[derive(Clone, Debug, PartialEq)]
pub struct Bundle {
    pub manifest: Manifest,
    /// Absolute path of the bundle directory.
    pub path: PathBuf,
}

impl Bundle {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE_NAME)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BundleScan {
    /// Valid bundles, sorted by directory name.
    pub bundles: Vec<Bundle>,
    /// Directories that were looked at and excluded, with the reason.
    pub skipped: Vec<(PathBuf, DiscoveryError)>,
}

impl BundleScan {
    pub fn find(&self, plugin_id: &str) -> Option<&Bundle> {
        self.bundles.iter().find(|bundle| bundle.id() == plugin_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.bundles.iter().map(|b| b.id().to_string()).collect()
    }
}

/// Loads the bundle rooted at `dir`.
pub fn load_bundle(dir: &Path) -> Result<Bundle, DiscoveryError> {
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    if !manifest_path.is_file() {
        return Err(DiscoveryError::MissingManifest);
    }

    let raw = std::fs::read_to_string(&manifest_path)
        .map_err(|err| DiscoveryError::Unreadable(err.to_string()))?;
    let manifest = Manifest::parse(&raw).map_err(DiscoveryError::Parse)?;

    let path = dir
        .canonicalize()
        .map_err(|err| DiscoveryError::Unreadable(err.to_string()))?;
    Ok(Bundle { manifest, path })
}

/// Scans the immediate subdirectories of `root` for plugin bundles.
///
/// Bad bundles never fail the scan: they end up in `skipped`. A missing root
/// yields an empty scan.
pub fn scan_bundles(root: &Path) -> BundleScan {
    let mut dirs = Vec::new();
    if !root.is_dir() {
        tracing::debug!(root = %root.display(), "plugin directory does not exist");
        return BundleScan::default();
    }

    let mut builder = WalkBuilder::new(root);
    builder
        .standard_filters(false)
        .hidden(true)
        .follow_links(true)
        .max_depth(Some(1));

    for result in builder.build() {
        let dent = match result {
            Ok(d) => d,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable plugin directory entry");
                continue;
            }
        };
        if dent.depth() == 0 {
            continue;
        }
        if dent.file_type().is_some_and(|t| t.is_dir()) {
            dirs.push(dent.into_path());
        }
    }

    dirs.sort();

    let mut scan = BundleScan::default();
    let mut seen = HashSet::new();
    for dir in dirs {
        match load_bundle(&dir) {
            Ok(bundle) => {
                if !seen.insert(bundle.id().to_string()) {
                    tracing::warn!(
                        plugin_id = bundle.id(),
                        path = %dir.display(),
                        "duplicate plugin id, keeping the first bundle"
                    );
                    let id = bundle.id().to_string();
                    scan.skipped.push((dir, DiscoveryError::DuplicateId(id)));
                    continue;
                }
                scan.bundles.push(bundle);
            }
            Err(DiscoveryError::MissingManifest) => {
                scan.skipped.push((dir, DiscoveryError::MissingManifest));
            }
            Err(err) => {
                tracing::warn!(path = %dir.display(), error = %err, "skipping invalid plugin bundle");
                scan.skipped.push((dir, err));
            }
        }
    }

    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_bundle(root: &Path, dir: &str, manifest: Option<&str>) {
        let path = root.join(dir);
        fs::create_dir_all(&path).expect("create bundle dir");
        if let Some(manifest) = manifest {
            fs::write(path.join(MANIFEST_FILE_NAME), manifest).expect("write manifest");
        }
    }

    #[test]
    fn scan_includes_only_valid_bundles() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "good", Some(r#"{"id":"com.example.good"}"#));
        write_bundle(root.path(), "empty", Some(""));
        write_bundle(root.path(), "broken", Some("{ not json"));
        write_bundle(root.path(), "nomanifest", None);
        write_bundle(root.path(), "badid", Some(r#"{"id":"../x"}"#));

        let scan = scan_bundles(root.path());

        assert_eq!(scan.ids(), vec!["com.example.good".to_string()]);
        assert_eq!(scan.skipped.len(), 4);
        assert!(scan
            .skipped
            .iter()
            .any(|(path, err)| path.ends_with("nomanifest")
                && *err == DiscoveryError::MissingManifest));
    }

    #[test]
    fn scan_is_sorted_and_idempotent() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "zeta", Some(r#"{"id":"zeta.plugin"}"#));
        write_bundle(root.path(), "alpha", Some(r#"{"id":"alpha.plugin"}"#));
        write_bundle(root.path(), "mid", Some(r#"{"id":"mid.plugin"}"#));

        let first = scan_bundles(root.path());
        let second = scan_bundles(root.path());

        assert_eq!(
            first.ids(),
            vec!["alpha.plugin", "mid.plugin", "zeta.plugin"]
        );
        assert_eq!(first, second);
    }

    #[test]
    fn scan_skips_duplicate_ids() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "a", Some(r#"{"id":"dup.plugin"}"#));
        write_bundle(root.path(), "b", Some(r#"{"id":"dup.plugin"}"#));

        let scan = scan_bundles(root.path());
        assert_eq!(scan.bundles.len(), 1);
        assert!(scan.bundles[0].path.ends_with("a"));
        assert!(matches!(scan.skipped[0].1, DiscoveryError::DuplicateId(_)));
    }

    #[test]
    fn scan_ignores_plain_files_and_missing_root() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::write(root.path().join(MANIFEST_FILE_NAME), r#"{"id":"top.level"}"#)
            .expect("write stray manifest");

        assert!(scan_bundles(root.path()).bundles.is_empty());
        assert!(scan_bundles(&root.path().join("absent")).bundles.is_empty());
    }

    #[test]
    fn bundle_path_is_absolute() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "good", Some(r#"{"id":"com.example.good"}"#));
        let bundle = load_bundle(&root.path().join("good")).expect("load");
        assert!(bundle.path.is_absolute());
        assert!(bundle.manifest_path().is_file());
    }
}
