use anyhow::{bail, Context as _, Result};
use std::path::{Component, Path, PathBuf};

fn strip_leading_dot_slash(mut s: String) -> String {
  while let Some(rest) = s.strip_prefix("./") {
    s = rest.to_string();
  }
  s
}

/// Normalizes a path declared in a manifest to a bundle-relative POSIX path.
///
/// Leading slashes are ignored (manifest paths are always relative to the
/// bundle root); any `.`/`..` segment is rejected outright instead of being
/// resolved.
pub fn normalize_bundle_rel_path(input: &str) -> Result<String> {
  let mut trimmed = input.trim().replace('\\', "/");
  trimmed = trimmed.trim_start_matches('/').to_string();
  trimmed = strip_leading_dot_slash(trimmed);
  if trimmed.is_empty() {
    bail!("executable path is required");
  }
  validate_rel_path(&trimmed)?;
  Ok(trimmed)
}

fn validate_rel_path(posix: &str) -> Result<()> {
  if posix.split('/').any(|p| p.is_empty() || p == "." || p == "..") {
    bail!("path escapes the bundle directory: {posix}");
  }
  Ok(())
}

pub fn join_inside(root: &Path, rel_posix: &str) -> Result<PathBuf> {
  // Reject traversal early.
  validate_rel_path(rel_posix)?;

  let mut out = PathBuf::from(root);
  for part in rel_posix.split('/') {
    out.push(part);
  }

  // A secondary guard: ensure it doesn't contain ParentDir components
  for c in out.strip_prefix(root).unwrap_or(&out).components() {
    if matches!(c, Component::ParentDir) {
      bail!("path escapes the bundle directory");
    }
  }

  Ok(out)
}

/// Resolves the executable a manifest declares into an absolute, canonical
/// path that is guaranteed to live inside the bundle directory.
pub fn resolve_executable(bundle_root: &Path, declared: &str) -> Result<PathBuf> {
  let rel = normalize_bundle_rel_path(declared)?;
  let joined = join_inside(bundle_root, &rel)?;

  let canonical_root = bundle_root
    .canonicalize()
    .with_context(|| format!("bundle directory is unreadable: {}", bundle_root.display()))?;
  let canonical = joined
    .canonicalize()
    .with_context(|| format!("executable does not exist: {}", joined.display()))?;

  // Symlinks are followed by canonicalize, so re-check containment.
  if !canonical.starts_with(&canonical_root) {
    bail!(
      "executable resolves outside the bundle directory: {}",
      canonical.display()
    );
  }

  let metadata = std::fs::metadata(&canonical)
    .with_context(|| format!("executable is unreadable: {}", canonical.display()))?;
  if !metadata.is_file() {
    bail!("executable is not a regular file: {}", canonical.display());
  }

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt as _;
    if metadata.permissions().mode() & 0o111 == 0 {
      bail!("executable is missing execute permission: {}", canonical.display());
    }
  }

  Ok(canonical)
}
