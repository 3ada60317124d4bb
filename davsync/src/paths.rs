use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path must be relative to the sync root: {0}")]
    Absolute(String),
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Checks that a change-list path is a plain relative path ("Docs/a.txt").
pub fn validate_relative(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(PathError::Absolute(path.to_string()));
    }
    for part in path.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return Err(PathError::UnsupportedComponent(path.to_string()));
        }
    }
    Ok(())
}

pub fn local_path_for(local_root: &Path, path: &str) -> Result<PathBuf, PathError> {
    validate_relative(path)?;

    let mut out = local_root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(path.to_string()));
            }
        }
    }
    Ok(out)
}

/// `remote_root` always ends with '/'.
pub fn remote_path_for(remote_root: &str, path: &str) -> String {
    format!("{remote_root}{}", path.trim_start_matches('/'))
}

pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

/// True when `path` is `ancestor` itself or lies below it.
pub fn is_same_or_below(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Hidden sibling used to stage a download before it is renamed into place.
pub fn staging_path_for(target: &Path, tag: u32) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.~{tag:08x}"))
}

pub fn with_trailing_slash(value: &str) -> String {
    if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    }
}
