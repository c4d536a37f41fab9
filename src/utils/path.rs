use crate::Result;
use crate::StoreError;

/// Checks that `path` is an absolute, normalised node path.
///
/// Accepts `/` and `/a/b`; rejects relative paths, trailing or doubled slashes,
/// `.`/`..` segments and NUL characters.
pub fn validate_path(path: &str) -> Result<()> {
    let invalid = |reason: &'static str| -> Result<()> {
        Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason,
        }
        .into())
    };

    if !path.starts_with('/') {
        return invalid("path must start with '/'");
    }
    if path.contains('\0') {
        return invalid("path must not contain NUL");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return invalid("path must not end with '/'");
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return invalid("empty path segment"),
            "." | ".." => return invalid("relative path segment"),
            _ => {}
        }
    }
    Ok(())
}

/// Parent of a validated path, `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Proper ancestors of a validated path, outermost first, root excluded.
///
/// `/config/db/url` -> [`/config`, `/config/db`]
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = parent_path(path);
    while let Some(p) = current {
        if p == "/" {
            break;
        }
        out.push(p);
        current = parent_path(p);
    }
    out.reverse();
    out
}
