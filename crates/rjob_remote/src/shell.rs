//! Small helpers for building POSIX shell command lines for the remote side.

use std::path::{Component, Path};

/// Single-quotes `value` for `sh`, escaping embedded single quotes.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Replaces a leading `~` or `~/` with `home`. Other paths are returned untouched.
pub fn expand_home(path: &str, home: &str) -> String {
    let home = home.trim_end_matches('/');
    if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}

/// Joins remote path segments with `/`, collapsing duplicate separators at the seams.
pub fn join(base: &str, child: &str) -> String {
    if child.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), child.trim_start_matches('/'))
}

/// Renders a relative local path with `/` separators so it can be appended to a remote path.
/// Returns `None` for paths that climb out of their base or are absolute.
pub fn relative_posix(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
