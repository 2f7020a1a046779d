use std::path::{Component, Path, PathBuf};

/// Render a relative path with `/` separators, dropping `.` segments.
pub fn normalize_path(path: &Path) -> String {
    let mut parts = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(os) => parts.push(os.to_string_lossy().to_string()),
            Component::ParentDir => parts.push("..".to_string()),
            Component::CurDir => {}
            _ => {}
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Resolve `.` and `..` lexically without touching the filesystem.
/// `..` above the path's root is kept so callers can detect the escape.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    out
}

pub fn render_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(normalize_path)
        .unwrap_or_else(|_| path.to_string_lossy().to_string())
}

/// Last `max_bytes` of `value`, trimmed; `None` when nothing is left.
pub fn tail_str_bytes(value: &str, max_bytes: usize) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() <= max_bytes {
        return Some(trimmed.to_string());
    }
    let mut start = trimmed.len() - max_bytes;
    while start < trimmed.len() && !trimmed.is_char_boundary(start) {
        start += 1;
    }
    Some(trimmed[start..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_uses_forward_slashes() {
        assert_eq!(normalize_path(Path::new("pkg/./a.py")), "pkg/a.py");
        assert_eq!(normalize_path(Path::new("")), ".");
    }

    #[test]
    fn clean_path_resolves_parent_segments() {
        assert_eq!(
            clean_path(Path::new("/repo/pkg/../src/./a.py")),
            PathBuf::from("/repo/src/a.py")
        );
        assert_eq!(clean_path(Path::new("/../etc")), PathBuf::from("/etc"));
        assert_eq!(clean_path(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail_str_bytes("  abcdef  ", 3).as_deref(), Some("def"));
        assert_eq!(tail_str_bytes("ab\u{e9}", 2).as_deref(), Some("\u{e9}"));
        assert_eq!(tail_str_bytes("   ", 10), None);
    }
}
