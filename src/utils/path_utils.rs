use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Filesystems on these platforms compare paths case-insensitively by default.
const CASE_INSENSITIVE_FS: bool = cfg!(any(windows, target_os = "macos"));

/// Expands tilde (~) in a path string to the user's home directory.
pub fn expand_tilde_path_buf(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
                // `..` at the root stays at the root
            }
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

/// Absolute, resolved form of `path`: tilde expanded, relative paths joined
/// onto the current directory, `.`/`..` removed, symlinks resolved when the
/// path exists.
pub fn resolve_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde_path_buf(&path.to_string_lossy());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(expanded),
            Err(_) => expanded,
        }
    };
    let lexical = normalize_lexically(&absolute);
    // Using dunce for better Windows UNC/prefix handling
    dunce::canonicalize(&lexical).unwrap_or(lexical)
}

/// String form of a location used in reuse-cache keys, so that one logical
/// location always yields the same key.
pub fn normalize_location(path: &Path) -> String {
    let resolved = resolve_path(path);
    let mut normalized = resolved.to_string_lossy().replace('\\', "/");
    while normalized.len() > 1 && normalized.ends_with('/') && !normalized.ends_with(":/") {
        normalized.pop();
    }
    if CASE_INSENSITIVE_FS {
        normalized = normalized.to_lowercase();
    }
    debug!(original = %path.display(), %normalized, "Normalized location");
    normalized
}

/// Directory a session for `location` should start in: the location itself
/// when it is a directory, otherwise its parent.
pub fn working_directory_for(location: &Path) -> PathBuf {
    let resolved = resolve_path(location);
    if resolved.is_dir() {
        return resolved;
    }
    match resolved.parent() {
        Some(parent) => parent.to_path_buf(),
        None => resolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_segments_and_trailing_slashes_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("pkg");
        std::fs::create_dir(&sub).unwrap();

        let direct = normalize_location(&sub);
        let roundabout = normalize_location(&dir.path().join("pkg/../pkg/./"));
        assert_eq!(direct, roundabout);
        assert!(!direct.ends_with('/'));
    }

    #[test]
    fn missing_paths_are_normalized_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/proj/src/../file.py")),
            PathBuf::from("/proj/file.py")
        );
        assert_eq!(normalize_lexically(Path::new("/../proj")), PathBuf::from("/proj"));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_tilde_path_buf("~/envs"), PathBuf::from(home).join("envs"));
        }
    }

    #[test]
    fn working_directory_of_a_file_is_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        std::fs::write(&file, "print('hi')\n").unwrap();

        assert_eq!(working_directory_for(&file), resolve_path(dir.path()));
        assert_eq!(working_directory_for(dir.path()), resolve_path(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn nonexistent_file_location_uses_parent() {
        assert_eq!(
            working_directory_for(Path::new("/proj/file.py")),
            PathBuf::from("/proj")
        );
    }
}
