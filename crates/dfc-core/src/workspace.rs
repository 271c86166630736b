use std::path::{Component, Path};

/// Broken-build count at which a workspace stops admitting new claims.
pub const BROKEN_BUILD_CLAIM_THRESHOLD: usize = 3;

/// Derives the workspace key a source path routes to: the first directory
/// components (up to three) joined with dashes, after dropping a leading
/// `src` and, when configured, the tree-root component. Paths with no
/// directory left route to `root`.
///
/// One rule at the finest granularity commits are grouped by, so sibling
/// files always land on the same key.
pub fn subdirectory_key(source_file: &str, tree_root: Option<&str>) -> String {
    let mut directories: Vec<&str> = Path::new(source_file)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    // The last component is the file itself; keys name directories.
    directories.pop();

    let mut start = 0;
    while start < directories.len() {
        let part = directories[start];
        let is_root = tree_root.is_some_and(|root| root == part);
        if part == "src" || is_root {
            start += 1;
        } else {
            break;
        }
    }

    let kept: Vec<&str> = directories[start..].iter().take(3).copied().collect();
    if kept.is_empty() {
        "root".to_string()
    } else {
        kept.join("-")
    }
}

/// Directory name of the shared worktree serving a workspace key.
pub fn worktree_dir_name(key: &str) -> String {
    format!("dir-{key}")
}

/// The key re-expanded to its directory path, for matching stored source
/// paths back to a key.
pub fn key_path_fragment(key: &str) -> String {
    key.replace('-', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_paths_keep_three_components() {
        assert_eq!(
            subdirectory_key("melee/ft/chara/ftCaptain/ftCa_Init.c", Some("melee")),
            "ft-chara-ftCaptain"
        );
        assert_eq!(
            subdirectory_key("src/melee/it/items/itkusudama.c", Some("melee")),
            "it-items"
        );
    }

    #[test]
    fn shallow_paths_use_what_is_there() {
        assert_eq!(
            subdirectory_key("src/melee/lb/lbvector.c", Some("melee")),
            "lb"
        );
        assert_eq!(subdirectory_key("sysdolphin/baselib/gobj.c", None), "sysdolphin-baselib");
    }

    #[test]
    fn bare_files_route_to_root() {
        assert_eq!(subdirectory_key("main.c", None), "root");
        assert_eq!(subdirectory_key("src/main.c", None), "root");
        assert_eq!(subdirectory_key("src/melee/main.c", Some("melee")), "root");
    }

    #[test]
    fn tree_root_is_only_stripped_when_configured() {
        assert_eq!(
            subdirectory_key("melee/lb/lbvector.c", None),
            "melee-lb"
        );
    }

    #[test]
    fn worktree_names_and_fragments_invert_the_key() {
        assert_eq!(worktree_dir_name("ft-chara-ftCaptain"), "dir-ft-chara-ftCaptain");
        assert_eq!(key_path_fragment("ft-chara-ftCaptain"), "ft/chara/ftCaptain");
        assert_eq!(key_path_fragment("lb"), "lb");
    }
}
