//! Path and name utilities: entry-name validation, path-component
//! splitting for lookup, and node-to-absolute-path construction.
//!
//! Component splitting is grounded on
//! `original_source/lib/sqfs/dir_reader/find_by_path.c`
//! (`sqfs_dir_reader_find_by_path`): repeated `/` are collapsed and a
//! leading/trailing slash never produces an empty component.

use crate::error::SquashfsError;

/// A name is a legal single path component: non-empty, no embedded `/`,
/// and not `.` or `..` (those are synthesized by the directory reader,
/// never stored as a real entry).
pub fn validate_entry_name(name: &str) -> Result<(), SquashfsError> {
    if name.is_empty() {
        return Err(SquashfsError::ArgInvalid("entry name must not be empty"));
    }
    if name.contains('/') {
        return Err(SquashfsError::ArgInvalid("entry name must not contain '/'"));
    }
    if name == "." || name == ".." {
        return Err(SquashfsError::ArgInvalid("entry name must not be '.' or '..'"));
    }
    Ok(())
}

/// Splits a lookup path into its non-empty components, collapsing runs of
/// `/` the way `find_by_path.c` does.
pub fn split_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Joins path components walked from the root down to a node into the
/// absolute path string spec.md's "Entry name rules" describes: `/` for
/// the root, `/`-separated with no trailing slash otherwise.
///
/// `components` is ordered root-first; the root's own (empty) name is
/// expected to have already been excluded by the caller.
pub fn join_absolute(components: &[&str]) -> String {
    if components.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for c in components {
        out.push('/');
        out.push_str(c);
    }
    out
}

/// Walks parent links from `start` up to (and including) a node whose
/// parent is itself (the root), accumulating names. `get_name_and_parent`
/// returns `(name, parent_key)` for a given key; the walk stops when a key
/// maps to itself. Detects cycles via a bounded walk: any chain longer
/// than `limit` hops is treated as a loop, matching spec.md's "detects
/// cycles (returns a loop-error)" requirement without needing a full
/// visited-set for what is normally a shallow walk.
pub fn absolute_path<K, F>(start: K, limit: usize, mut get_name_and_parent: F) -> Result<String, SquashfsError>
where
    K: PartialEq + Clone,
    F: FnMut(&K) -> Option<(String, K)>,
{
    let mut names = Vec::new();
    let mut cur = start;
    for _ in 0..=limit {
        let Some((name, parent)) = get_name_and_parent(&cur) else {
            break;
        };
        if parent == cur {
            break;
        }
        if !name.is_empty() {
            names.push(name);
        }
        cur = parent;
    }
    if names.len() > limit {
        return Err(SquashfsError::LinkLoop);
    }
    names.reverse();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    Ok(join_absolute(&refs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_names() {
        assert!(validate_entry_name("").is_err());
        assert!(validate_entry_name("a/b").is_err());
        assert!(validate_entry_name(".").is_err());
        assert!(validate_entry_name("..").is_err());
        assert!(validate_entry_name("ok").is_ok());
    }

    #[test]
    fn splits_and_collapses_slashes() {
        assert_eq!(split_components("/a//b/c/"), vec!["a", "b", "c"]);
        assert_eq!(split_components("/"), Vec::<&str>::new());
    }

    #[test]
    fn root_path_is_slash() {
        assert_eq!(join_absolute(&[]), "/");
        assert_eq!(join_absolute(&["a", "b"]), "/a/b");
    }

    #[test]
    fn walks_parents_to_build_absolute_path() {
        // 1 -> 2 -> 3(root, parent of itself)
        let names = [(1u32, ("c", 2u32)), (2, ("b", 3)), (3, ("", 3))];
        let lookup = |k: &u32| names.iter().find(|(id, _)| id == k).map(|(_, v)| v.clone()).map(|(n, p)| (n.to_string(), p));
        let path = absolute_path(1u32, 16, lookup).unwrap();
        assert_eq!(path, "/b/c");
    }

    #[test]
    fn detects_cycles() {
        let lookup = |k: &u32| Some((format!("n{k}"), k + 1));
        let err = absolute_path(0u32, 8, lookup).unwrap_err();
        assert!(matches!(err, SquashfsError::LinkLoop));
    }
}
