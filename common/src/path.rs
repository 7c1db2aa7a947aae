// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

///
/// Lexically normalizes a relative path: resolves `.` and `..` components without touching
/// the filesystem. The empty path and `.` both normalize to `.`; `..` components that would
/// escape the root are preserved.
///
pub fn normalize_path(path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => match components.last() {
                Some(&last) if last != ".." => {
                    components.pop();
                }
                _ => components.push(".."),
            },
            other => components.push(other),
        }
    }
    if components.is_empty() {
        ".".to_string()
    } else {
        components.join("/")
    }
}

///
/// Returns the first pair of staged paths that conflict: either the same path twice, or one
/// path claiming a directory that another claims as a file. Paths must be normalized.
///
pub fn tree_conflict<'a>(paths: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut sorted: Vec<&str> = paths.collect();
    sorted.sort_unstable();
    for window in sorted.windows(2) {
        let (a, b) = (window[0], window[1]);
        if a == b || (b.len() > a.len() && b.starts_with(a) && b.as_bytes()[a.len()] == b'/') {
            return Some(a.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{normalize_path, tree_conflict};

    #[test]
    fn normalization() {
        assert_eq!(normalize_path(""), normalize_path("."));
        assert_eq!(normalize_path(""), ".");
        assert_eq!(normalize_path("."), ".");

        assert_eq!(normalize_path("foo/bar/.."), "foo");
        assert_eq!(normalize_path("foo/bar/../"), "foo");
        assert_eq!(normalize_path("foo/bar/../baz"), "foo/baz");
        assert_eq!(normalize_path("./foo/bar"), "foo/bar");
        assert_eq!(normalize_path("foo/.."), ".");
        assert_eq!(normalize_path("./foo/.."), ".");
    }

    #[test]
    fn normalization_preserves_escaping_components() {
        assert_eq!(normalize_path("../foo"), "../foo");
        assert_eq!(normalize_path("foo/../../bar"), "../bar");
    }

    #[test]
    fn conflicts() {
        assert_eq!(
            tree_conflict(["foo", "foo/bar"].into_iter()),
            Some("foo".to_string())
        );
        assert_eq!(
            tree_conflict(["foo", "foo"].into_iter()),
            Some("foo".to_string())
        );
        assert_eq!(tree_conflict(["foo", "foobar", "bar"].into_iter()), None);
        assert_eq!(tree_conflict(["foo/bar", "foo/baz"].into_iter()), None);
    }
}
