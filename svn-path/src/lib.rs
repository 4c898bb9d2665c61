//! Server path algebra and the two transcoding layers used on the DAV wire.
//!
//! Server paths are `$`-sigil rooted (`$/proj/dir/file`), forward-slash
//! separated, and never percent-encoded: the HTTP boundary decodes hrefs
//! before they reach the core, and encodes on the way back out. The two
//! transcoding layers compose in a fixed order for values that appear both
//! in a `D:href` and as XML text: percent-encode first, then entity-escape;
//! decoding reverses the order.

mod case;
pub use self::case::{CasePolicy, PathComparison};

mod encode;
pub use self::encode::{decode_uri, encode_uri};

mod error;
pub use self::error::Error;

mod xml;
pub use self::xml::{escape_xml, unescape_xml};

/// The sigil the CVCS uses for its repository root.
pub const ROOT_SIGIL: &str = "$";

/// The canonical server root path.
pub const SERVER_ROOT: &str = "$/";

/// Joins a path and a child segment, normalizing a trailing slash on the
/// parent.
pub fn join(parent: &str, segment: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        return segment.into();
    }

    format!("{}/{}", parent, segment)
}

/// Splits a path into its parent and final segment, modulo trailing-slash
/// normalization. The root splits into itself and an empty leaf.
pub fn split_last(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');

    match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

/// Returns the parent path of `path`: the final `/`-separated segment is
/// stripped, and an empty result or the bare root sigil collapses to the
/// canonical server root.
pub fn parent_path(path: &str) -> String {
    let (parent, _leaf) = split_last(path);

    if parent.is_empty() || parent == ROOT_SIGIL {
        SERVER_ROOT.into()
    } else {
        parent.into()
    }
}

/// True if `path` is the canonical server root (with or without the trailing
/// slash).
pub fn is_server_root(path: &str) -> bool {
    path == SERVER_ROOT || path == ROOT_SIGIL
}

/// Iterates the `/`-separated segments of `path`, skipping the root sigil.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.trim_end_matches('/')
        .split('/')
        .filter(|s| !s.is_empty() && *s != ROOT_SIGIL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_split_round_trip() {
        for (parent, segment) in [
            ("$/proj", "file.h"),
            ("$/proj/deep", "dir"),
            ("$", "proj"),
        ]
        .iter()
        {
            let joined = join(parent, segment);
            assert_eq!(split_last(&joined), (*parent, *segment));
        }

        // Trailing-slash normalization on the parent.
        assert_eq!(join("$/proj/", "x"), "$/proj/x");
        assert_eq!(split_last("$/proj/x/"), ("$/proj", "x"));
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("$/proj/a/b"), "$/proj/a");
        assert_eq!(parent_path("$/proj"), "$/");
        assert_eq!(parent_path("$/"), "$/");
        assert_eq!(parent_path("$"), "$/");
    }

    #[test]
    fn test_segments() {
        let have: Vec<&str> = segments("$/proj/a/b").collect();
        assert_eq!(have, vec!["proj", "a", "b"]);

        assert_eq!(segments("$/").count(), 0);
    }
}
