/// The server-wide case-sensitivity policy for path comparison.
///
/// Every path comparison in the bridge routes through this type so that the
/// policy genuinely is global: ad-hoc `==` on path strings is how
/// case-mismatch bugs between clients and the CVCS creep in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasePolicy {
    Sensitive,
    Insensitive,
}

/// The outcome of comparing two paths under a [`CasePolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathComparison {
    /// Byte-for-byte identical.
    Identical,

    /// Equal under the policy, but the precise case differs. Only reported
    /// under [`CasePolicy::Insensitive`].
    CaseMismatch,

    /// Not equal under the policy.
    Distinct,
}

impl CasePolicy {
    /// Compares two paths under the policy.
    pub fn compare(&self, a: &str, b: &str) -> PathComparison {
        if a == b {
            return PathComparison::Identical;
        }

        match self {
            CasePolicy::Sensitive => PathComparison::Distinct,
            CasePolicy::Insensitive => {
                if a.len() == b.len()
                    && a.chars()
                        .zip(b.chars())
                        .all(|(x, y)| x.to_lowercase().eq(y.to_lowercase()))
                {
                    PathComparison::CaseMismatch
                } else {
                    PathComparison::Distinct
                }
            }
        }
    }

    /// True if the paths are equal under the policy.
    pub fn eq(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) != PathComparison::Distinct
    }

    /// Returns the canonical map key form of a path under the policy.
    pub fn key(&self, path: &str) -> String {
        match self {
            CasePolicy::Sensitive => path.into(),
            CasePolicy::Insensitive => path.to_lowercase(),
        }
    }

    /// True if `ancestor` is `path` or a proper path-prefix of it on a
    /// segment boundary.
    pub fn is_ancestor_or_self(&self, ancestor: &str, path: &str) -> bool {
        let ancestor = ancestor.trim_end_matches('/');
        let path = path.trim_end_matches('/');

        if self.eq(ancestor, path) {
            return true;
        }

        if path.len() <= ancestor.len() + 1 {
            return false;
        }

        // Case-folded prefixes can only line up on a char boundary; a
        // mid-character split means the paths diverge anyway.
        match path.get(..ancestor.len()) {
            Some(prefix) => self.eq(ancestor, prefix) && path[ancestor.len()..].starts_with('/'),
            None => false,
        }
    }

    /// Strips `root` from the front of `path`, returning the remainder
    /// without a leading slash. `None` if `path` is outside `root`.
    pub fn sub_path<'a>(&self, path: &'a str, root: &str) -> Option<&'a str> {
        let root = root.trim_end_matches('/');
        let path = path.trim_end_matches('/');

        if !self.is_ancestor_or_self(root, path) {
            return None;
        }

        if path.len() == root.len() {
            Some("")
        } else {
            Some(&path[root.len() + 1..])
        }
    }
}
