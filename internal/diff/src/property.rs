//! Mapping of property-storage paths to their logical owners.
//!
//! The CVCS has no native DAV property support, so the bridge stores
//! property blobs as regular files under a reserved folder next to the
//! items they describe: `$/p/..svnbridge/foo` carries the properties of the
//! sibling file `$/p/foo`, and the member named after the sigil itself,
//! `$/p/..svnbridge/..svnbridge`, carries the properties of the folder
//! `$/p`. A change touching such a file is rewritten to apply to its owner.

/// The reserved property-folder name.
pub const PROPERTY_FOLDER: &str = "..svnbridge";

/// A changeset path resolved to the item it logically applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPath {
    /// The owner path: the input itself for ordinary items.
    pub path: String,

    /// True if the input was a property-storage path.
    pub is_property: bool,
}

/// Rewrites a raw changeset path to its logical owner.
pub fn map_property_path(path: &str) -> MappedPath {
    let (parent, leaf) = svn_path::split_last(path);
    let (grandparent, parent_leaf) = svn_path::split_last(parent);

    if parent_leaf == PROPERTY_FOLDER {
        let owner = if leaf == PROPERTY_FOLDER {
            grandparent.to_string()
        } else {
            svn_path::join(grandparent, leaf)
        };

        return MappedPath {
            path: owner,
            is_property: true,
        };
    }

    // The property folder itself: a change to the container applies to the
    // folder that owns it.
    if leaf == PROPERTY_FOLDER {
        return MappedPath {
            path: parent.to_string(),
            is_property: true,
        };
    }

    MappedPath {
        path: path.to_string(),
        is_property: false,
    }
}
