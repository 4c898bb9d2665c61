//! The CVCS collaborator interface: the wire types the upstream server
//! speaks, and the [`SourceControl`] trait the rest of the bridge consumes.
//!
//! The bridge core never talks to the network itself; it is handed an
//! `Arc<dyn SourceControl>` at construction. [`memory::InMemorySource`]
//! implements the trait over an in-process item table and backs the
//! workspace's test-suites.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

mod error;
pub use self::error::Error;

pub mod memory;

/// The credential triple the transport layer surfaces for upstream calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: String,
}

/// Recursion mode for item queries, mapped from the DAV `Depth` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Recursion {
    #[display(fmt = "none")]
    None,

    #[display(fmt = "one-level")]
    OneLevel,

    #[display(fmt = "full")]
    Full,
}

/// Version selector for item queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSpec {
    Latest,
    Changeset(i64),
}

/// Whether deleted items are visible to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletedState {
    NonDeleted,
    Deleted,
    Any,
}

/// Item-kind filter for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Any,
    File,
    Folder,
}

/// The kind of a concrete item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SourceItemKind {
    #[display(fmt = "file")]
    File,

    #[display(fmt = "folder")]
    Folder,
}

/// A single item as reported by the CVCS.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItem {
    pub id: i64,

    /// Server path, `$`-sigil rooted.
    pub remote_name: String,

    pub kind: SourceItemKind,

    /// The changeset that last touched this item.
    pub revision: i64,

    /// Content size in bytes; zero for folders.
    pub size: u64,

    pub last_modified: DateTime<Utc>,
    pub author: String,
    pub properties: HashMap<String, String>,
}

bitflags::bitflags! {
    /// The change-type set attached to a changeset entry. The CVCS reports
    /// combinations (a renamed-and-edited file carries RENAME | EDIT).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChangeFlags: u32 {
        const ADD = 1;
        const EDIT = 1 << 1;
        const DELETE = 1 << 2;
        const RENAME = 1 << 3;
        const MERGE = 1 << 4;
        const BRANCH = 1 << 5;
    }
}

/// A CVCS-origin change record: one item touched by one changeset.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItemChange {
    pub item: SourceItem,
    pub flags: ChangeFlags,
}

/// A numbered, atomic, server-wide version of the repository state.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub id: i64,
    pub author: String,
    pub comment: String,
    pub date: DateTime<Utc>,
    pub changes: Vec<SourceItemChange>,
}

/// The operations the bridge core needs from the upstream CVCS.
///
/// The begin/end pair the native download primitive exposes is collapsed
/// into the single async [`read_file`](SourceControl::read_file): the
/// response is buffered in full upstream either way, so there is nothing to
/// stream through.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn query_items(
        &self,
        creds: &Credentials,
        path: &str,
        recursion: Recursion,
        version: VersionSpec,
        deleted: DeletedState,
        item_type: ItemType,
    ) -> Result<Vec<SourceItem>, Error>;

    async fn query_items_by_id(
        &self,
        creds: &Credentials,
        ids: &[i64],
        revision: i64,
    ) -> Result<Vec<SourceItem>, Error>;

    /// Returns, for each input item, its identity in the version preceding
    /// `revision`. The primary consumer is rename handling, which needs the
    /// old name of a renamed item.
    async fn get_previous_version_of_items(
        &self,
        creds: &Credentials,
        items: &[SourceItem],
        revision: i64,
    ) -> Result<Vec<SourceItem>, Error>;

    /// Returns the changesets that touched `path` in `(from, to]`, ordered
    /// ascending by changeset id.
    async fn query_changesets(
        &self,
        creds: &Credentials,
        path: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Changeset>, Error>;

    async fn read_file(&self, creds: &Credentials, item: &SourceItem) -> Result<Bytes, Error>;

    /// Writes file content into an activity. Returns true if the path was
    /// created rather than overwritten.
    async fn write_file(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
        bytes: Bytes,
    ) -> Result<bool, Error>;

    async fn set_property(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
        name: &str,
        value: &str,
    ) -> Result<(), Error>;

    async fn remove_property(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
        name: &str,
    ) -> Result<(), Error>;

    async fn set_activity_comment(
        &self,
        creds: &Credentials,
        activity: &str,
        comment: &str,
    ) -> Result<(), Error>;

    async fn make_collection(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
    ) -> Result<(), Error>;

    /// Looks a path up in the pending state of an activity, falling back to
    /// the committed head version.
    async fn get_item_in_activity(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
    ) -> Result<Option<SourceItem>, Error>;
}
