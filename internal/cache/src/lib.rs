//! The metadata repository cache: memoized, single-flight listings of CVCS
//! items at a given revision.
//!
//! Changeset replay touches the same `(revision, directory)` pair from many
//! code paths, so a miss triggers one full-depth upstream query whose
//! results are fanned out into every listing a narrower later query could
//! ask for. Known-absent parents get negative entries so a deleted subtree
//! does not turn into a quadratic stream of upstream lookups.
//!
//! Population is single-flight per `(revision, path)`: the first caller
//! inserts a pending cell and performs the upstream call, concurrent
//! callers await that same cell. Upstream I/O happens outside the cache
//! lock, so readers of already-populated keys never block behind a
//! populator.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use svn_bridge_source::{
    Credentials, DeletedState, ItemType, Recursion, SourceControl, SourceItem, SourceItemKind,
    VersionSpec,
};
use svn_path::CasePolicy;
use tokio::sync::{Mutex, OnceCell, RwLock};

mod error;
pub use self::error::Error;

/// The full identity of one cached listing.
///
/// `server_url` and `user` scope the cache to one upstream and one identity;
/// a bridge fronting several upstreams constructs one cache per pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub server_url: String,
    pub user: String,
    pub revision: i64,
    pub path: String,
    pub recursion: Recursion,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListingKey {
    revision: i64,
    path: String,
    recursion: Recursion,
}

type PathKey = (i64, String);

#[derive(Default)]
struct Inner {
    /// Canonical `(revision, path) → item` entries. Immutable once written;
    /// invalidation is whole-cache [`MetadataCache::clear`] only.
    canonical: HashMap<PathKey, Arc<SourceItem>>,

    /// Listing fan-out: each entry holds the canonical keys of its members.
    listings: HashMap<ListingKey, Vec<PathKey>>,

    /// `(revision, id) → item`, fed by the same population pass.
    by_id: HashMap<(i64, i64), Arc<SourceItem>>,

    /// Parents known to be absent at a revision.
    negative: HashSet<PathKey>,

    /// Paths a population pass was rooted at, for [`MetadataCache::is_cached`].
    populated: HashSet<PathKey>,
}

/// Process-wide metadata cache for one `(server, user)` pair.
pub struct MetadataCache {
    server_url: String,
    user: String,
    policy: CasePolicy,
    creds: Credentials,
    source: Arc<dyn SourceControl>,
    inner: RwLock<Inner>,
    flights: Mutex<HashMap<PathKey, Arc<OnceCell<()>>>>,
}

impl MetadataCache {
    pub fn new(
        server_url: impl Into<String>,
        creds: Credentials,
        policy: CasePolicy,
        source: Arc<dyn SourceControl>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            user: creds.username.clone(),
            policy,
            creds,
            source,
            inner: RwLock::new(Inner::default()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// The items at `path` for the given revision and recursion mode,
    /// sorted ascending by full path.
    pub async fn query_items(
        &self,
        revision: i64,
        path: &str,
        recursion: Recursion,
    ) -> Result<Vec<Arc<SourceItem>>, Error> {
        // The root listing is too large and too frequently needed in narrow
        // form to benefit from full-depth caching.
        if recursion == Recursion::None && svn_path::is_server_root(path) {
            log::trace!("{}: root listing bypasses the cache", self.server_url);
            return Ok(self
                .source
                .query_items(
                    &self.creds,
                    path,
                    Recursion::None,
                    VersionSpec::Changeset(revision),
                    DeletedState::NonDeleted,
                    ItemType::Any,
                )
                .await?
                .into_iter()
                .map(Arc::new)
                .collect());
        }

        let key = self.path_key(revision, path);

        {
            let inner = self.inner.read().await;
            if let Some(items) = self.read_listing(&inner, &key, recursion) {
                return Ok(items);
            }
            if self.is_negative(&inner, &key) {
                return Ok(Vec::new());
            }
        }

        self.ensure_populated(revision, path).await?;

        let inner = self.inner.read().await;
        Ok(self.read_listing(&inner, &key, recursion).unwrap_or_default())
    }

    /// Array variant: the union of per-path queries.
    pub async fn query_items_many(
        &self,
        revision: i64,
        paths: &[&str],
        recursion: Recursion,
    ) -> Result<Vec<Arc<SourceItem>>, Error> {
        let mut out: Vec<Arc<SourceItem>> = Vec::new();

        for path in paths {
            for item in self.query_items(revision, path, recursion).await? {
                if !out
                    .iter()
                    .any(|present| self.policy.eq(&present.remote_name, &item.remote_name))
                {
                    out.push(item);
                }
            }
        }

        out.sort_by(|a, b| a.remote_name.cmp(&b.remote_name));
        Ok(out)
    }

    /// Items by CVCS id at a revision; ids already seen by a population pass
    /// are served locally, the rest go upstream in one batch.
    pub async fn query_items_by_id(
        &self,
        revision: i64,
        ids: &[i64],
    ) -> Result<Vec<Arc<SourceItem>>, Error> {
        let mut found: HashMap<i64, Arc<SourceItem>> = HashMap::new();
        let mut misses = Vec::new();

        {
            let inner = self.inner.read().await;
            for id in ids {
                match inner.by_id.get(&(revision, *id)) {
                    Some(item) => {
                        found.insert(*id, item.clone());
                    }
                    None => misses.push(*id),
                }
            }
        }

        if !misses.is_empty() {
            let fetched = self
                .source
                .query_items_by_id(&self.creds, &misses, revision)
                .await?;

            let mut inner = self.inner.write().await;
            for item in fetched {
                let item = Arc::new(item);
                inner.by_id.insert((revision, item.id), item.clone());
                found.insert(item.id, item);
            }
        }

        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// True if `path` or any of its ancestors has been populated at
    /// `revision`.
    pub async fn is_cached(&self, revision: i64, path: &str) -> bool {
        let inner = self.inner.read().await;
        let mut current = self.norm(path);

        loop {
            if inner
                .populated
                .contains(&(revision, self.policy.key(&self.norm(&current))))
            {
                return true;
            }
            if svn_path::is_server_root(&current) {
                return false;
            }
            current = svn_path::parent_path(&current);
        }
    }

    /// Drops every entry.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
        self.flights.lock().await.clear();
        log::trace!("{}: metadata cache cleared", self.server_url);
    }

    /// The canonical key of one listing this cache would serve.
    pub fn cache_key(&self, revision: i64, path: &str, recursion: Recursion) -> CacheKey {
        CacheKey {
            server_url: self.server_url.clone(),
            user: self.user.clone(),
            revision,
            path: self.norm(path),
            recursion,
        }
    }

    fn norm(&self, path: &str) -> String {
        if svn_path::is_server_root(path) {
            svn_path::ROOT_SIGIL.into()
        } else {
            path.trim_end_matches('/').into()
        }
    }

    fn path_key(&self, revision: i64, path: &str) -> PathKey {
        (revision, self.policy.key(&self.norm(path)))
    }

    fn listing_key(&self, revision: i64, path: &str, recursion: Recursion) -> ListingKey {
        ListingKey {
            revision,
            path: self.policy.key(&self.norm(path)),
            recursion,
        }
    }

    fn read_listing(
        &self,
        inner: &Inner,
        key: &PathKey,
        recursion: Recursion,
    ) -> Option<Vec<Arc<SourceItem>>> {
        let listing = inner.listings.get(&ListingKey {
            revision: key.0,
            path: key.1.clone(),
            recursion,
        })?;

        let mut items: Vec<Arc<SourceItem>> = listing
            .iter()
            .filter_map(|member| inner.canonical.get(member).cloned())
            .collect();
        items.sort_by(|a, b| a.remote_name.cmp(&b.remote_name));
        Some(items)
    }

    /// True if the path or any ancestor carries a negative entry.
    fn is_negative(&self, inner: &Inner, key: &PathKey) -> bool {
        let mut current = key.1.clone();

        loop {
            if inner
                .negative
                .contains(&(key.0, self.policy.key(&self.norm(&current))))
            {
                return true;
            }
            if svn_path::is_server_root(&current) {
                return false;
            }
            current = svn_path::parent_path(&current);
        }
    }

    /// Single-flight population for `(revision, path)`.
    async fn ensure_populated(&self, revision: i64, path: &str) -> Result<(), Error> {
        let key = self.path_key(revision, path);

        let cell = {
            let mut flights = self.flights.lock().await;
            flights.entry(key).or_insert_with(Default::default).clone()
        };

        cell.get_or_try_init(|| self.populate(revision, path))
            .await?;
        Ok(())
    }

    async fn populate(&self, revision: i64, path: &str) -> Result<(), Error> {
        log::trace!(
            "{}: populating rev {} at {}",
            self.server_url,
            revision,
            path
        );

        let mut root = self.norm(path);
        let mut items = self
            .source
            .query_items(
                &self.creds,
                &root,
                Recursion::Full,
                VersionSpec::Changeset(revision),
                DeletedState::NonDeleted,
                ItemType::Any,
            )
            .await?;

        // A single-file result means the caller named a file: the useful
        // unit of caching is the file's directory, so requery one level up.
        if items.len() == 1 && items[0].kind == SourceItemKind::File {
            root = svn_path::parent_path(&root);
            items = self
                .source
                .query_items(
                    &self.creds,
                    &root,
                    Recursion::Full,
                    VersionSpec::Changeset(revision),
                    DeletedState::NonDeleted,
                    ItemType::Any,
                )
                .await?;
        }

        if items.is_empty() {
            let parent = svn_path::parent_path(&root);
            let parent_items = self
                .source
                .query_items(
                    &self.creds,
                    &parent,
                    Recursion::None,
                    VersionSpec::Changeset(revision),
                    DeletedState::NonDeleted,
                    ItemType::Any,
                )
                .await?;

            let mut inner = self.inner.write().await;
            if parent_items.is_empty() {
                log::trace!(
                    "{}: negative entry for {} at rev {}",
                    self.server_url,
                    parent,
                    revision
                );
                inner
                    .negative
                    .insert((revision, self.policy.key(&self.norm(&parent))));
            }
            inner
                .negative
                .insert((revision, self.policy.key(&self.norm(&root))));
            return Ok(());
        }

        let mut inner = self.inner.write().await;

        for item in items {
            let item = Arc::new(item);
            let member = (revision, self.policy.key(&self.norm(&item.remote_name)));

            inner.by_id.insert((revision, item.id), item.clone());
            inner.canonical.insert(member.clone(), item.clone());

            // Own-path listings in all three modes.
            for recursion in [Recursion::None, Recursion::OneLevel, Recursion::Full].iter() {
                push_member(
                    &mut inner.listings,
                    self.listing_key(revision, &item.remote_name, *recursion),
                    &member,
                );
            }

            // Parent sees the item at one level and at full depth; every
            // ancestor above the parent sees it at full depth only. This
            // fan-out is what lets later narrow queries skip the network.
            let parent = svn_path::parent_path(&item.remote_name);
            push_member(
                &mut inner.listings,
                self.listing_key(revision, &parent, Recursion::OneLevel),
                &member,
            );

            let mut ancestor = parent;
            loop {
                push_member(
                    &mut inner.listings,
                    self.listing_key(revision, &ancestor, Recursion::Full),
                    &member,
                );
                if svn_path::is_server_root(&ancestor) {
                    break;
                }
                ancestor = svn_path::parent_path(&ancestor);
            }
        }

        inner
            .populated
            .insert((revision, self.policy.key(&self.norm(&root))));
        Ok(())
    }
}

fn push_member(
    listings: &mut HashMap<ListingKey, Vec<PathKey>>,
    key: ListingKey,
    member: &PathKey,
) {
    let listing = listings.entry(key).or_insert_with(Vec::new);
    if !listing.contains(member) {
        listing.push(member.clone());
    }
}
