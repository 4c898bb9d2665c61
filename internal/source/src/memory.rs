//! An in-memory [`SourceControl`] implementation.
//!
//! Backs the workspace's test-suites and local development: items are kept
//! as `(created, deleted)` revision ranges so any changeset can be queried
//! as a point-in-time view, and reads can be delayed, gated on permits, or
//! failed per path to exercise the loader's back-pressure and error paths.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use svn_path::CasePolicy;
use tokio::sync::Semaphore;

use crate::{
    Changeset, Credentials, DeletedState, Error, ItemType, Recursion, SourceControl, SourceItem,
    SourceItemKind, VersionSpec,
};

#[derive(Debug, Clone)]
struct Record {
    item: SourceItem,
    created: i64,
    deleted: Option<i64>,
    content: Bytes,
}

#[derive(Debug, Default)]
struct Activity {
    comment: String,
    pending: HashMap<String, PendingItem>,
}

#[derive(Debug, Clone)]
struct PendingItem {
    kind: SourceItemKind,
    content: Option<Bytes>,
    properties: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    head: i64,
    records: Vec<Record>,
    changesets: BTreeMap<i64, Changeset>,
    previous: HashMap<(i64, String), SourceItem>,
    activities: HashMap<String, Activity>,
    fail_reads: HashSet<String>,
}

/// In-memory CVCS double. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemorySource {
    state: Arc<Mutex<State>>,
    read_delay: Arc<Mutex<Option<Duration>>>,
    read_permits: Arc<Mutex<Option<Arc<Semaphore>>>>,
    query_delay: Arc<Mutex<Option<Duration>>>,
    reads_started: Arc<AtomicUsize>,
    reads_completed: Arc<AtomicUsize>,
    item_queries: Arc<AtomicUsize>,
}

impl InMemorySource {
    /// Creates a source containing only the server root folder at
    /// revision 1.
    pub fn new() -> Self {
        let source = Self::default();
        source.add_folder(svn_path::SERVER_ROOT, 1);
        source
    }

    pub fn add_folder(&self, path: &str, revision: i64) {
        self.add_record(path, SourceItemKind::Folder, revision, Bytes::new());
    }

    pub fn add_file(&self, path: &str, revision: i64, content: impl Into<Bytes>) {
        self.add_record(path, SourceItemKind::File, revision, content.into());
    }

    /// Marks the live record for `path` (and, for folders, everything under
    /// it) as deleted at `revision`.
    pub fn delete_item(&self, path: &str, revision: i64) {
        let mut state = self.lock();
        state.head = state.head.max(revision);

        for record in state.records.iter_mut() {
            if record.deleted.is_none()
                && CasePolicy::Sensitive.is_ancestor_or_self(path, &record.item.remote_name)
            {
                record.deleted = Some(revision);
            }
        }
    }

    pub fn add_changeset(&self, changeset: Changeset) {
        let mut state = self.lock();
        state.head = state.head.max(changeset.id);
        state.changesets.insert(changeset.id, changeset);
    }

    /// Records the identity an item had before `revision`, as returned by
    /// [`SourceControl::get_previous_version_of_items`].
    pub fn set_previous_version(&self, revision: i64, path: &str, previous: SourceItem) {
        self.lock().previous.insert((revision, path.into()), previous);
    }

    /// Makes every subsequent read of `path` fail with an upstream error.
    pub fn fail_reads(&self, path: &str) {
        self.lock().fail_reads.insert(path.into());
    }

    /// Delays every read by `delay` before it completes.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    /// Gates every read on one permit from the returned semaphore. The
    /// semaphore starts empty; tests release reads one at a time with
    /// `add_permits`.
    pub fn gate_reads(&self) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.read_permits.lock().unwrap() = Some(semaphore.clone());
        semaphore
    }

    /// Delays every item query by `delay`. Lets tests hold a query open to
    /// observe concurrent callers.
    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = Some(delay);
    }

    pub fn reads_started(&self) -> usize {
        self.reads_started.load(Ordering::SeqCst)
    }

    /// Number of `query_items` calls that reached the double.
    pub fn item_queries(&self) -> usize {
        self.item_queries.load(Ordering::SeqCst)
    }

    pub fn reads_completed(&self) -> usize {
        self.reads_completed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<State> {
        // The state mutex is only held for in-memory map work; a poisoned
        // lock means a test already panicked.
        self.state.lock().unwrap()
    }

    fn add_record(&self, path: &str, kind: SourceItemKind, revision: i64, content: Bytes) {
        let mut state = self.lock();
        state.head = state.head.max(revision);

        // A new version of an existing path supersedes the live record.
        for record in state.records.iter_mut() {
            if record.deleted.is_none() && record.item.remote_name == path {
                record.deleted = Some(revision);
            }
        }

        state.next_id += 1;
        let item = SourceItem {
            id: state.next_id,
            remote_name: path.trim_end_matches('/').to_string(),
            kind,
            revision,
            size: content.len() as u64,
            last_modified: timestamp(revision),
            author: String::from("bridge-tests"),
            properties: HashMap::new(),
        };

        state.records.push(Record {
            item,
            created: revision,
            deleted: None,
            content,
        });
    }

    fn resolve(&self, version: VersionSpec) -> i64 {
        match version {
            VersionSpec::Latest => self.lock().head,
            VersionSpec::Changeset(revision) => revision,
        }
    }
}

/// The live record for each path at `revision`: the one with the greatest
/// `created` at or below the revision.
fn live_at(records: &[Record], revision: i64) -> Vec<&Record> {
    let mut latest: HashMap<&str, &Record> = HashMap::new();

    for record in records {
        if record.created > revision {
            continue;
        }

        let entry = latest.entry(record.item.remote_name.as_str()).or_insert(record);
        if record.created > entry.created {
            *entry = record;
        }
    }

    latest.into_iter().map(|(_path, record)| record).collect()
}

fn matches_scope(query_path: &str, item_path: &str, recursion: Recursion) -> bool {
    let policy = CasePolicy::Sensitive;
    let query_path = if svn_path::is_server_root(query_path) {
        svn_path::ROOT_SIGIL
    } else {
        query_path
    };

    match recursion {
        Recursion::None => policy.eq(query_path, item_path),
        Recursion::OneLevel => {
            policy.eq(query_path, item_path)
                || policy.eq(&svn_path::parent_path(item_path), &canonical(query_path))
        }
        Recursion::Full => policy.is_ancestor_or_self(query_path, item_path),
    }
}

fn canonical(path: &str) -> String {
    if path == svn_path::ROOT_SIGIL {
        svn_path::SERVER_ROOT.into()
    } else {
        path.into()
    }
}

fn timestamp(revision: i64) -> DateTime<Utc> {
    Utc.timestamp(1_600_000_000 + revision * 60, 0)
}

#[async_trait]
impl SourceControl for InMemorySource {
    async fn query_items(
        &self,
        _creds: &Credentials,
        path: &str,
        recursion: Recursion,
        version: VersionSpec,
        deleted: DeletedState,
        item_type: ItemType,
    ) -> Result<Vec<SourceItem>, Error> {
        self.item_queries.fetch_add(1, Ordering::SeqCst);

        let delay = *self.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let revision = self.resolve(version);
        let state = self.lock();

        let mut items: Vec<SourceItem> = live_at(&state.records, revision)
            .into_iter()
            .filter(|record| {
                matches_scope(path, &record.item.remote_name, recursion)
                    && match deleted {
                        DeletedState::NonDeleted => {
                            record.deleted.map_or(true, |d| revision < d)
                        }
                        DeletedState::Deleted => record.deleted.map_or(false, |d| d <= revision),
                        DeletedState::Any => true,
                    }
                    && match item_type {
                        ItemType::Any => true,
                        ItemType::File => record.item.kind == SourceItemKind::File,
                        ItemType::Folder => record.item.kind == SourceItemKind::Folder,
                    }
            })
            .map(|record| record.item.clone())
            .collect();

        items.sort_by(|a, b| a.remote_name.cmp(&b.remote_name));
        Ok(items)
    }

    async fn query_items_by_id(
        &self,
        _creds: &Credentials,
        ids: &[i64],
        revision: i64,
    ) -> Result<Vec<SourceItem>, Error> {
        let state = self.lock();

        Ok(live_at(&state.records, revision)
            .into_iter()
            .filter(|record| {
                ids.contains(&record.item.id) && record.deleted.map_or(true, |d| revision < d)
            })
            .map(|record| record.item.clone())
            .collect())
    }

    async fn get_previous_version_of_items(
        &self,
        _creds: &Credentials,
        items: &[SourceItem],
        revision: i64,
    ) -> Result<Vec<SourceItem>, Error> {
        let state = self.lock();

        items
            .iter()
            .map(|item| {
                if let Some(previous) = state.previous.get(&(revision, item.remote_name.clone())) {
                    return Ok(previous.clone());
                }

                state
                    .records
                    .iter()
                    .filter(|record| {
                        record.item.remote_name == item.remote_name && record.created < revision
                    })
                    .max_by_key(|record| record.created)
                    .map(|record| record.item.clone())
                    .ok_or_else(|| Error::NoPreviousVersion {
                        path: item.remote_name.clone(),
                        revision,
                    })
            })
            .collect()
    }

    async fn query_changesets(
        &self,
        _creds: &Credentials,
        path: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Changeset>, Error> {
        let state = self.lock();
        let policy = CasePolicy::Sensitive;

        Ok(state
            .changesets
            .range(from + 1..=to)
            .filter(|(_id, changeset)| {
                changeset.changes.iter().any(|change| {
                    policy.is_ancestor_or_self(path, &change.item.remote_name)
                })
            })
            .map(|(_id, changeset)| changeset.clone())
            .collect())
    }

    async fn read_file(&self, _creds: &Credentials, item: &SourceItem) -> Result<Bytes, Error> {
        self.reads_started.fetch_add(1, Ordering::SeqCst);

        let permits = self.read_permits.lock().unwrap().clone();
        if let Some(semaphore) = permits {
            let permit = semaphore
                .acquire()
                .await
                .map_err(|e| Error::Upstream(e.to_string()))?;
            permit.forget();
        }

        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if state.fail_reads.contains(&item.remote_name) {
            return Err(Error::Upstream(format!(
                "simulated read failure for {}",
                item.remote_name
            )));
        }

        let content = state
            .records
            .iter()
            .filter(|record| {
                record.item.remote_name == item.remote_name && record.created <= item.revision
            })
            .max_by_key(|record| record.created)
            .map(|record| record.content.clone())
            .ok_or_else(|| Error::NotFound {
                path: item.remote_name.clone(),
                revision: item.revision,
            })?;

        self.reads_completed.fetch_add(1, Ordering::SeqCst);
        Ok(content)
    }

    async fn write_file(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
        bytes: Bytes,
    ) -> Result<bool, Error> {
        let mut state = self.lock();
        let head = state.head;
        let existed = live_at(&state.records, head)
            .iter()
            .any(|record| record.deleted.is_none() && record.item.remote_name == path);

        let entry = state.activities.entry(activity.into()).or_default();
        let created = !existed && !entry.pending.contains_key(path);

        entry
            .pending
            .entry(path.into())
            .or_insert_with(|| PendingItem {
                kind: SourceItemKind::File,
                content: None,
                properties: HashMap::new(),
            })
            .content = Some(bytes);

        Ok(created)
    }

    async fn set_property(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
        name: &str,
        value: &str,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let entry = state.activities.entry(activity.into()).or_default();

        entry
            .pending
            .entry(path.into())
            .or_insert_with(|| PendingItem {
                kind: SourceItemKind::File,
                content: None,
                properties: HashMap::new(),
            })
            .properties
            .insert(name.into(), value.into());

        Ok(())
    }

    async fn remove_property(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
        name: &str,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let entry = state
            .activities
            .get_mut(activity)
            .ok_or_else(|| Error::NoActivity(activity.into()))?;

        if let Some(pending) = entry.pending.get_mut(path) {
            pending.properties.remove(name);
        }

        Ok(())
    }

    async fn set_activity_comment(
        &self,
        _creds: &Credentials,
        activity: &str,
        comment: &str,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        state.activities.entry(activity.into()).or_default().comment = comment.into();
        Ok(())
    }

    async fn make_collection(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let entry = state.activities.entry(activity.into()).or_default();

        entry.pending.insert(
            path.into(),
            PendingItem {
                kind: SourceItemKind::Folder,
                content: None,
                properties: HashMap::new(),
            },
        );

        Ok(())
    }

    async fn get_item_in_activity(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
    ) -> Result<Option<SourceItem>, Error> {
        {
            let state = self.lock();
            if let Some(entry) = state.activities.get(activity) {
                if let Some(pending) = entry.pending.get(path) {
                    let head = state.head;
                    return Ok(Some(SourceItem {
                        id: 0,
                        remote_name: path.into(),
                        kind: pending.kind,
                        revision: head,
                        size: pending.content.as_ref().map_or(0, |c| c.len() as u64),
                        last_modified: timestamp(head),
                        author: String::new(),
                        properties: pending.properties.clone(),
                    }));
                }
            }
        }

        let items = self
            .query_items(
                creds,
                path,
                Recursion::None,
                VersionSpec::Latest,
                DeletedState::NonDeleted,
                ItemType::Any,
            )
            .await?;

        Ok(items.into_iter().next())
    }
}
