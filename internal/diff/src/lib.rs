//! The update diff engine: replays an ordered sequence of CVCS changeset
//! records against the client's reported state, mutating a tree of DAV
//! operations that brings the client to the target revision.
//!
//! Changes are applied strictly in the caller-supplied order; the order is
//! significant (deletes precede adds in renames, changesets are monotone).
//! The engine never takes shortcuts by omitting steps: every path element
//! it visits gets a recorded state in the tree, because a later change must
//! be able to cancel an earlier one. Intermediate elements it has made no
//! decision about yet are held as stub folders; a stub is resolved to the
//! real folder, or converted to a delete, before the tree is handed off.
//!
//! The engine produces no output itself. Handlers serialize the finished
//! tree.

use std::{mem, sync::Arc};

use svn_bridge_cache::MetadataCache;
use svn_bridge_model::{FolderNode, ItemMeta, Node};
use svn_bridge_source::{
    ChangeFlags, Changeset, Credentials, Recursion, SourceControl, SourceItem, SourceItemChange,
    SourceItemKind,
};
use svn_path::CasePolicy;

mod error;
pub use self::error::Error;

mod property;
pub use self::property::{map_property_path, MappedPath, PROPERTY_FOLDER};

mod state;
pub use self::state::ClientState;

pub struct UpdateDiffEngine {
    root: FolderNode,
    checkout_root: String,
    target_revision: i64,
    client: ClientState,
    policy: CasePolicy,
    creds: Credentials,
    cache: Arc<MetadataCache>,
    source: Arc<dyn SourceControl>,

    /// Folder renames seen during replay, as `(delete side, add side)`;
    /// drives the finalize post-pass for child deletes.
    folder_renames: Vec<(String, String)>,
}

impl UpdateDiffEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: FolderNode,
        checkout_root: impl Into<String>,
        target_revision: i64,
        client: ClientState,
        creds: Credentials,
        policy: CasePolicy,
        cache: Arc<MetadataCache>,
        source: Arc<dyn SourceControl>,
    ) -> Self {
        Self {
            root,
            checkout_root: checkout_root.into().trim_end_matches('/').to_string(),
            target_revision,
            client,
            policy,
            creds,
            cache,
            source,
            folder_renames: Vec::new(),
        }
    }

    /// The tree as accumulated so far.
    pub fn root(&self) -> &FolderNode {
        &self.root
    }

    /// Applies one change, dispatching on its flag set.
    pub async fn apply_change(
        &mut self,
        change: &SourceItemChange,
        forward: bool,
    ) -> Result<(), Error> {
        if change.flags.contains(ChangeFlags::RENAME) {
            self.apply_rename(change, forward).await
        } else if change.flags.contains(ChangeFlags::DELETE) {
            self.apply_delete(change).await
        } else if change.flags.contains(ChangeFlags::EDIT) {
            self.apply_edit(change).await
        } else {
            self.apply_add(change, forward).await
        }
    }

    /// Replays whole changesets. `changesets` arrives oldest first; a
    /// backward replay walks both the changesets and the changes within
    /// each one in reverse.
    pub async fn replay(&mut self, changesets: &[Changeset], forward: bool) -> Result<(), Error> {
        if forward {
            for changeset in changesets {
                for change in &changeset.changes {
                    self.apply_change(change, true).await?;
                }
            }
        } else {
            for changeset in changesets.iter().rev() {
                for change in changeset.changes.iter().rev() {
                    self.apply_change(change, false).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn apply_add(
        &mut self,
        change: &SourceItemChange,
        forward: bool,
    ) -> Result<(), Error> {
        self.walk_add(&change.item.remote_name, change.item.revision, false, forward, false)
            .await
    }

    pub async fn apply_edit(&mut self, change: &SourceItemChange) -> Result<(), Error> {
        self.walk_add(&change.item.remote_name, change.item.revision, true, true, false)
            .await
    }

    pub async fn apply_delete(&mut self, change: &SourceItemChange) -> Result<(), Error> {
        let mapped = property::map_property_path(&change.item.remote_name);
        if mapped.is_property {
            // Removing a property blob is a property edit on its owner;
            // property changes never delete paths.
            return self
                .walk_add(&change.item.remote_name, change.item.revision, true, true, false)
                .await;
        }

        let path = mapped.path;
        if self.policy.eq(&path, &self.checkout_root) {
            return Ok(());
        }

        let rel = match self.policy.sub_path(&path, &self.checkout_root) {
            Some(rel) if !rel.is_empty() => rel.to_string(),
            _ => {
                log::trace!("delete of {} falls outside {}", path, self.checkout_root);
                return Ok(());
            }
        };

        if self.client.is_marked_missing(&path) {
            log::trace!("suppressing delete of {}: client already marks it absent", path);
            self.prune_missing_marker(&rel);
            return Ok(());
        }

        let segments: Vec<String> = rel.split('/').map(String::from).collect();
        let mut trail: Vec<usize> = Vec::new();
        let mut item_path = self.checkout_root.clone();

        for (depth, segment) in segments.iter().enumerate() {
            let last = depth + 1 == segments.len();
            item_path = svn_path::join(&item_path, segment);

            let existing = folder_at(&self.root, &trail).position_of(self.policy, &item_path);

            if last {
                return self.reconcile_delete(&trail, existing, &item_path, change);
            }

            match existing {
                Some(idx) => {
                    let entry = &folder_at(&self.root, &trail).children[idx];
                    if entry.is_delete() {
                        // The subtree is already tombstoned.
                        return Ok(());
                    }
                    if entry.as_folder().is_none() {
                        return Ok(());
                    }
                    trail.push(idx);
                }
                None => {
                    // Materialize a container for the deeper tombstone,
                    // preferring the real folder at the target revision.
                    let fetched = self.fetch_single(&item_path).await?;
                    let inner = match fetched {
                        Some(item) if item.kind == SourceItemKind::Folder => {
                            FolderNode::from_source(&item)
                        }
                        _ => FolderNode::new(ItemMeta::synthetic(
                            &item_path,
                            change.item.revision,
                        )),
                    };

                    let folder = folder_at_mut(&mut self.root, &trail);
                    folder.attach(Node::StubFolder(Box::new(inner)));
                    let idx = folder.children.len() - 1;
                    trail.push(idx);
                }
            }
        }

        Ok(())
    }

    pub async fn apply_rename(
        &mut self,
        change: &SourceItemChange,
        forward: bool,
    ) -> Result<(), Error> {
        let previous = self
            .source
            .get_previous_version_of_items(
                &self.creds,
                std::slice::from_ref(&change.item),
                change.item.revision,
            )
            .await?;
        let previous = previous.into_iter().next().ok_or_else(|| Error::NoPreviousVersion {
            path: change.item.remote_name.clone(),
            revision: change.item.revision,
        })?;

        let (delete_path, add_path) = if forward {
            (previous.remote_name, change.item.remote_name.clone())
        } else {
            (change.item.remote_name.clone(), previous.remote_name)
        };

        // Fixed order: delete, then add, in both replay directions; clients
        // rely on the delete preceding the add in diff output. A side that
        // falls outside the checkout root names a path this client never
        // sees, so it is suppressed.
        if self.in_scope(&delete_path) {
            let mut item = change.item.clone();
            item.remote_name = delete_path.clone();
            self.apply_delete(&SourceItemChange {
                item,
                flags: ChangeFlags::DELETE,
            })
            .await?;
        } else {
            log::trace!(
                "suppressing rename delete of {}: outside {}",
                delete_path,
                self.checkout_root
            );
        }

        if self.in_scope(&add_path) {
            self.walk_add(&add_path, change.item.revision, false, forward, true)
                .await?;
        } else {
            log::trace!(
                "suppressing rename add of {}: outside {}",
                add_path,
                self.checkout_root
            );
        }

        if change.item.kind == SourceItemKind::Folder {
            self.folder_renames.push((delete_path, add_path));
        }

        Ok(())
    }

    /// Runs the folder-rename post-pass, resolves remaining stubs, and
    /// hands the tree off.
    pub async fn finalize(mut self) -> Result<FolderNode, Error> {
        let renames = mem::take(&mut self.folder_renames);

        for (old_name, new_name) in renames {
            if !self.in_scope(&old_name) {
                continue;
            }

            // Children the renamed folder carried along may still exist
            // under the old name in the client's working copy.
            let members = self
                .cache
                .query_items(self.target_revision, &new_name, Recursion::Full)
                .await?;

            for member in members {
                let sub = match self.policy.sub_path(&member.remote_name, &new_name) {
                    Some(sub) if !sub.is_empty() => sub.to_string(),
                    _ => continue,
                };
                let old_child = svn_path::join(&old_name, &sub);
                if !self.client.has_any_version(&old_child) {
                    continue;
                }

                let mut item = (*member).clone();
                item.remote_name = old_child;
                self.apply_delete(&SourceItemChange {
                    item,
                    flags: ChangeFlags::DELETE,
                })
                .await?;
            }
        }

        resolve_stubs(&mut self.root);
        Ok(self.root)
    }

    fn in_scope(&self, path: &str) -> bool {
        self.policy.is_ancestor_or_self(&self.checkout_root, path)
    }

    async fn fetch_single(&self, path: &str) -> Result<Option<Arc<SourceItem>>, Error> {
        let items = self
            .cache
            .query_items(self.target_revision, path, Recursion::None)
            .await?;
        Ok(items.into_iter().next())
    }

    /// The add/edit path walk. `raw_path` is the change's remote path,
    /// before property mapping; `rename_add` marks the add side of a
    /// rename, which appends alongside a tombstone instead of resurrecting.
    async fn walk_add(
        &mut self,
        raw_path: &str,
        change_revision: i64,
        edit: bool,
        forward: bool,
        rename_add: bool,
    ) -> Result<(), Error> {
        let mapped = property::map_property_path(raw_path);
        let path = mapped.path;
        let property_only = mapped.is_property;

        if self.policy.eq(&path, &self.checkout_root) {
            if property_only {
                let meta = &mut self.root.meta;
                meta.property_revision = meta.property_revision.max(change_revision);
            }
            return Ok(());
        }

        let rel = match self.policy.sub_path(&path, &self.checkout_root) {
            Some(rel) if !rel.is_empty() => rel.to_string(),
            _ => {
                log::trace!("add of {} falls outside {}", path, self.checkout_root);
                return Ok(());
            }
        };

        if self.client.has_at_or_above(&path, change_revision) {
            log::trace!(
                "suppressing add of {}: client already at or past rev {}",
                path,
                change_revision
            );
            return Ok(());
        }

        let segments: Vec<String> = rel.split('/').map(String::from).collect();
        let mut trail: Vec<usize> = Vec::new();
        let mut item_path = self.checkout_root.clone();

        for (depth, segment) in segments.iter().enumerate() {
            let last = depth + 1 == segments.len();
            item_path = svn_path::join(&item_path, segment);

            let existing = folder_at(&self.root, &trail).position_of(self.policy, &item_path);

            match existing {
                None => {
                    let fetched = self.fetch_single(&item_path).await?;
                    let idx = {
                        let folder = folder_at_mut(&mut self.root, &trail);
                        let node = match fetched {
                            Some(item) if last => {
                                let mut node = Node::from_source((*item).clone());
                                decorate(node.meta_mut(), change_revision, property_only);
                                node
                            }
                            Some(item) => match item.kind {
                                SourceItemKind::Folder => Node::StubFolder(Box::new(
                                    FolderNode::from_source(&item),
                                )),
                                // A file in an intermediate position only
                                // happens on broken history; hold the step
                                // as a bare stub.
                                SourceItemKind::File => Node::StubFolder(Box::new(
                                    FolderNode::new(ItemMeta::synthetic(
                                        &item_path,
                                        change_revision,
                                    )),
                                )),
                            },
                            None if last => Node::Missing {
                                meta: ItemMeta::synthetic(&item_path, change_revision),
                                edit,
                            },
                            // An intermediate the target cannot materialize
                            // still gets a recorded step, so a later delete
                            // can cancel this one.
                            None => Node::DeleteFolder {
                                meta: ItemMeta::synthetic(&item_path, change_revision),
                            },
                        };

                        folder.attach(node);
                        folder.children.len() - 1
                    };

                    if last {
                        return Ok(());
                    }
                    if folder_at_mut(&mut self.root, &trail).children[idx]
                        .as_folder_mut()
                        .is_none()
                    {
                        return Ok(());
                    }
                    trail.push(idx);
                }
                Some(idx) => {
                    if last {
                        return self
                            .reconcile_add(
                                &trail,
                                idx,
                                &item_path,
                                change_revision,
                                edit,
                                forward,
                                rename_add,
                                property_only,
                            )
                            .await;
                    }

                    let is_delete = folder_at(&self.root, &trail).children[idx].is_delete();
                    if is_delete {
                        // A change below a tombstoned folder resurrects it.
                        let fetched = self.fetch_single(&item_path).await?;
                        let mut resurrected = match fetched {
                            Some(item) if item.kind == SourceItemKind::Folder => {
                                FolderNode::from_source(&item)
                            }
                            _ => FolderNode::new(ItemMeta::synthetic(
                                &item_path,
                                change_revision,
                            )),
                        };
                        resurrected.meta.originally_deleted = true;

                        folder_at_mut(&mut self.root, &trail)
                            .replace_child(idx, Node::Folder(resurrected));
                        trail.push(idx);
                    } else if folder_at(&self.root, &trail).children[idx]
                        .as_folder()
                        .is_some()
                    {
                        trail.push(idx);
                    } else {
                        // A file where a folder is needed: nothing deeper
                        // can attach.
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    /// Reconciles the final walk segment against an existing tree entry.
    #[allow(clippy::too_many_arguments)]
    async fn reconcile_add(
        &mut self,
        trail: &[usize],
        idx: usize,
        item_path: &str,
        change_revision: i64,
        edit: bool,
        forward: bool,
        rename_add: bool,
        property_only: bool,
    ) -> Result<(), Error> {
        enum Plan {
            Leave,
            UnwrapStub,
            Alongside,
            Resurrect,
            PromoteMissing,
            Replace,
        }

        let plan = {
            let entry = &folder_at(&self.root, trail).children[idx];
            if entry.is_delete() {
                if property_only {
                    // A property change never adds a path, so it cannot
                    // resurrect a tombstone; the delete gives way to a
                    // missing marker instead.
                    Plan::PromoteMissing
                } else if rename_add {
                    // Rename onto a tombstoned path: the delete stays and
                    // the add lands beside it (rename-with-history).
                    Plan::Alongside
                } else {
                    Plan::Resurrect
                }
            } else if entry.is_stub() {
                Plan::UnwrapStub
            } else if matches!(entry, Node::Missing { .. }) {
                Plan::Replace
            } else {
                let entry_revision = entry.revision();
                let outdated = if forward {
                    entry_revision < change_revision
                } else {
                    entry_revision > change_revision
                };
                if outdated {
                    Plan::Replace
                } else {
                    Plan::Leave
                }
            }
        };

        match plan {
            Plan::Leave => {
                if property_only {
                    let entry = &mut folder_at_mut(&mut self.root, trail).children[idx];
                    let meta = entry.meta_mut();
                    meta.property_revision = meta.property_revision.max(change_revision);
                }
            }
            Plan::UnwrapStub => {
                let entry = &mut folder_at_mut(&mut self.root, trail).children[idx];
                entry.unwrap_stub();
                decorate(entry.meta_mut(), change_revision, property_only);
            }
            Plan::Alongside => {
                if let Some(item) = self.fetch_single(item_path).await? {
                    let mut node = Node::from_source((*item).clone());
                    decorate(node.meta_mut(), change_revision, property_only);
                    folder_at_mut(&mut self.root, trail).attach(node);
                }
            }
            Plan::Resurrect => {
                if let Some(item) = self.fetch_single(item_path).await? {
                    let mut node = Node::from_source((*item).clone());
                    node.meta_mut().originally_deleted = true;
                    decorate(node.meta_mut(), change_revision, property_only);
                    folder_at_mut(&mut self.root, trail).replace_child(idx, node);
                }
                // Still absent at the target: the tombstone stands.
            }
            Plan::PromoteMissing => {
                folder_at_mut(&mut self.root, trail).replace_child(
                    idx,
                    Node::Missing {
                        meta: ItemMeta::synthetic(item_path, change_revision),
                        edit: false,
                    },
                );
            }
            Plan::Replace => {
                match self.fetch_single(item_path).await? {
                    Some(item) => {
                        let mut node = Node::from_source((*item).clone());
                        decorate(node.meta_mut(), change_revision, property_only);

                        let folder = folder_at_mut(&mut self.root, trail);
                        let old = folder.replace_child(idx, node);

                        // A replaced folder keeps the children accumulated
                        // under it earlier in the replay.
                        if let Node::Folder(old_folder) = old {
                            if let Some(new_folder) = folder.children[idx].as_folder_mut() {
                                new_folder.children = old_folder.children;
                            }
                        }
                    }
                    None => {
                        // The path still cannot be materialized; keep the
                        // missing marker current instead.
                        let entry = &mut folder_at_mut(&mut self.root, trail).children[idx];
                        if let Node::Missing {
                            meta,
                            edit: marker_edit,
                        } = entry
                        {
                            meta.item_revision = meta.item_revision.max(change_revision);
                            *marker_edit = *marker_edit || edit;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Applies the delete case table to the final walk segment.
    fn reconcile_delete(
        &mut self,
        trail: &[usize],
        existing: Option<usize>,
        item_path: &str,
        change: &SourceItemChange,
    ) -> Result<(), Error> {
        let revision = change.item.revision;

        let idx = match existing {
            None => {
                // No prior step for this path. A client that never reported
                // the path has nothing to remove; a tombstone would be an
                // orphan delete.
                if !self.client.has_any_version(item_path) {
                    log::trace!("suppressing orphan delete of {}", item_path);
                    return Ok(());
                }

                let node = tombstone_for(change.item.kind, item_path, revision);
                folder_at_mut(&mut self.root, trail).attach(node);
                return Ok(());
            }
            Some(idx) => idx,
        };

        enum Plan {
            Stop,
            Tombstone(SourceItemKind),
            Unlink,
        }

        let plan = {
            let entry = &folder_at(&self.root, trail).children[idx];
            match entry {
                entry if entry.is_delete() => Plan::Stop,
                Node::StubFolder(_) => Plan::Tombstone(SourceItemKind::Folder),
                Node::Missing { edit: true, .. } => Plan::Tombstone(change.item.kind),
                Node::Missing { edit: false, .. } => Plan::Unlink,
                Node::Folder(_) if entry.meta().originally_deleted => {
                    Plan::Tombstone(SourceItemKind::Folder)
                }
                Node::File(_) if entry.meta().originally_deleted => {
                    Plan::Tombstone(SourceItemKind::File)
                }
                Node::Folder(_) if entry.meta().property_change_only => {
                    Plan::Tombstone(SourceItemKind::Folder)
                }
                Node::File(_) if entry.meta().property_change_only => {
                    Plan::Tombstone(SourceItemKind::File)
                }
                // A plain add the client has not yet seen: unlinking it is
                // the whole diff.
                _ => Plan::Unlink,
            }
        };

        let folder = folder_at_mut(&mut self.root, trail);
        match plan {
            Plan::Stop => {}
            Plan::Tombstone(kind) => {
                folder.replace_child(idx, tombstone_for(kind, item_path, revision));
            }
            Plan::Unlink => {
                folder.remove_child(idx);
            }
        }

        Ok(())
    }

    /// Removes a `Missing` marker for `rel` (checkout-relative), if one is
    /// in the tree. Runs when a delete is suppressed by the client's
    /// missing map.
    fn prune_missing_marker(&mut self, rel: &str) {
        let segments: Vec<String> = rel.split('/').map(String::from).collect();
        let mut trail: Vec<usize> = Vec::new();
        let mut item_path = self.checkout_root.clone();

        for (depth, segment) in segments.iter().enumerate() {
            let last = depth + 1 == segments.len();
            item_path = svn_path::join(&item_path, segment);

            let folder = folder_at(&self.root, &trail);
            let idx = match folder.position_of(self.policy, &item_path) {
                Some(idx) => idx,
                None => return,
            };

            if last {
                if matches!(folder.children[idx], Node::Missing { .. }) {
                    folder_at_mut(&mut self.root, &trail).remove_child(idx);
                }
                return;
            }

            if folder.children[idx].as_folder().is_none() {
                return;
            }
            trail.push(idx);
        }
    }
}

fn decorate(meta: &mut ItemMeta, change_revision: i64, property_only: bool) {
    if property_only {
        meta.property_revision = meta.property_revision.max(change_revision);
        meta.property_change_only = true;
    }
}

fn tombstone_for(kind: SourceItemKind, path: &str, revision: i64) -> Node {
    let meta = ItemMeta::synthetic(path, revision);
    match kind {
        SourceItemKind::File => Node::DeleteFile { meta },
        SourceItemKind::Folder => Node::DeleteFolder { meta },
    }
}

fn resolve_stubs(folder: &mut FolderNode) {
    for child in folder.children.iter_mut() {
        if child.is_stub() {
            child.unwrap_stub();
            child.meta_mut().container_only = true;
        }
        if let Some(sub) = child.as_folder_mut() {
            resolve_stubs(sub);
        }
    }
}

fn folder_at<'a>(root: &'a FolderNode, trail: &[usize]) -> &'a FolderNode {
    let mut current = root;
    for idx in trail {
        current = current.children[*idx]
            .as_folder()
            .expect("walk trail always points at folders");
    }
    current
}

fn folder_at_mut<'a>(root: &'a mut FolderNode, trail: &[usize]) -> &'a mut FolderNode {
    let mut current = root;
    for idx in trail {
        current = current.children[*idx]
            .as_folder_mut()
            .expect("walk trail always points at folders");
    }
    current
}
