//! In-memory directory information tree.
//!
//! The whole tree sits behind one `tokio::sync::RwLock`. Readers share it,
//! writers are exclusive, and every acquisition is bounded by the configured
//! lock timeout (`Busy` on expiry). Search cursors own a read guard, so a
//! cursor sees a consistent snapshot until it is dropped.

use crate::dn::{Dn, Rdn};
use crate::entry::{Entry, Modification, ModificationOp};
use crate::error::{DirectoryError, DirectoryResult};
use crate::filter::Filter;
use crate::ldif::{ImportPolicy, LdifRecord};
use crate::schema::Schema;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = DirectoryError;

    fn try_from(value: u8) -> DirectoryResult<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(DirectoryError::Protocol(format!("Invalid search scope: {}", value))),
        }
    }
}

/// Outcome of a bulk import.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: usize,
    /// Line number and error of every skipped record.
    pub skipped: Vec<(usize, DirectoryError)>,
}

#[derive(Debug, Clone)]
struct DitNode {
    entry: Entry,
    children: BTreeMap<String, DitNode>,
}

impl DitNode {
    fn new(entry: Entry) -> Self {
        Self {
            entry,
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct NamingContext {
    dn: Dn,
    root: Option<DitNode>,
}

/// Tree state guarded by the store lock.
#[derive(Debug, Clone, Default)]
struct Tree {
    contexts: BTreeMap<String, NamingContext>,
}

/// Position of a DN: naming-context key plus normalized RDNs below it.
type Location = (String, Vec<String>);

impl Tree {
    fn new(naming_contexts: &[Dn]) -> Self {
        let contexts = naming_contexts
            .iter()
            .map(|dn| {
                (
                    dn.normalize().as_str().to_string(),
                    NamingContext {
                        dn: dn.clone(),
                        root: None,
                    },
                )
            })
            .collect();
        Self { contexts }
    }

    /// Most specific naming context containing `dn`.
    fn locate(&self, dn: &Dn) -> Option<Location> {
        let (key, context) = self
            .contexts
            .iter()
            .filter(|(_, ctx)| dn.is_within(&ctx.dn))
            .max_by_key(|(_, ctx)| ctx.dn.depth())?;
        let path = dn
            .rdns_below(&context.dn)?
            .iter()
            .map(Rdn::normalized)
            .collect();
        Some((key.clone(), path))
    }

    fn node_at(&self, context: &str, path: &[String]) -> Option<&DitNode> {
        let mut node = self.contexts.get(context)?.root.as_ref()?;
        for key in path {
            node = node.children.get(key)?;
        }
        Some(node)
    }

    fn node_at_mut(&mut self, context: &str, path: &[String]) -> Option<&mut DitNode> {
        let mut node = self.contexts.get_mut(context)?.root.as_mut()?;
        for key in path {
            node = node.children.get_mut(key)?;
        }
        Some(node)
    }

    fn node(&self, dn: &Dn) -> Option<&DitNode> {
        let (context, path) = self.locate(dn)?;
        self.node_at(&context, &path)
    }

    fn node_mut(&mut self, dn: &Dn) -> Option<&mut DitNode> {
        let (context, path) = self.locate(dn)?;
        self.node_at_mut(&context, &path)
    }

    /// DN of the deepest existing ancestor of `dn`.
    fn matched_dn(&self, dn: &Dn) -> Option<String> {
        let (context, path) = self.locate(dn)?;
        let mut node = self.contexts.get(&context)?.root.as_ref()?;
        for key in &path {
            match node.children.get(key) {
                Some(child) => node = child,
                None => break,
            }
        }
        Some(node.entry.dn().to_string())
    }

    fn not_found(&self, dn: &Dn) -> DirectoryError {
        DirectoryError::no_such_object(dn.to_string(), self.matched_dn(dn))
    }

    fn insert(&mut self, entry: Entry, schema: &Schema) -> DirectoryResult<()> {
        let entry = merge_attributes(entry, schema)?;
        schema.validate(&entry)?;
        check_rdn_values(&entry, schema)
            .map_err(|attr| DirectoryError::NamingViolation(format!(
                "entry {} lacks its RDN value for '{}'",
                entry.dn(),
                attr
            )))?;
        let dn = entry.dn().clone();
        let (context, path) = self.locate(&dn).ok_or_else(|| self.not_found(&dn))?;
        if self.node_at(&context, &path).is_some() {
            return Err(DirectoryError::EntryAlreadyExists(dn.to_string()));
        }
        let Some((key, parent_path)) = path.split_last() else {
            // The entry is the naming context itself.
            if let Some(ctx) = self.contexts.get_mut(&context) {
                ctx.root = Some(DitNode::new(entry));
            }
            return Ok(());
        };
        let not_found = self.not_found(&dn);
        let parent = self
            .node_at_mut(&context, parent_path)
            .ok_or(not_found)?;
        parent.children.insert(key.clone(), DitNode::new(entry));
        Ok(())
    }

    fn remove(&mut self, dn: &Dn) -> DirectoryResult<DitNode> {
        let (context, path) = self.locate(dn).ok_or_else(|| self.not_found(dn))?;
        match path.split_last() {
            None => self
                .contexts
                .get_mut(&context)
                .and_then(|ctx| ctx.root.take())
                .ok_or_else(|| DirectoryError::no_such_object(dn.to_string(), None)),
            Some((key, parent_path)) => {
                let not_found = self.not_found(dn);
                self.node_at_mut(&context, parent_path)
                    .and_then(|parent| parent.children.remove(key))
                    .ok_or(not_found)
            }
        }
    }

    fn delete(&mut self, dn: &Dn) -> DirectoryResult<()> {
        let node = self.node(dn).ok_or_else(|| self.not_found(dn))?;
        if !node.children.is_empty() {
            return Err(DirectoryError::NotAllowedOnNonLeaf(dn.to_string()));
        }
        self.remove(dn)?;
        Ok(())
    }

    fn modify(&mut self, dn: &Dn, changes: &[Modification], schema: &Schema) -> DirectoryResult<()> {
        let not_found = self.not_found(dn);
        let node = self.node_mut(dn).ok_or(not_found)?;
        let mut updated = node.entry.clone();
        apply_modifications(&mut updated, changes, schema)?;
        schema.validate(&updated)?;
        node.entry = updated;
        Ok(())
    }

    fn rename(
        &mut self,
        dn: &Dn,
        new_rdn: &Rdn,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
        schema: &Schema,
    ) -> DirectoryResult<Dn> {
        let node = self.node(dn).ok_or_else(|| self.not_found(dn))?;
        let (_, path) = self.locate(dn).ok_or_else(|| self.not_found(dn))?;
        if path.is_empty() {
            return Err(DirectoryError::UnwillingToPerform(format!(
                "cannot rename naming context {}",
                dn
            )));
        }
        let parent = match new_superior {
            Some(superior) => {
                if superior.is_within(dn) {
                    return Err(DirectoryError::UnwillingToPerform(
                        "cannot move an entry below itself".to_string(),
                    ));
                }
                if self.node(superior).is_none() {
                    return Err(self.not_found(superior));
                }
                superior.clone()
            }
            None => dn.parent().unwrap_or_default(),
        };
        let new_dn = parent.child(new_rdn.clone());
        if new_dn != *dn && self.node(&new_dn).is_some() {
            return Err(DirectoryError::EntryAlreadyExists(new_dn.to_string()));
        }
        let (new_context, new_path) = self.locate(&new_dn).ok_or_else(|| self.not_found(&new_dn))?;
        let Some((key, parent_path)) = new_path.split_last() else {
            return Err(DirectoryError::UnwillingToPerform(
                "cannot rename an entry into a naming context root".to_string(),
            ));
        };

        let mut entry = node.entry.clone();
        if delete_old_rdn {
            if let Some(old_rdn) = dn.rdn() {
                for ava in old_rdn.avas() {
                    let kept = new_rdn
                        .avas()
                        .iter()
                        .any(|n| schema.same_attribute(&n.attr, &ava.attr)
                            && schema.matching_rule(&ava.attr).equal(n.value.as_bytes(), ava.value.as_bytes()));
                    if !kept {
                        let rule = schema.matching_rule(&ava.attr);
                        let name = attribute_key(&entry, &ava.attr, schema);
                        entry.remove_values_where(&name, |v| rule.equal(v, ava.value.as_bytes()));
                    }
                }
            }
        }
        for ava in new_rdn.avas() {
            let rule = schema.matching_rule(&ava.attr);
            let name = attribute_key(&entry, &ava.attr, schema);
            if !entry.values(&name).iter().any(|v| rule.equal(v, ava.value.as_bytes())) {
                entry.add_value(&name, ava.value.as_bytes().to_vec());
            }
        }
        entry.set_dn(new_dn.clone());
        schema.validate(&entry)?;

        let mut subtree = self.remove(dn)?;
        subtree.entry = entry;
        let mut stack: Vec<&mut DitNode> = subtree.children.values_mut().collect();
        while let Some(child) = stack.pop() {
            if let Some(moved) = child.entry.dn().rebase(dn, &new_dn) {
                child.entry.set_dn(moved);
            }
            stack.extend(child.children.values_mut());
        }
        match self.node_at_mut(&new_context, parent_path) {
            Some(parent) => {
                parent.children.insert(key.clone(), subtree);
                Ok(new_dn)
            }
            None => Err(DirectoryError::no_such_object(new_dn.to_string(), None)),
        }
    }

    /// Every entry, naming contexts in key order, each tree in pre-order.
    fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::new();
        for ctx in self.contexts.values() {
            let Some(root) = &ctx.root else { continue };
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                out.push(node.entry.clone());
                stack.extend(node.children.values().rev());
            }
        }
        out
    }

    fn len(&self) -> usize {
        let mut count = 0;
        for ctx in self.contexts.values() {
            let mut stack: Vec<&DitNode> = ctx.root.iter().collect();
            while let Some(node) = stack.pop() {
                count += 1;
                stack.extend(node.children.values());
            }
        }
        count
    }

    fn clear(&mut self) {
        for ctx in self.contexts.values_mut() {
            ctx.root = None;
        }
    }
}

/// Name under which `entry` already stores `attr` (aliases resolved).
fn attribute_key(entry: &Entry, attr: &str, schema: &Schema) -> String {
    entry
        .attributes()
        .find(|a| schema.same_attribute(&a.name, attr))
        .map(|a| a.name.clone())
        .unwrap_or_else(|| attr.to_string())
}

/// Fold attribute aliases (`c`, `countryName`) onto one attribute. Values
/// equal under the attribute's matching rule are rejected.
fn merge_attributes(entry: Entry, schema: &Schema) -> DirectoryResult<Entry> {
    let mut merged = Entry::new(entry.dn().clone());
    for attribute in entry.attributes() {
        let rule = schema.matching_rule(&attribute.name);
        let name = attribute_key(&merged, &attribute.name, schema);
        for value in &attribute.values {
            if merged.values(&name).iter().any(|v| rule.equal(v, value)) {
                return Err(DirectoryError::AttributeOrValueExists(format!(
                    "entry {} repeats a value of '{}'",
                    entry.dn(),
                    attribute.name
                )));
            }
            merged.add_value(&name, value.clone());
        }
    }
    Ok(merged)
}

/// Returns the first RDN attribute whose value the entry does not hold.
fn check_rdn_values(entry: &Entry, schema: &Schema) -> Result<(), String> {
    let Some(rdn) = entry.dn().rdn() else {
        return Ok(());
    };
    for ava in rdn.avas() {
        let rule = schema.matching_rule(&ava.attr);
        let name = attribute_key(entry, &ava.attr, schema);
        if !entry
            .values(&name)
            .iter()
            .any(|v| rule.equal(v, ava.value.as_bytes()))
        {
            return Err(ava.attr.clone());
        }
    }
    Ok(())
}

/// Apply an ordered change list to `entry`. The caller re-validates.
fn apply_modifications(
    entry: &mut Entry,
    changes: &[Modification],
    schema: &Schema,
) -> DirectoryResult<()> {
    for change in changes {
        let Some(attribute_type) = schema.attribute_type(&change.attribute) else {
            return Err(DirectoryError::UndefinedAttributeType(change.attribute.clone()));
        };
        if attribute_type.no_user_modification {
            return Err(DirectoryError::ConstraintViolation(format!(
                "attribute '{}' is not user-modifiable",
                change.attribute
            )));
        }
        let rule = schema.matching_rule(&change.attribute);
        let name = attribute_key(entry, &change.attribute, schema);
        match change.op {
            ModificationOp::Add => {
                if change.values.is_empty() {
                    return Err(DirectoryError::Protocol(format!(
                        "add of '{}' carries no values",
                        change.attribute
                    )));
                }
                for value in &change.values {
                    if entry.values(&name).iter().any(|v| rule.equal(v, value)) {
                        return Err(DirectoryError::AttributeOrValueExists(format!(
                            "{}: {}",
                            change.attribute,
                            String::from_utf8_lossy(value)
                        )));
                    }
                    entry.add_value(&name, value.clone());
                }
            }
            ModificationOp::Delete => {
                if change.values.is_empty() {
                    if entry.remove_attribute(&name).is_none() {
                        return Err(DirectoryError::NoSuchAttribute(change.attribute.clone()));
                    }
                    continue;
                }
                for value in &change.values {
                    if entry.remove_values_where(&name, |v| rule.equal(v, value)) == 0 {
                        return Err(DirectoryError::NoSuchAttribute(format!(
                            "{}: {}",
                            change.attribute,
                            String::from_utf8_lossy(value)
                        )));
                    }
                }
            }
            ModificationOp::Replace => entry.set_values(&name, change.values.clone()),
        }
    }
    check_rdn_values(entry, schema).map_err(|attr| {
        DirectoryError::NotAllowedOnRdn(format!("cannot remove RDN value of '{}'", attr))
    })
}

struct Pending {
    context: String,
    path: Vec<String>,
    depth: usize,
}

/// Lazy search over a read-locked snapshot of the tree.
///
/// Yields entries in depth-first pre-order, children in normalized-RDN order.
/// Dropping the cursor releases the read lock.
pub struct SearchCursor {
    tree: OwnedRwLockReadGuard<Tree>,
    schema: Arc<Schema>,
    scope: SearchScope,
    filter: Filter,
    stack: Vec<Pending>,
}

impl Iterator for SearchCursor {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        while let Some(pending) = self.stack.pop() {
            let Some(node) = self.tree.node_at(&pending.context, &pending.path) else {
                continue;
            };
            let descend = match self.scope {
                SearchScope::BaseObject => false,
                SearchScope::SingleLevel => pending.depth == 0,
                SearchScope::WholeSubtree => true,
            };
            if descend {
                for key in node.children.keys().rev() {
                    let mut path = pending.path.clone();
                    path.push(key.clone());
                    self.stack.push(Pending {
                        context: pending.context.clone(),
                        path,
                        depth: pending.depth + 1,
                    });
                }
            }
            let in_scope = match self.scope {
                SearchScope::BaseObject => pending.depth == 0,
                SearchScope::SingleLevel => pending.depth == 1,
                SearchScope::WholeSubtree => true,
            };
            if in_scope && self.filter.matches(&node.entry, &self.schema) {
                return Some(node.entry.clone());
            }
        }
        None
    }
}

/// Shared handle to the directory tree.
pub struct DitStore {
    tree: Arc<RwLock<Tree>>,
    schema: Arc<Schema>,
    naming_contexts: Vec<Dn>,
    lock_timeout: Duration,
    closed: AtomicBool,
}

impl DitStore {
    pub fn new(schema: Arc<Schema>, naming_contexts: Vec<Dn>, lock_timeout: Duration) -> Self {
        Self {
            tree: Arc::new(RwLock::new(Tree::new(&naming_contexts))),
            schema,
            naming_contexts,
            lock_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn naming_contexts(&self) -> &[Dn] {
        &self.naming_contexts
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> DirectoryResult<()> {
        if self.is_closed() {
            Err(DirectoryError::Unavailable("directory is closed".to_string()))
        } else {
            Ok(())
        }
    }

    async fn read(&self) -> DirectoryResult<OwnedRwLockReadGuard<Tree>> {
        self.ensure_open()?;
        let guard = tokio::time::timeout(self.lock_timeout, self.tree.clone().read_owned())
            .await
            .map_err(|_| {
                warn!("Timed out waiting for the directory read lock");
                DirectoryError::Busy
            })?;
        self.ensure_open()?;
        Ok(guard)
    }

    async fn write(&self) -> DirectoryResult<OwnedRwLockWriteGuard<Tree>> {
        self.ensure_open()?;
        let guard = tokio::time::timeout(self.lock_timeout, self.tree.clone().write_owned())
            .await
            .map_err(|_| {
                warn!("Timed out waiting for the directory write lock");
                DirectoryError::Busy
            })?;
        self.ensure_open()?;
        Ok(guard)
    }

    pub async fn add(&self, entry: Entry) -> DirectoryResult<()> {
        let dn = entry.dn().to_string();
        let mut tree = self.write().await?;
        tree.insert(entry, &self.schema)?;
        debug!("Added entry {}", dn);
        Ok(())
    }

    pub async fn delete(&self, dn: &Dn) -> DirectoryResult<()> {
        let mut tree = self.write().await?;
        tree.delete(dn)?;
        debug!("Deleted entry {}", dn);
        Ok(())
    }

    pub async fn modify(&self, dn: &Dn, changes: &[Modification]) -> DirectoryResult<()> {
        let mut tree = self.write().await?;
        tree.modify(dn, changes, &self.schema)?;
        debug!("Modified entry {} ({} changes)", dn, changes.len());
        Ok(())
    }

    /// Rename and/or move an entry with its subtree. Returns the new DN.
    pub async fn modify_dn(
        &self,
        dn: &Dn,
        new_rdn: &Rdn,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
    ) -> DirectoryResult<Dn> {
        let mut tree = self.write().await?;
        let new_dn = tree.rename(dn, new_rdn, delete_old_rdn, new_superior, &self.schema)?;
        debug!("Renamed entry {} to {}", dn, new_dn);
        Ok(new_dn)
    }

    pub async fn lookup(&self, dn: &Dn) -> DirectoryResult<Option<Entry>> {
        let tree = self.read().await?;
        Ok(tree.node(dn).map(|node| node.entry.clone()))
    }

    /// Like [`DitStore::lookup`], but a missing entry is `NoSuchObject` with the matched DN.
    pub async fn fetch(&self, dn: &Dn) -> DirectoryResult<Entry> {
        let tree = self.read().await?;
        tree.node(dn)
            .map(|node| node.entry.clone())
            .ok_or_else(|| tree.not_found(dn))
    }

    /// Start a lazy search. The cursor holds the read lock until dropped.
    pub async fn search(
        &self,
        base: &Dn,
        scope: SearchScope,
        filter: Filter,
    ) -> DirectoryResult<SearchCursor> {
        let tree = self.read().await?;
        let mut stack = Vec::new();
        if base.is_root() {
            for (key, ctx) in tree.contexts.iter().rev() {
                if ctx.root.is_some() {
                    stack.push(Pending {
                        context: key.clone(),
                        path: Vec::new(),
                        depth: 1,
                    });
                }
            }
        } else {
            let (context, path) = tree.locate(base).ok_or_else(|| tree.not_found(base))?;
            if tree.node_at(&context, &path).is_none() {
                return Err(tree.not_found(base));
            }
            stack.push(Pending {
                context,
                path,
                depth: 0,
            });
        }
        Ok(SearchCursor {
            tree,
            schema: self.schema.clone(),
            scope,
            filter,
            stack,
        })
    }

    /// Bulk load. `Abort` stages the records on a copy of the tree and only
    /// swaps it in when every record succeeded.
    pub async fn import(
        &self,
        records: Vec<LdifRecord>,
        policy: ImportPolicy,
    ) -> DirectoryResult<ImportReport> {
        let mut tree = self.write().await?;
        let mut report = ImportReport::default();
        match policy {
            ImportPolicy::Abort => {
                let mut staged = (*tree).clone();
                for record in records {
                    staged.insert(record.entry, &self.schema).map_err(|e| {
                        DirectoryError::Ldif {
                            line: record.line,
                            message: e.to_string(),
                        }
                    })?;
                    report.imported += 1;
                }
                *tree = staged;
            }
            ImportPolicy::SkipInvalid => {
                for record in records {
                    match tree.insert(record.entry, &self.schema) {
                        Ok(()) => report.imported += 1,
                        Err(e) => {
                            warn!("Skipping LDIF record at line {}: {}", record.line, e);
                            report.skipped.push((record.line, e));
                        }
                    }
                }
            }
        }
        info!(
            "Imported {} entries ({} skipped)",
            report.imported,
            report.skipped.len()
        );
        Ok(report)
    }

    /// Snapshot of all entries in pre-order.
    pub async fn entries(&self) -> DirectoryResult<Vec<Entry>> {
        Ok(self.read().await?.entries())
    }

    pub async fn entry_count(&self) -> DirectoryResult<usize> {
        Ok(self.read().await?.len())
    }

    /// Idempotent. New operations fail with `Unavailable`; in-flight ones get
    /// up to the lock timeout to finish before the entries are released.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::time::timeout(self.lock_timeout, self.tree.clone().write_owned()).await {
            Ok(mut tree) => {
                tree.clear();
                info!("Directory store closed");
            }
            Err(_) => warn!("Closed directory store while operations were still running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "dc=example,dc=com";

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn store() -> DitStore {
        DitStore::new(
            Arc::new(Schema::standard().unwrap()),
            vec![dn(ROOT)],
            Duration::from_millis(200),
        )
    }

    fn domain() -> Entry {
        Entry::new(dn(ROOT))
            .with_attribute("objectClass", ["top", "domain"])
            .with_attribute("dc", ["example"])
    }

    fn ou(name: &str) -> Entry {
        Entry::new(dn(&format!("ou={},{}", name, ROOT)))
            .with_attribute("objectClass", ["top", "organizationalUnit"])
            .with_attribute("ou", [name])
    }

    fn person(cn: &str, parent: &str) -> Entry {
        Entry::new(dn(&format!("cn={},{}", cn, parent)))
            .with_attribute("objectClass", ["top", "person"])
            .with_attribute("cn", [cn])
            .with_attribute("sn", ["Smith"])
    }

    async fn seeded() -> DitStore {
        let store = store();
        store.add(domain()).await.unwrap();
        store.add(ou("people")).await.unwrap();
        store.add(person("admin", ROOT)).await.unwrap();
        store
            .add(person("John Smith", &format!("ou=people,{}", ROOT)))
            .await
            .unwrap();
        store
    }

    async fn search_dns(store: &DitStore, base: &str, scope: SearchScope, filter: &str) -> Vec<String> {
        store
            .search(&dn(base), scope, Filter::parse(filter).unwrap())
            .await
            .unwrap()
            .map(|e| e.dn().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_add_then_lookup() {
        let store = seeded().await;
        let found = store.lookup(&dn("CN=Admin,DC=Example,DC=Com")).await.unwrap();
        assert_eq!(found, Some(person("admin", ROOT)));
        assert_eq!(store.entry_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_add_errors() {
        let store = seeded().await;
        assert!(matches!(
            store.add(person("admin", ROOT)).await,
            Err(DirectoryError::EntryAlreadyExists(_))
        ));
        match store.add(person("x", &format!("ou=missing,{}", ROOT))).await {
            Err(DirectoryError::NoSuchObject { matched, .. }) => {
                assert_eq!(matched.as_deref(), Some(ROOT))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            store.add(person("x", "dc=other,dc=org")).await,
            Err(DirectoryError::NoSuchObject { .. })
        ));
        let unnamed = Entry::new(dn(&format!("cn=ghost,{}", ROOT)))
            .with_attribute("objectClass", ["person"])
            .with_attribute("cn", ["someone else"])
            .with_attribute("sn", ["x"]);
        assert!(matches!(
            store.add(unnamed).await,
            Err(DirectoryError::NamingViolation(_))
        ));
        let invalid = Entry::new(dn(&format!("cn=bad,{}", ROOT)))
            .with_attribute("objectClass", ["person"])
            .with_attribute("cn", ["bad"]);
        assert!(matches!(
            store.add(invalid).await,
            Err(DirectoryError::ObjectClassViolation(_))
        ));
        assert_eq!(store.entry_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_add_folds_attribute_aliases() {
        let store = seeded().await;
        let country = Entry::new(dn(&format!("c=US,{}", ROOT)))
            .with_attribute("objectClass", ["top", "country"])
            .with_attribute("c", ["US"])
            .with_attribute("countryName", ["FR"]);
        assert!(matches!(
            store.add(country).await,
            Err(DirectoryError::ConstraintViolation(_))
        ));

        let spelled_twice = Entry::new(dn(&format!("c=FR,{}", ROOT)))
            .with_attribute("objectClass", ["top", "country"])
            .with_attribute("c", ["FR"])
            .with_attribute("countryName", ["FR"]);
        assert!(matches!(
            store.add(spelled_twice).await,
            Err(DirectoryError::AttributeOrValueExists(_))
        ));
        assert_eq!(store.entry_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_add_rejects_values_equal_under_matching_rule() {
        let store = seeded().await;
        let entry = Entry::new(dn(&format!("cn=x,{}", ROOT)))
            .with_attribute("objectClass", ["top", "person"])
            .with_attribute("cn", ["x", "X"])
            .with_attribute("sn", ["Smith"]);
        assert!(matches!(
            store.add(entry).await,
            Err(DirectoryError::AttributeOrValueExists(_))
        ));
        assert_eq!(store.lookup(&dn(&format!("cn=x,{}", ROOT))).await.unwrap(), None);

        let aliased = Entry::new(dn(&format!("cn=y,{}", ROOT)))
            .with_attribute("objectClass", ["top", "person"])
            .with_attribute("cn", ["y"])
            .with_attribute("commonName", ["Why"])
            .with_attribute("sn", ["Smith"]);
        store.add(aliased).await.unwrap();
        let stored = store.lookup(&dn(&format!("cn=y,{}", ROOT))).await.unwrap().unwrap();
        assert_eq!(stored.values("cn"), &[b"y".to_vec(), b"Why".to_vec()]);
        assert!(!stored.has_attribute("commonName"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = seeded().await;
        assert!(matches!(
            store.delete(&dn(&format!("ou=people,{}", ROOT))).await,
            Err(DirectoryError::NotAllowedOnNonLeaf(_))
        ));
        assert_eq!(store.entry_count().await.unwrap(), 4);
        let admin = dn(&format!("cn=admin,{}", ROOT));
        store.delete(&admin).await.unwrap();
        assert_eq!(store.lookup(&admin).await.unwrap(), None);
        assert!(matches!(
            store.delete(&admin).await,
            Err(DirectoryError::NoSuchObject { .. })
        ));
    }

    #[tokio::test]
    async fn test_modify_applies_in_order() {
        let store = seeded().await;
        let admin = dn(&format!("cn=admin,{}", ROOT));
        store
            .modify(
                &admin,
                &[
                    Modification::new(ModificationOp::Add, "description", ["one", "two"]),
                    Modification::new(ModificationOp::Delete, "description", ["ONE"]),
                    Modification::new(ModificationOp::Replace, "sn", ["Jones"]),
                ],
            )
            .await
            .unwrap();
        let entry = store.lookup(&admin).await.unwrap().unwrap();
        assert_eq!(entry.values("description"), &[b"two".to_vec()]);
        assert_eq!(entry.first_value_str("sn"), Some("Jones"));
    }

    #[tokio::test]
    async fn test_modify_is_atomic() {
        let store = seeded().await;
        let admin = dn(&format!("cn=admin,{}", ROOT));
        let before = store.lookup(&admin).await.unwrap();
        let result = store
            .modify(
                &admin,
                &[
                    Modification::new(ModificationOp::Add, "description", ["first"]),
                    Modification::new(ModificationOp::Delete, "sn", Vec::<&str>::new()),
                ],
            )
            .await;
        assert!(matches!(result, Err(DirectoryError::ObjectClassViolation(_))));
        assert_eq!(store.lookup(&admin).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_modify_errors() {
        let store = seeded().await;
        let admin = dn(&format!("cn=admin,{}", ROOT));
        async fn modify(store: &DitStore, dn: &Dn, changes: Vec<Modification>) -> DirectoryResult<()> {
            store.modify(dn, &changes).await
        }
        assert!(matches!(
            modify(&store, &admin, vec![Modification::new(ModificationOp::Add, "sn", ["smith"])]).await,
            Err(DirectoryError::AttributeOrValueExists(_))
        ));
        assert!(matches!(
            modify(&store, &admin, vec![Modification::new(ModificationOp::Delete, "description", ["x"])]).await,
            Err(DirectoryError::NoSuchAttribute(_))
        ));
        assert!(matches!(
            modify(&store, &admin, vec![Modification::new(ModificationOp::Delete, "cn", ["admin"])]).await,
            Err(DirectoryError::NotAllowedOnRdn(_))
        ));
        assert!(matches!(
            modify(&store, &admin, vec![Modification::new(ModificationOp::Add, "shoeSize", ["9"])]).await,
            Err(DirectoryError::UndefinedAttributeType(_))
        ));
        assert!(matches!(
            modify(&store, &admin, vec![Modification::new(ModificationOp::Replace, "createTimestamp", ["20240101000000Z"])]).await,
            Err(DirectoryError::ConstraintViolation(_))
        ));
        assert!(matches!(
            store.modify(&dn(&format!("cn=nobody,{}", ROOT)), &[]).await,
            Err(DirectoryError::NoSuchObject { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_scopes_and_order() {
        let store = seeded().await;
        store.add(ou("groups")).await.unwrap();
        let all = search_dns(&store, ROOT, SearchScope::WholeSubtree, "(&)").await;
        assert_eq!(
            all,
            vec![
                "dc=example,dc=com",
                "cn=admin,dc=example,dc=com",
                "ou=groups,dc=example,dc=com",
                "ou=people,dc=example,dc=com",
                "cn=John Smith,ou=people,dc=example,dc=com",
            ]
        );
        let one = search_dns(&store, ROOT, SearchScope::SingleLevel, "(objectClass=*)").await;
        assert_eq!(one.len(), 3);
        let base = search_dns(&store, ROOT, SearchScope::BaseObject, "(objectClass=*)").await;
        assert_eq!(base, vec!["dc=example,dc=com"]);
        let from_root = search_dns(&store, "", SearchScope::WholeSubtree, "(cn=admin)").await;
        assert_eq!(from_root, vec!["cn=admin,dc=example,dc=com"]);
    }

    #[tokio::test]
    async fn test_search_filters() {
        let store = seeded().await;
        assert_eq!(search_dns(&store, ROOT, SearchScope::WholeSubtree, "(cn=admin)").await.len(), 1);
        assert!(search_dns(&store, ROOT, SearchScope::WholeSubtree, "(cn=nobody)").await.is_empty());
        let johns = search_dns(&store, ROOT, SearchScope::WholeSubtree, "(&(objectClass=person)(cn=John*))").await;
        assert_eq!(johns, vec!["cn=John Smith,ou=people,dc=example,dc=com"]);
    }

    #[tokio::test]
    async fn test_search_missing_base() {
        let store = seeded().await;
        let result = store
            .search(&dn(&format!("ou=missing,{}", ROOT)), SearchScope::WholeSubtree, Filter::match_all())
            .await;
        match result {
            Err(DirectoryError::NoSuchObject { matched, .. }) => assert_eq!(matched.as_deref(), Some(ROOT)),
            Err(other) => panic!("unexpected {:?}", other),
            Ok(_) => panic!("expected noSuchObject"),
        }
    }

    #[tokio::test]
    async fn test_subtree_search_includes_every_descendant() {
        let store = seeded().await;
        let entries = store.entries().await.unwrap();
        for ancestor in &entries {
            let found = search_dns(&store, &ancestor.dn().to_string(), SearchScope::WholeSubtree, "(&)").await;
            for descendant in entries.iter().filter(|e| e.dn().is_within(ancestor.dn())) {
                assert!(found.contains(&descendant.dn().to_string()));
            }
        }
    }

    #[tokio::test]
    async fn test_cursor_holds_read_lock() {
        let store = seeded().await;
        let cursor = store
            .search(&dn(ROOT), SearchScope::WholeSubtree, Filter::match_all())
            .await
            .unwrap();
        assert!(matches!(
            store.add(person("late", ROOT)).await,
            Err(DirectoryError::Busy)
        ));
        drop(cursor);
        store.add(person("late", ROOT)).await.unwrap();
    }

    #[tokio::test]
    async fn test_modify_dn_moves_subtree() {
        let store = seeded().await;
        store.add(ou("staff")).await.unwrap();
        let people = dn(&format!("ou=people,{}", ROOT));
        let new_dn = store
            .modify_dn(&people, &Rdn::new("ou", "crew"), true, Some(&dn(&format!("ou=staff,{}", ROOT))))
            .await
            .unwrap();
        assert_eq!(new_dn.to_string(), "ou=crew,ou=staff,dc=example,dc=com");
        assert_eq!(store.lookup(&people).await.unwrap(), None);
        let moved = store.lookup(&new_dn).await.unwrap().unwrap();
        assert_eq!(moved.values("ou"), &[b"crew".to_vec()]);
        let john = store
            .lookup(&dn("cn=John Smith,ou=crew,ou=staff,dc=example,dc=com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(john.dn().to_string(), "cn=John Smith,ou=crew,ou=staff,dc=example,dc=com");
    }

    #[tokio::test]
    async fn test_modify_dn_keeps_old_rdn_value() {
        let store = seeded().await;
        let admin = dn(&format!("cn=admin,{}", ROOT));
        let new_dn = store
            .modify_dn(&admin, &Rdn::new("cn", "root"), false, None)
            .await
            .unwrap();
        let entry = store.lookup(&new_dn).await.unwrap().unwrap();
        assert_eq!(entry.values("cn").len(), 2);
        assert!(matches!(
            store.modify_dn(&new_dn, &Rdn::new("ou", "people"), true, None).await,
            Err(DirectoryError::EntryAlreadyExists(_))
        ));
        assert!(matches!(
            store.modify_dn(&dn(ROOT), &Rdn::new("dc", "x"), true, None).await,
            Err(DirectoryError::UnwillingToPerform(_))
        ));
    }

    #[tokio::test]
    async fn test_import_abort_is_all_or_nothing() {
        let store = store();
        let records = vec![
            LdifRecord { line: 1, entry: domain() },
            LdifRecord { line: 5, entry: person("admin", ROOT) },
            LdifRecord { line: 11, entry: person("x", &format!("ou=missing,{}", ROOT)) },
        ];
        let err = store.import(records.clone(), ImportPolicy::Abort).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Ldif { line: 11, .. }));
        assert_eq!(store.entry_count().await.unwrap(), 0);

        let report = store.import(records, ImportPolicy::SkipInvalid).await.unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, 11);
        assert_eq!(store.entry_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = seeded().await;
        store.close().await;
        store.close().await;
        assert!(store.is_closed());
        assert!(matches!(
            store.lookup(&dn(ROOT)).await,
            Err(DirectoryError::Unavailable(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writer_and_readers() {
        let store = Arc::new(seeded().await);
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let entry = person(&format!("user{}", i), ROOT)
                        .with_attribute("description", ["complete"]);
                    store.add(entry).await.unwrap();
                }
            })
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let cursor = store
                        .search(&dn(ROOT), SearchScope::WholeSubtree, Filter::parse("(cn=user*)").unwrap())
                        .await
                        .unwrap();
                    for entry in cursor {
                        assert_eq!(entry.first_value_str("description"), Some("complete"));
                        assert_eq!(entry.first_value_str("sn"), Some("Smith"));
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(store.entry_count().await.unwrap(), 54);
    }
}
