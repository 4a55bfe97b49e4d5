// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process source over a tree of instance payloads.
//!
//! Hashes are derived the same way the engine derives them: an instance
//! reports the content hash of its payload and every other object reports
//! the merkle hash of its children. Switches let tests take objects or the
//! whole source offline, override reported hashes and corrupt listings.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::traits::{SourceAdapter, SourceError};
use crate::merkle::{Hash, HashTree, EMPTY_HASH};
use crate::revision::{Level, ObjectRef, ROOT_NATURAL_ID};

type Key = (Level, String);

#[derive(Default)]
struct Node {
    children: Vec<String>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<Key, Node>,
    unavailable: HashSet<Key>,
    overrides: HashMap<Key, Hash>,
    duplicated: HashSet<Key>,
    metadata: HashMap<Key, Value>,
    offline: bool,
}

impl Tree {
    fn ensure(&mut self, level: Level, id: &str, parent: Option<(Level, &str)>) {
        self.nodes.entry((level, id.to_string())).or_default();
        if let Some((parent_level, parent_id)) = parent {
            let parent = self
                .nodes
                .entry((parent_level, parent_id.to_string()))
                .or_default();
            if !parent.children.iter().any(|c| c == id) {
                parent.children.push(id.to_string());
            }
        }
    }

    fn hash_of(&self, level: Level, id: &str) -> Hash {
        let key = (level, id.to_string());
        if let Some(hash) = self.overrides.get(&key) {
            return hash.clone();
        }
        let Some(node) = self.nodes.get(&key) else {
            return EMPTY_HASH.to_string();
        };
        match level.child() {
            None => HashTree::content_hash(&node.payload),
            Some(child_level) => HashTree::merkle(
                node.children
                    .iter()
                    .map(|child| self.hash_of(child_level, child)),
            ),
        }
    }

    fn remove_subtree(&mut self, level: Level, id: &str) {
        if let Some(node) = self.nodes.remove(&(level, id.to_string())) {
            if let Some(child_level) = level.child() {
                for child in node.children {
                    self.remove_subtree(child_level, &child);
                }
            }
        }
    }

    fn check(&self, object: &ObjectRef, source: &str) -> Result<(), SourceError> {
        if self.offline {
            return Err(SourceError::Unavailable(format!("{} is offline", source)));
        }
        if self
            .unavailable
            .contains(&(object.level, object.natural_id.clone()))
        {
            return Err(SourceError::Unavailable(format!(
                "{} cannot answer for {}",
                source, object
            )));
        }
        Ok(())
    }
}

/// A complete [`SourceAdapter`] held in memory.
pub struct MemorySource {
    name: String,
    tree: RwLock<Tree>,
    list_calls: AtomicUsize,
    hash_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        let mut tree = Tree::default();
        tree.ensure(Level::Version, ROOT_NATURAL_ID, None);
        Self {
            name: name.into(),
            tree: RwLock::new(tree),
            list_calls: AtomicUsize::new(0),
            hash_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Add an instance and any missing ancestors.
    pub fn add_instance(
        &self,
        collection: &str,
        patient: &str,
        study: &str,
        series: &str,
        instance: &str,
        payload: impl Into<Vec<u8>>,
    ) {
        let mut tree = self.tree.write();
        tree.ensure(Level::Collection, collection, Some((Level::Version, ROOT_NATURAL_ID)));
        tree.ensure(Level::Patient, patient, Some((Level::Collection, collection)));
        tree.ensure(Level::Study, study, Some((Level::Patient, patient)));
        tree.ensure(Level::Series, series, Some((Level::Study, study)));
        tree.ensure(Level::Instance, instance, Some((Level::Series, series)));
        if let Some(node) = tree.nodes.get_mut(&(Level::Instance, instance.to_string())) {
            node.payload = payload.into();
        }
    }

    /// Add an empty object under `parent` (e.g. a collection with no patients yet).
    pub fn add_empty(&self, level: Level, natural_id: &str, parent: &str) {
        let mut tree = self.tree.write();
        if let Some(parent_level) = level.parent() {
            tree.ensure(level, natural_id, Some((parent_level, parent)));
        }
    }

    /// Replace an instance payload. Returns false if the instance is unknown.
    pub fn set_payload(&self, instance: &str, payload: impl Into<Vec<u8>>) -> bool {
        let mut tree = self.tree.write();
        match tree.nodes.get_mut(&(Level::Instance, instance.to_string())) {
            Some(node) => {
                node.payload = payload.into();
                true
            }
            None => false,
        }
    }

    /// Drop an object and its subtree from the source.
    pub fn remove(&self, level: Level, natural_id: &str) {
        let mut tree = self.tree.write();
        tree.remove_subtree(level, natural_id);
        let parent_level = level.parent();
        for ((node_level, _), node) in tree.nodes.iter_mut() {
            if Some(*node_level) == parent_level {
                node.children.retain(|c| c != natural_id);
            }
        }
    }

    /// Make listing, hashing and fetching of one object fail with `Unavailable`.
    pub fn set_unavailable(&self, level: Level, natural_id: &str, unavailable: bool) {
        let key = (level, natural_id.to_string());
        let mut tree = self.tree.write();
        if unavailable {
            tree.unavailable.insert(key);
        } else {
            tree.unavailable.remove(&key);
        }
    }

    /// Take the whole source down (or bring it back).
    pub fn set_offline(&self, offline: bool) {
        self.tree.write().offline = offline;
    }

    /// Report `hash` for an object regardless of its content; `None` clears.
    pub fn override_hash(&self, level: Level, natural_id: &str, hash: Option<&str>) {
        let key = (level, natural_id.to_string());
        let mut tree = self.tree.write();
        match hash {
            Some(hash) => {
                tree.overrides.insert(key, hash.to_string());
            }
            None => {
                tree.overrides.remove(&key);
            }
        }
    }

    /// Make the listing under this object repeat its first child.
    pub fn duplicate_first_child(&self, level: Level, natural_id: &str, duplicate: bool) {
        let key = (level, natural_id.to_string());
        let mut tree = self.tree.write();
        if duplicate {
            tree.duplicated.insert(key);
        } else {
            tree.duplicated.remove(&key);
        }
    }

    pub fn set_metadata(&self, level: Level, natural_id: &str, metadata: Value) {
        self.tree
            .write()
            .metadata
            .insert((level, natural_id.to_string()), metadata);
    }

    /// Current hash of an object as this source would report it.
    #[must_use]
    pub fn hash_of(&self, level: Level, natural_id: &str) -> Hash {
        self.tree.read().hash_of(level, natural_id)
    }

    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn hash_calls(&self) -> usize {
        self.hash_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SourceAdapter for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_children(&self, parent: &ObjectRef) -> Result<Vec<String>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let tree = self.tree.read();
        tree.check(parent, &self.name)?;
        let key = (parent.level, parent.natural_id.clone());
        let mut children = tree
            .nodes
            .get(&key)
            .map(|node| node.children.clone())
            .unwrap_or_default();
        if tree.duplicated.contains(&key) {
            if let Some(first) = children.first().cloned() {
                children.push(first);
            }
        }
        Ok(children)
    }

    async fn object_hash(&self, object: &ObjectRef) -> Result<Hash, SourceError> {
        self.hash_calls.fetch_add(1, Ordering::Relaxed);
        let tree = self.tree.read();
        tree.check(object, &self.name)?;
        Ok(tree.hash_of(object.level, &object.natural_id))
    }

    async fn metadata(&self, object: &ObjectRef) -> Result<Option<Value>, SourceError> {
        let tree = self.tree.read();
        tree.check(object, &self.name)?;
        Ok(tree
            .metadata
            .get(&(object.level, object.natural_id.clone()))
            .cloned())
    }

    async fn fetch_payload(&self, instance: &ObjectRef) -> Result<Vec<u8>, SourceError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        let tree = self.tree.read();
        tree.check(instance, &self.name)?;
        tree.nodes
            .get(&(Level::Instance, instance.natural_id.clone()))
            .map(|node| node.payload.clone())
            .ok_or_else(|| SourceError::NotFound(instance.to_string()))
    }
}
