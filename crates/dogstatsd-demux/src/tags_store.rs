// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted tag sets shared by every bucket of one context.

use crate::metric::{ContextKey, SortedTags};
use fnv::FnvHasher;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

type FnvHashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FnvHasher>>;

struct Entry {
    tags: Arc<SortedTags>,
    refs: usize,
}

/// When disabled, every call to [`TagsStore::insert`] returns a fresh copy and
/// nothing is tracked.
pub struct TagsStore {
    enabled: bool,
    entries: FnvHashMap<ContextKey, Entry>,
}

impl TagsStore {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: FnvHashMap::default(),
        }
    }

    /// Takes a reference on the tags of `key`, storing them on first use.
    pub fn insert(&mut self, key: ContextKey, tags: &SortedTags) -> Arc<SortedTags> {
        if !self.enabled {
            return Arc::new(tags.clone());
        }

        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            tags: Arc::new(tags.clone()),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.tags)
    }

    /// Drops one reference on the tags of `key`.
    pub fn release(&mut self, key: ContextKey) {
        if !self.enabled {
            return;
        }

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                self.entries.remove(&key);
            }
        }
    }

    /// Number of distinct tag sets currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
