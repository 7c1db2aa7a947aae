// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use dag::DependencyGraph;
use expression::{Configuration, EntityName};
use parking_lot::Mutex;

use crate::AnalysedTarget;

///
/// The insertion-deduplicating store of completed analyses, keyed by the target name and
/// its effective configuration. Two analyses arriving at the same key share one result:
/// the first registration wins and later ones receive the registered pointer.
///
pub struct ResultTargetMap {
    inner: Mutex<HashMap<(EntityName, Configuration), Arc<AnalysedTarget>>>,
}

impl ResultTargetMap {
    pub fn new() -> ResultTargetMap {
        ResultTargetMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(
        &self,
        target: EntityName,
        effective_config: Configuration,
        analysed: Arc<AnalysedTarget>,
    ) -> Arc<AnalysedTarget> {
        let mut inner = self.inner.lock();
        inner
            .entry((target, effective_config))
            .or_insert(analysed)
            .clone()
    }

    pub fn get(
        &self,
        target: &EntityName,
        effective_config: &Configuration,
    ) -> Option<Arc<AnalysedTarget>> {
        self.inner
            .lock()
            .get(&(target.clone(), effective_config.clone()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    ///
    /// Materialises everything the registered analyses declared into a dependency graph
    /// plus the list of blob contents that must be seeded into the CAS before traversal.
    ///
    pub fn to_graph(&self) -> Result<(DependencyGraph, Vec<String>), String> {
        let inner = self.inner.lock();
        let mut graph = DependencyGraph::new();
        let mut blobs = Vec::new();
        for analysed in inner.values() {
            graph.add(&analysed.actions)?;
            graph.add_trees(&analysed.trees)?;
            blobs.extend(analysed.blobs.iter().cloned());
        }
        Ok((graph, blobs))
    }
}

impl Default for ResultTargetMap {
    fn default() -> ResultTargetMap {
        ResultTargetMap::new()
    }
}
