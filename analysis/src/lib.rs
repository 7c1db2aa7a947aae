// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Subjective style.
#![allow(clippy::too_many_arguments, clippy::type_complexity)]

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_map::{AsyncMap, Context, Failure};
use common::{ActionDescription, RepositoryConfig, Tree};
use expression::{Configuration, EntityName, TargetResult};
use futures::future::{BoxFuture, FutureExt};
use hashing::DigestFunction;
use serde_json::Value as Json;

mod built_in;
mod maps;
mod result_map;
mod rules;
mod target_map;
mod utils;

pub use result_map::ResultTargetMap;
pub use rules::{AnonymousDefinition, UserRule};

pub use maps::DirectoryEntries;

///
/// A module within a repository: the directory whose targets file defines targets.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ModuleName {
    pub repository: String,
    pub module: String,
}

impl ModuleName {
    pub fn new(repository: impl Into<String>, module: impl Into<String>) -> ModuleName {
        ModuleName {
            repository: repository.into(),
            module: module.into(),
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.module)
    }
}

///
/// The unit of analysis memoisation: a target name under a configuration.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConfiguredTarget {
    pub name: EntityName,
    pub config: Configuration,
}

impl ConfiguredTarget {
    pub fn new(name: EntityName, config: Configuration) -> ConfiguredTarget {
        ConfiguredTarget { name, config }
    }
}

impl fmt::Display for ConfiguredTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.config)
    }
}

///
/// The output of analysing one configured target: its result, everything it introduced
/// into the action/artifact graph, the configuration variables it effectively depends
/// on, and its taint set.
///
#[derive(Clone, Debug)]
pub struct AnalysedTarget {
    pub result: TargetResult,
    pub actions: Vec<ActionDescription>,
    pub blobs: Vec<String>,
    pub trees: Vec<Tree>,
    pub vars: BTreeSet<String>,
    pub tainted: BTreeSet<String>,
}

impl AnalysedTarget {
    pub fn from_result(result: TargetResult) -> AnalysedTarget {
        AnalysedTarget {
            result,
            actions: vec![],
            blobs: vec![],
            trees: vec![],
            vars: BTreeSet::new(),
            tainted: BTreeSet::new(),
        }
    }
}

pub(crate) struct AnalysisInner {
    pub repositories: RepositoryConfig,
    pub digests: DigestFunction,
    pub targets_files: AsyncMap<ModuleName, Arc<Json>>,
    pub rules_files: AsyncMap<ModuleName, Arc<Json>>,
    pub directory_entries: AsyncMap<ModuleName, Arc<DirectoryEntries>>,
    pub rules: AsyncMap<EntityName, Arc<UserRule>>,
    pub sources: AsyncMap<EntityName, Arc<AnalysedTarget>>,
    pub targets: AsyncMap<ConfiguredTarget, Arc<AnalysedTarget>>,
    pub results: ResultTargetMap,
}

///
/// The target-analysis pipeline: a family of keyed memoising consumers that resolve
/// configured targets into analysed targets. Cheap to clone and share across tasks.
///
#[derive(Clone)]
pub struct Analysis {
    pub(crate) inner: Arc<AnalysisInner>,
}

impl Analysis {
    pub fn new(repositories: RepositoryConfig, digests: DigestFunction) -> Analysis {
        Analysis {
            inner: Arc::new(AnalysisInner {
                repositories,
                digests,
                targets_files: AsyncMap::new("targets-file"),
                rules_files: AsyncMap::new("rules-file"),
                directory_entries: AsyncMap::new("directory-entries"),
                rules: AsyncMap::new("rule"),
                sources: AsyncMap::new("source-target"),
                targets: AsyncMap::new("target"),
                results: ResultTargetMap::new(),
            }),
        }
    }

    pub fn results(&self) -> &ResultTargetMap {
        &self.inner.results
    }

    ///
    /// Analyses the given configured target, memoised per key: two requests for the same
    /// `(name, configuration)` share one analysis.
    ///
    pub fn configured_target(
        &self,
        context: &Context,
        key: ConfiguredTarget,
    ) -> BoxFuture<'static, async_map::Result<Arc<AnalysedTarget>>> {
        let analysis = self.clone();
        let context = context.clone();
        async move {
            let producer_key = key.clone();
            let producer_analysis = analysis.clone();
            analysis
                .inner
                .targets
                .get(&context, key, move |context| {
                    target_map::analyse_target(producer_analysis, context, producer_key).boxed()
                })
                .await
        }
        .boxed()
    }

    ///
    /// Analyses all requested targets. A failure in one branch does not suppress the
    /// analysis of the others, but the first failure is reported.
    ///
    pub async fn analyse(
        &self,
        context: &Context,
        targets: Vec<ConfiguredTarget>,
    ) -> Result<Vec<Arc<AnalysedTarget>>, Failure> {
        futures::future::try_join_all(
            targets
                .into_iter()
                .map(|target| self.configured_target(context, target)),
        )
        .await
    }
}
