// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The base consumers of the pipeline: parsed targets and rules files, directory
//! listings, and source targets. Each is memoised per key; a file is read and parsed at
//! most once per build, however many targets consume it.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_map::{Context, Failure};
use common::{normalize_path, ArtifactDescription};
use expression::{EntityName, Expr, ExprMap, TargetResult};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value as Json;

use crate::{AnalysedTarget, Analysis, ModuleName};

///
/// The file and subdirectory names of one module directory.
///
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirectoryEntries {
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
}

async fn read_json_file(path: PathBuf) -> Result<Arc<Json>, Failure> {
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        // A module without the file simply defines nothing.
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Arc::new(Json::Object(Default::default())))
        }
        Err(e) => {
            return Err(Failure::fatal(format!(
                "Failed to read {}: {e}",
                path.display()
            )))
        }
    };
    let json: Json = serde_json::from_slice(&bytes)
        .map_err(|e| Failure::fatal(format!("Malformed JSON in {}: {e}", path.display())))?;
    if json.is_object() {
        Ok(Arc::new(json))
    } else {
        Err(Failure::fatal(format!(
            "{} must contain a JSON object",
            path.display()
        )))
    }
}

impl Analysis {
    pub fn targets_file(
        &self,
        context: &Context,
        module: ModuleName,
    ) -> BoxFuture<'static, async_map::Result<Arc<Json>>> {
        let analysis = self.clone();
        let context = context.clone();
        async move {
            let file_name = {
                let info = analysis
                    .inner
                    .repositories
                    .info(&module.repository)
                    .map_err(Failure::fatal)?;
                info.root
                    .join(&module.module)
                    .join(&info.targets_file_name)
            };
            analysis
                .inner
                .targets_files
                .get(&context, module, move |_context| {
                    read_json_file(file_name).boxed()
                })
                .await
        }
        .boxed()
    }

    pub fn rules_file(
        &self,
        context: &Context,
        module: ModuleName,
    ) -> BoxFuture<'static, async_map::Result<Arc<Json>>> {
        let analysis = self.clone();
        let context = context.clone();
        async move {
            let file_name = {
                let info = analysis
                    .inner
                    .repositories
                    .info(&module.repository)
                    .map_err(Failure::fatal)?;
                info.root.join(&module.module).join(&info.rules_file_name)
            };
            analysis
                .inner
                .rules_files
                .get(&context, module, move |_context| {
                    read_json_file(file_name).boxed()
                })
                .await
        }
        .boxed()
    }

    pub fn directory(
        &self,
        context: &Context,
        module: ModuleName,
    ) -> BoxFuture<'static, async_map::Result<Arc<DirectoryEntries>>> {
        let analysis = self.clone();
        let context = context.clone();
        async move {
            let root = analysis
                .inner
                .repositories
                .root(&module.repository)
                .map_err(Failure::fatal)?
                .join(&module.module);
            analysis
                .inner
                .directory_entries
                .get(&context, module, move |_context| {
                    async move {
                        let mut entries = DirectoryEntries::default();
                        let mut listing = match tokio::fs::read_dir(&root).await {
                            Ok(listing) => listing,
                            Err(e) if e.kind() == ErrorKind::NotFound => {
                                return Ok(Arc::new(entries))
                            }
                            Err(e) => {
                                return Err(Failure::fatal(format!(
                                    "Failed to list {}: {e}",
                                    root.display()
                                )))
                            }
                        };
                        loop {
                            match listing.next_entry().await {
                                Ok(Some(entry)) => {
                                    let name = entry.file_name().to_string_lossy().into_owned();
                                    let is_dir = entry
                                        .file_type()
                                        .await
                                        .map(|t| t.is_dir())
                                        .unwrap_or(false);
                                    if is_dir {
                                        entries.dirs.insert(name);
                                    } else {
                                        entries.files.insert(name);
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    return Err(Failure::fatal(format!(
                                        "Failed to list {}: {e}",
                                        root.display()
                                    )))
                                }
                            }
                        }
                        Ok(Arc::new(entries))
                    }
                    .boxed()
                })
                .await
        }
        .boxed()
    }

    pub fn rule(
        &self,
        context: &Context,
        name: EntityName,
    ) -> BoxFuture<'static, async_map::Result<Arc<crate::UserRule>>> {
        let analysis = self.clone();
        let context = context.clone();
        async move {
            let key = name.clone();
            let producer_analysis = analysis.clone();
            analysis
                .inner
                .rules
                .get(&context, key, move |context| {
                    async move {
                        let named = name
                            .as_named()
                            .ok_or_else(|| {
                                Failure::fatal(format!("{name} cannot name a rule"))
                            })?
                            .clone();
                        let module =
                            ModuleName::new(named.repository.clone(), named.module.clone());
                        let rules = producer_analysis.rules_file(&context, module).await?;
                        let desc = rules
                            .get(&named.name)
                            .ok_or_else(|| Failure::fatal(format!("Unknown rule {name}")))?;
                        let rule = crate::UserRule::from_json(named, desc).map_err(|e| {
                            Failure::fatal(e).decorate(format!("Malformed rule {name}"))
                        })?;
                        Ok(Arc::new(rule))
                    }
                    .boxed()
                })
                .await
        }
        .boxed()
    }

    ///
    /// A file in the source tree, lifted to an analysed target staging exactly that file.
    ///
    pub fn source_target(
        &self,
        context: &Context,
        name: EntityName,
    ) -> BoxFuture<'static, async_map::Result<Arc<AnalysedTarget>>> {
        let analysis = self.clone();
        let context = context.clone();
        async move {
            let key = name.clone();
            let producer_analysis = analysis.clone();
            analysis
                .inner
                .sources
                .get(&context, key, move |context| {
                    async move {
                        let named = name
                            .as_named()
                            .ok_or_else(|| {
                                Failure::fatal(format!("{name} cannot name a source file"))
                            })?
                            .clone();
                        let module =
                            ModuleName::new(named.repository.clone(), named.module.clone());
                        let entries = producer_analysis.directory(&context, module).await?;
                        if !entries.files.contains(&named.name) {
                            return Err(Failure::fatal(format!(
                                "{name} does not name a source file"
                            )));
                        }
                        let path = normalize_path(&format!("{}/{}", named.module, named.name));
                        let artifact = Expr::artifact(ArtifactDescription::local(
                            &path,
                            &named.repository,
                        ));
                        let mut stage = ExprMap::new();
                        stage.insert(named.name.clone(), artifact);
                        let stage = Expr::map(stage);
                        let result =
                            TargetResult::new(stage.clone(), Expr::empty_map(), stage);
                        Ok(Arc::new(AnalysedTarget::from_result(result)))
                    }
                    .boxed()
                })
                .await
        }
        .boxed()
    }
}

///
/// The module a named target's definitions live in.
pub fn module_of(name: &EntityName) -> Option<ModuleName> {
    name.as_named()
        .map(|named| ModuleName::new(named.repository.clone(), named.module.clone()))
}

///
/// The module named by a tree reference: the referenced directory itself.
pub fn tree_module_of(name: &EntityName) -> Option<ModuleName> {
    name.as_named().map(|named| {
        ModuleName::new(
            named.repository.clone(),
            normalize_path(&format!("{}/{}", named.module, named.name)),
        )
    })
}

