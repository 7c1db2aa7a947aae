// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{ArtifactId, ObjectInfo};
use dag::{ActionContent, ActionNodeId, ArtifactNodeId, DependencyGraph, Readiness};
use futures::future::{self, BoxFuture, FutureExt};

use crate::{ExecutionApi, ExecutionRequest};

///
/// The outcome of one traversal: for every requested artifact, either its content or the
/// proximate cause of its failure. A failed branch never prevents unrelated requested
/// artifacts from being reported as built.
///
#[derive(Debug)]
pub struct BuildReport {
    pub results: Vec<(ArtifactId, Result<ObjectInfo, String>)>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ArtifactId, &String)> {
        self.results
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|e| (id, e)))
    }
}

///
/// Walks a completed dependency graph, uploading source artifacts and executing actions
/// in topological readiness order through the given executor. Every node is processed at
/// most once per graph, however many artifacts request it and however often `traverse`
/// is called.
///
pub struct Traverser {
    graph: Arc<DependencyGraph>,
    api: Arc<dyn ExecutionApi>,
    fatal: Arc<AtomicBool>,
}

impl Traverser {
    pub fn new(graph: Arc<DependencyGraph>, api: Arc<dyn ExecutionApi>) -> Traverser {
        Traverser {
            graph,
            api,
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    ///
    /// Stops the scheduling of any further nodes. Nodes already being processed run to
    /// completion.
    ///
    pub fn abort(&self) {
        self.fatal.store(true, Ordering::SeqCst);
    }

    ///
    /// Builds the requested artifacts. An empty request set means everything the graph
    /// declares.
    ///
    pub async fn traverse(&self, requested: &[ArtifactId]) -> BuildReport {
        let ids: Vec<ArtifactId> = if requested.is_empty() {
            self.graph.artifact_ids()
        } else {
            requested.to_vec()
        };
        let builds = ids.into_iter().map(|id| async move {
            let result = self.build_requested(&id).await;
            (id, result)
        });
        BuildReport {
            results: future::join_all(builds).await,
        }
    }

    async fn build_requested(&self, id: &ArtifactId) -> Result<ObjectInfo, String> {
        let node_id = self
            .graph
            .artifact_node_id(id)
            .ok_or_else(|| format!("Artifact {id} is not known to the graph"))?;
        self.ensure_artifact(node_id).await?;
        self.graph
            .artifact(node_id)
            .info()
            .copied()
            .ok_or_else(|| format!("Artifact {id} became available without content"))
    }

    fn ensure_artifact(&self, node_id: ArtifactNodeId) -> BoxFuture<'_, Result<(), String>> {
        async move {
            let node = self.graph.artifact(node_id);
            match node.state().claim() {
                Readiness::Available => Ok(()),
                Readiness::Failed => Err(format!("{} was not built", node.id())),
                Readiness::Pending(outcome) => match outcome.await {
                    Ok(true) => Ok(()),
                    _ => Err(format!("{} was not built", node.id())),
                },
                Readiness::Claimed => {
                    if self.fatal.load(Ordering::SeqCst) {
                        node.state().complete(false);
                        return Err("Build was aborted".to_string());
                    }
                    match node.producer() {
                        // The producing action completes all of its outputs, including
                        // this node.
                        Some(action_id) => self.ensure_action(action_id).await,
                        None => match self.api.ingest_source(node.description()).await {
                            Ok(info) => {
                                node.set_info(info);
                                node.state().complete(true);
                                Ok(())
                            }
                            Err(e) => {
                                node.state().complete(false);
                                Err(format!("Failed to provide {}: {e}", node.id()))
                            }
                        },
                    }
                }
            }
        }
        .boxed()
    }

    fn ensure_action(&self, action_id: ActionNodeId) -> BoxFuture<'_, Result<(), String>> {
        async move {
            let action = self.graph.action(action_id);
            match action.state().claim() {
                Readiness::Available => Ok(()),
                Readiness::Failed => {
                    Err(format!("Action {} failed", action.content().id()))
                }
                Readiness::Pending(outcome) => match outcome.await {
                    Ok(true) => Ok(()),
                    _ => Err(format!("Action {} failed", action.content().id())),
                },
                Readiness::Claimed => {
                    let result = self.run_action(action_id).await;
                    let success = result.is_ok();
                    for (_, output) in action.outputs() {
                        self.graph.artifact(*output).state().complete(success);
                    }
                    action.state().complete(success);
                    result
                }
            }
        }
        .boxed()
    }

    ///
    /// Processes one claimed action: awaits its inputs, then executes it (or assembles
    /// its tree) and records the output contents. The caller owns the state transition.
    ///
    async fn run_action(&self, action_id: ActionNodeId) -> Result<(), String> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err("Build was aborted".to_string());
        }
        let action = self.graph.action(action_id);

        let input_results = future::join_all(
            action
                .inputs()
                .iter()
                .map(|(_, input)| self.ensure_artifact(*input)),
        )
        .await;
        for result in input_results {
            result.map_err(|e| {
                format!("Input of action {} failed: {e}", action.content().id())
            })?;
        }

        let mut inputs = Vec::with_capacity(action.inputs().len());
        for (path, input) in action.inputs() {
            let info = self
                .graph
                .artifact(*input)
                .info()
                .copied()
                .ok_or_else(|| format!("Input {path:?} is available without content"))?;
            inputs.push((path.clone(), info));
        }

        match action.content() {
            ActionContent::Tree(_) => {
                let info = self.api.upload_tree(inputs).await.map_err(|e| {
                    format!("Failed to build tree {}: {e}", action.content().id())
                })?;
                // A tree op has exactly one output: the tree artifact itself.
                for (_, output) in action.outputs() {
                    self.graph.artifact(*output).set_info(info);
                }
                Ok(())
            }
            ActionContent::Command(description) => {
                let request = ExecutionRequest::for_action(description, inputs);
                let response = self.api.execute(&request).await.map_err(|e| {
                    format!("Failed to execute action {}: {e}", description.id())
                })?;

                if response.exit_code != 0 {
                    match &description.action().may_fail {
                        Some(message) => {
                            log::warn!(
                                "Action {} failed (exit code {}): {}\n{}",
                                description.id(),
                                response.exit_code,
                                message,
                                String::from_utf8_lossy(&response.stderr)
                            );
                        }
                        None => {
                            return Err(format!(
                                "Action {} returned non-zero exit code {}:\n{}",
                                description.id(),
                                response.exit_code,
                                String::from_utf8_lossy(&response.stderr)
                            ));
                        }
                    }
                }

                for (path, output) in action.outputs() {
                    let info = response.artifacts.get(path).ok_or_else(|| {
                        format!(
                            "Action {} did not produce its declared output {path:?}",
                            description.id()
                        )
                    })?;
                    self.graph.artifact(*output).set_info(*info);
                }
                Ok(())
            }
        }
    }
}
