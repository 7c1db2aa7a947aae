// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Subjective style.
#![allow(clippy::new_without_default, clippy::len_without_is_empty)]

use std::sync::OnceLock;

use common::{ActionDescription, ArtifactDescription, ArtifactId, ArtifactKind, ObjectInfo, Tree};
use fnv::FnvHashMap as HashMap;
use futures::channel::oneshot;
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ArtifactNodeId(usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ActionNodeId(usize);

///
/// The monotone per-node traversal state: `Unknown -> Scheduled -> Available | Failed`.
/// The transition into `Scheduled` is a first-claim: exactly one caller observes
/// `Readiness::Claimed` and becomes responsible for processing the node; everyone else
/// suspends until a terminal state is reached.
///
pub struct TraversalState {
    state: Mutex<StateInner>,
}

enum StateInner {
    Unknown,
    Scheduled(Vec<oneshot::Sender<bool>>),
    Available,
    Failed,
}

///
/// What a caller learned by asking for a node.
///
pub enum Readiness {
    /// The caller made the `Unknown -> Scheduled` transition and must process the node.
    Claimed,
    /// Someone else is processing the node; the receiver fires with the outcome.
    Pending(oneshot::Receiver<bool>),
    Available,
    Failed,
}

impl TraversalState {
    fn new() -> TraversalState {
        TraversalState {
            state: Mutex::new(StateInner::Unknown),
        }
    }

    pub fn claim(&self) -> Readiness {
        let mut state = self.state.lock();
        match &mut *state {
            StateInner::Unknown => {
                *state = StateInner::Scheduled(Vec::new());
                Readiness::Claimed
            }
            StateInner::Scheduled(waiters) => {
                let (send, recv) = oneshot::channel();
                waiters.push(send);
                Readiness::Pending(recv)
            }
            StateInner::Available => Readiness::Available,
            StateInner::Failed => Readiness::Failed,
        }
    }

    ///
    /// Moves the node into its terminal state and notifies all waiters. Terminal states
    /// are permanent: a second completion is ignored.
    ///
    pub fn complete(&self, success: bool) {
        let waiters = {
            let mut state = self.state.lock();
            match std::mem::replace(
                &mut *state,
                if success {
                    StateInner::Available
                } else {
                    StateInner::Failed
                },
            ) {
                StateInner::Scheduled(waiters) => waiters,
                StateInner::Unknown => Vec::new(),
                terminal => {
                    // Already terminal: restore and ignore.
                    *state = terminal;
                    return;
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(success);
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(*self.state.lock(), StateInner::Available)
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), StateInner::Failed)
    }
}

///
/// What an action node does when it runs: execute a command, or assemble a declared tree
/// object from its member artifacts.
///
pub enum ActionContent {
    Command(ActionDescription),
    Tree(Tree),
}

impl ActionContent {
    pub fn id(&self) -> &str {
        match self {
            ActionContent::Command(description) => description.id(),
            ActionContent::Tree(tree) => tree.id(),
        }
    }
}

pub struct ArtifactNode {
    description: ArtifactDescription,
    producer: Option<ActionNodeId>,
    consumers: Vec<ActionNodeId>,
    state: TraversalState,
    info: OnceLock<ObjectInfo>,
}

impl ArtifactNode {
    pub fn description(&self) -> &ArtifactDescription {
        &self.description
    }

    pub fn id(&self) -> &ArtifactId {
        self.description.id()
    }

    pub fn producer(&self) -> Option<ActionNodeId> {
        self.producer
    }

    pub fn consumers(&self) -> &[ActionNodeId] {
        &self.consumers
    }

    pub fn state(&self) -> &TraversalState {
        &self.state
    }

    ///
    /// Records the content of this artifact once it is known. The first write wins; the
    /// value never changes afterwards.
    ///
    pub fn set_info(&self, info: ObjectInfo) {
        let _ = self.info.set(info);
    }

    pub fn info(&self) -> Option<&ObjectInfo> {
        self.info.get()
    }
}

pub struct ActionNode {
    content: ActionContent,
    inputs: Vec<(String, ArtifactNodeId)>,
    outputs: Vec<(String, ArtifactNodeId)>,
    state: TraversalState,
}

impl ActionNode {
    pub fn content(&self) -> &ActionContent {
        &self.content
    }

    pub fn inputs(&self) -> &[(String, ArtifactNodeId)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(String, ArtifactNodeId)] {
        &self.outputs
    }

    pub fn state(&self) -> &TraversalState {
        &self.state
    }
}

///
/// The bipartite DAG of actions and artifacts a build traverses. Nodes are created during
/// analysis and never re-parented; only their traversal state mutates afterwards.
///
pub struct DependencyGraph {
    artifacts: Vec<ArtifactNode>,
    actions: Vec<ActionNode>,
    artifact_index: HashMap<ArtifactId, ArtifactNodeId>,
    action_index: HashMap<String, ActionNodeId>,
}

impl DependencyGraph {
    pub fn new() -> DependencyGraph {
        DependencyGraph {
            artifacts: Vec::new(),
            actions: Vec::new(),
            artifact_index: HashMap::default(),
            action_index: HashMap::default(),
        }
    }

    ///
    /// Registers the given action descriptions and their artifacts. Within and across
    /// calls, every artifact id maps to exactly one node and every action-output artifact
    /// has exactly one producing action. Actions are deduplicated by id (ids are content
    /// hashes, so equal ids mean equal actions).
    ///
    pub fn add(&mut self, descriptions: &[ActionDescription]) -> Result<(), String> {
        // First pass: create the action nodes and their output artifacts, so that inputs
        // referring to outputs of actions in this batch resolve regardless of order.
        let mut added: Vec<(ActionNodeId, &ActionDescription)> = Vec::new();
        for description in descriptions {
            if self.action_index.contains_key(description.id()) {
                continue;
            }
            let action_id = ActionNodeId(self.actions.len());
            self.actions.push(ActionNode {
                content: ActionContent::Command(description.clone()),
                inputs: Vec::new(),
                outputs: Vec::new(),
                state: TraversalState::new(),
            });
            self.action_index
                .insert(description.id().to_string(), action_id);
            for path in description.output_paths() {
                let artifact = ArtifactDescription::action(description.id(), path);
                let node_id = self.adopt_output(artifact, action_id)?;
                self.actions[action_id.0].outputs.push((path.clone(), node_id));
            }
            added.push((action_id, description));
        }

        // Second pass: wire the inputs.
        for (action_id, description) in added {
            for (path, artifact) in description.inputs() {
                let node_id = self.ensure_artifact(artifact.clone());
                self.artifacts[node_id.0].consumers.push(action_id);
                self.actions[action_id.0].inputs.push((path.clone(), node_id));
            }
        }
        Ok(())
    }

    ///
    /// Registers tree declarations. A tree materialises as a pseudo-action whose inputs
    /// are the member artifacts and whose single output is the tree artifact itself.
    /// Trees are deduplicated by id.
    ///
    pub fn add_trees(&mut self, trees: &[Tree]) -> Result<(), String> {
        for tree in trees {
            if self.action_index.contains_key(tree.id()) {
                continue;
            }
            let action_id = ActionNodeId(self.actions.len());
            self.actions.push(ActionNode {
                content: ActionContent::Tree(tree.clone()),
                inputs: Vec::new(),
                outputs: Vec::new(),
                state: TraversalState::new(),
            });
            self.action_index.insert(tree.id().to_string(), action_id);

            let output = self.adopt_output(ArtifactDescription::tree(tree.id()), action_id)?;
            self.actions[action_id.0].outputs.push((".".to_string(), output));

            for (path, artifact) in tree.artifacts() {
                let node_id = self.ensure_artifact(artifact.clone());
                self.artifacts[node_id.0].consumers.push(action_id);
                self.actions[action_id.0].inputs.push((path.clone(), node_id));
            }
        }
        Ok(())
    }

    fn adopt_output(
        &mut self,
        artifact: ArtifactDescription,
        producer: ActionNodeId,
    ) -> Result<ArtifactNodeId, String> {
        if let Some(&existing) = self.artifact_index.get(artifact.id()) {
            let node = &mut self.artifacts[existing.0];
            if node.producer.is_some() {
                return Err(format!(
                    "Artifact {} already has a producing action",
                    artifact.id()
                ));
            }
            node.producer = Some(producer);
            return Ok(existing);
        }
        let node_id = ArtifactNodeId(self.artifacts.len());
        self.artifact_index.insert(artifact.id().clone(), node_id);
        self.artifacts.push(ArtifactNode {
            description: artifact,
            producer: Some(producer),
            consumers: Vec::new(),
            state: TraversalState::new(),
            info: OnceLock::new(),
        });
        Ok(node_id)
    }

    fn ensure_artifact(&mut self, artifact: ArtifactDescription) -> ArtifactNodeId {
        if let Some(&existing) = self.artifact_index.get(artifact.id()) {
            return existing;
        }
        let node_id = ArtifactNodeId(self.artifacts.len());
        self.artifact_index.insert(artifact.id().clone(), node_id);
        self.artifacts.push(ArtifactNode {
            description: artifact,
            producer: None,
            consumers: Vec::new(),
            state: TraversalState::new(),
            info: OnceLock::new(),
        });
        node_id
    }

    pub fn artifact_node_id(&self, id: &ArtifactId) -> Option<ArtifactNodeId> {
        self.artifact_index.get(id).copied()
    }

    pub fn artifact(&self, id: ArtifactNodeId) -> &ArtifactNode {
        &self.artifacts[id.0]
    }

    pub fn action(&self, id: ActionNodeId) -> &ActionNode {
        &self.actions[id.0]
    }

    ///
    /// All artifact ids the graph declares, in registration order.
    ///
    pub fn artifact_ids(&self) -> Vec<ArtifactId> {
        self.artifacts.iter().map(|node| node.id().clone()).collect()
    }

    ///
    /// Source artifacts are the ones with no producing action: locals and knowns.
    ///
    pub fn is_source(&self, id: ArtifactNodeId) -> bool {
        let node = self.artifact(id);
        node.producer.is_none()
            && matches!(
                node.description.kind(),
                ArtifactKind::Local { .. } | ArtifactKind::Known { .. }
            )
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod tests;
