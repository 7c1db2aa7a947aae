// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{ExecutionApi, ExecutionRequest, ExecutionResponse, LocalApi, RemoteAddress, Traverser};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    ActionDescription, ArtifactDescription, ArtifactId, Blob, ObjectInfo, ObjectType,
    RepositoryConfig, RepositoryInfo,
};
use dag::DependencyGraph;
use hashing::{Digest, DigestFunction};
use parking_lot::Mutex;
use store::Store;
use task_executor::Executor;
use tempfile::TempDir;
use tokio::io::AsyncWrite;

///
/// An executor that fabricates outputs and records what it was asked to do, so traversal
/// order, at-most-once processing, and branch isolation can be asserted.
///
#[derive(Default)]
struct TestApi {
    uploaded: Mutex<Vec<ArtifactId>>,
    executed: Mutex<Vec<String>>,
    exit_codes: HashMap<String, i32>,
}

impl TestApi {
    fn with_exit_code(mut self, action_id: &str, exit_code: i32) -> TestApi {
        self.exit_codes.insert(action_id.to_string(), exit_code);
        self
    }

    fn uploads(&self) -> Vec<ArtifactId> {
        self.uploaded.lock().clone()
    }

    fn executions(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    fn fake_info(seed: &str) -> ObjectInfo {
        ObjectInfo::new(
            DigestFunction::Native.blob_digest(seed.as_bytes()),
            ObjectType::File,
        )
    }
}

#[async_trait]
impl ExecutionApi for TestApi {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, String> {
        self.executed.lock().push(request.action_id.clone());
        let exit_code = *self.exit_codes.get(&request.action_id).unwrap_or(&0);
        let artifacts: BTreeMap<String, ObjectInfo> = request
            .output_files
            .iter()
            .chain(request.output_dirs.iter())
            .map(|path| {
                (
                    path.clone(),
                    Self::fake_info(&format!("{}:{}", request.action_id, path)),
                )
            })
            .collect();
        Ok(ExecutionResponse {
            exit_code,
            stdout: Bytes::new(),
            stderr: Bytes::from_static(b"test stderr"),
            artifacts,
            is_cached: false,
        })
    }

    async fn upload(&self, _blobs: Vec<Blob>) -> Result<(), String> {
        Ok(())
    }

    async fn upload_tree(&self, entries: Vec<(String, ObjectInfo)>) -> Result<ObjectInfo, String> {
        let rendered: Vec<String> = entries
            .iter()
            .map(|(path, info)| format!("{path}={info}"))
            .collect();
        Ok(ObjectInfo::new(
            DigestFunction::Native.tree_digest(rendered.join("\n").as_bytes()),
            ObjectType::Tree,
        ))
    }

    async fn ingest_source(&self, artifact: &ArtifactDescription) -> Result<ObjectInfo, String> {
        self.uploaded.lock().push(artifact.id().clone());
        Ok(Self::fake_info(artifact.id().as_str()))
    }

    async fn is_available(&self, _digest: &Digest) -> bool {
        true
    }

    async fn missing(&self, _digests: &[Digest]) -> Vec<Digest> {
        vec![]
    }

    async fn retrieve_to_paths(
        &self,
        _infos: &[ObjectInfo],
        _paths: &[PathBuf],
    ) -> Result<(), String> {
        Ok(())
    }

    async fn retrieve_to_writers(
        &self,
        _infos: &[ObjectInfo],
        _writers: &mut [&mut (dyn AsyncWrite + Send + Unpin)],
        _raw_tree: bool,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn retrieve_to_cas(
        &self,
        _infos: &[ObjectInfo],
        _other: &dyn ExecutionApi,
    ) -> Result<(), String> {
        Ok(())
    }
}

fn action(
    id: &str,
    outputs: &[&str],
    inputs: &[(&str, ArtifactDescription)],
    may_fail: bool,
) -> ActionDescription {
    ActionDescription::new(
        outputs.iter().map(|s| s.to_string()).collect(),
        vec![],
        common::Action {
            id: id.to_string(),
            command: vec!["BUILD".to_string()],
            env: BTreeMap::new(),
            may_fail: may_fail.then(|| "action failed".to_string()),
            no_cache: false,
        },
        inputs
            .iter()
            .map(|(path, artifact)| (path.to_string(), artifact.clone()))
            .collect(),
    )
}

fn local(path: &str) -> ArtifactDescription {
    ArtifactDescription::local(path, "repo")
}

fn out(action_id: &str, path: &str) -> ArtifactId {
    ArtifactDescription::action(action_id, path).id().clone()
}

fn lib_exe_graph() -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    graph
        .add(&[
            action(
                "make_exe",
                &["executable"],
                &[
                    ("main.cpp", local("main.cpp")),
                    ("library", ArtifactDescription::action("make_lib", "library")),
                ],
                false,
            ),
            action(
                "make_lib",
                &["library"],
                &[
                    ("library.hpp", local("library.hpp")),
                    ("library.cpp", local("library.cpp")),
                ],
                false,
            ),
        ])
        .unwrap();
    graph
}

fn assert_same_elements(actual: Vec<ArtifactId>, expected: Vec<ArtifactId>) {
    let actual: HashSet<ArtifactId> = actual.into_iter().collect();
    let expected: HashSet<ArtifactId> = expected.into_iter().collect();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn single_executable_target() {
    for requested in [vec![], vec![out("action", "executable")]] {
        let mut graph = DependencyGraph::new();
        graph
            .add(&[action(
                "action",
                &["executable"],
                &[("main.cpp", local("main.cpp"))],
                false,
            )])
            .unwrap();
        let api = Arc::new(TestApi::default());
        let traverser = Traverser::new(Arc::new(graph), api.clone());

        let report = traverser.traverse(&requested).await;
        assert!(report.success(), "{:?}", report);
        assert_eq!(api.executions(), vec!["action".to_string()]);
        // The local input was uploaded exactly once.
        assert_same_elements(api.uploads(), vec![local("main.cpp").id().clone()]);
    }
}

#[tokio::test]
async fn executable_depends_on_library() {
    // Full build via the executable.
    let api = Arc::new(TestApi::default());
    let traverser = Traverser::new(Arc::new(lib_exe_graph()), api.clone());
    let report = traverser.traverse(&[out("make_exe", "executable")]).await;
    assert!(report.success(), "{:?}", report);
    let executed: HashSet<String> = api.executions().into_iter().collect();
    assert_eq!(
        executed,
        HashSet::from(["make_exe".to_string(), "make_lib".to_string()])
    );
    assert_same_elements(
        api.uploads(),
        vec![
            local("main.cpp").id().clone(),
            local("library.hpp").id().clone(),
            local("library.cpp").id().clone(),
        ],
    );

    // Only the library: the executable's sources are never touched.
    let api = Arc::new(TestApi::default());
    let traverser = Traverser::new(Arc::new(lib_exe_graph()), api.clone());
    let report = traverser.traverse(&[out("make_lib", "library")]).await;
    assert!(report.success(), "{:?}", report);
    assert_eq!(api.executions(), vec!["make_lib".to_string()]);
    assert_same_elements(
        api.uploads(),
        vec![
            local("library.hpp").id().clone(),
            local("library.cpp").id().clone(),
        ],
    );
}

#[tokio::test]
async fn two_outputs_one_consumer() {
    let mut graph = DependencyGraph::new();
    let output1 = ArtifactDescription::action("make_outputs", "output1");
    let output2 = ArtifactDescription::action("make_outputs", "output2");
    graph
        .add(&[
            action("make_outputs", &["output1", "output2"], &[], false),
            action("consumer1", &["exec1"], &[("output1", output1.clone())], false),
            action("consumer2", &["exec2"], &[("output2", output2.clone())], false),
        ])
        .unwrap();
    let graph = Arc::new(graph);
    let api = Arc::new(TestApi::default());
    let traverser = Traverser::new(graph.clone(), api.clone());

    let report = traverser.traverse(&[out("consumer1", "exec1")]).await;
    assert!(report.success(), "{:?}", report);
    // The producing action ran once, and both of its outputs became available.
    assert_eq!(
        api.executions(),
        vec!["make_outputs".to_string(), "consumer1".to_string()]
    );
    let output2_node = graph.artifact_node_id(output2.id()).unwrap();
    assert!(graph.artifact(output2_node).state().is_available());
}

#[tokio::test]
async fn shared_input_uploaded_once_across_wide_fan_in() {
    let mut graph = DependencyGraph::new();
    let shared = local("shared.h");
    let actions: Vec<ActionDescription> = (0..16)
        .map(|i| {
            action(
                &format!("compile{i}"),
                &[&format!("out{i}")],
                &[("shared.h", shared.clone())],
                false,
            )
        })
        .collect();
    graph.add(&actions).unwrap();
    let api = Arc::new(TestApi::default());
    let traverser = Traverser::new(Arc::new(graph), api.clone());

    let report = traverser.traverse(&[]).await;
    assert!(report.success(), "{:?}", report);
    assert_eq!(api.uploads(), vec![shared.id().clone()]);
}

#[tokio::test]
async fn may_fail_actions_complete_with_their_outputs() {
    let mut graph = DependencyGraph::new();
    graph
        .add(&[action("flaky", &["log"], &[], true)])
        .unwrap();
    let api = Arc::new(TestApi::default().with_exit_code("flaky", 1));
    let traverser = Traverser::new(Arc::new(graph), api.clone());

    let report = traverser.traverse(&[out("flaky", "log")]).await;
    assert!(report.success(), "{:?}", report);
    assert_eq!(report.results[0].1.as_ref().unwrap().object_type, ObjectType::File);
}

#[tokio::test]
async fn failures_do_not_abort_unrelated_branches() {
    let mut graph = DependencyGraph::new();
    graph
        .add(&[
            action("broken", &["bad"], &[], false),
            action("dependent", &["worse"], &[("bad", ArtifactDescription::action("broken", "bad"))], false),
            action("healthy", &["good"], &[], false),
        ])
        .unwrap();
    let api = Arc::new(TestApi::default().with_exit_code("broken", 1));
    let traverser = Traverser::new(Arc::new(graph), api.clone());

    let report = traverser
        .traverse(&[out("dependent", "worse"), out("healthy", "good")])
        .await;
    assert!(!report.success());

    let failures: Vec<(&ArtifactId, &String)> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, &out("dependent", "worse"));
    assert!(failures[0].1.contains("non-zero exit code 1"), "{}", failures[0].1);

    let healthy = report
        .results
        .iter()
        .find(|(id, _)| id == &out("healthy", "good"))
        .unwrap();
    assert!(healthy.1.is_ok());
}

#[tokio::test]
async fn consecutive_traversals_share_completed_work() {
    let api = Arc::new(TestApi::default());
    let traverser = Traverser::new(Arc::new(lib_exe_graph()), api.clone());

    let report = traverser.traverse(&[out("make_lib", "library")]).await;
    assert!(report.success(), "{:?}", report);
    assert_eq!(api.executions(), vec!["make_lib".to_string()]);

    let report = traverser.traverse(&[out("make_exe", "executable")]).await;
    assert!(report.success(), "{:?}", report);
    // The library action did not run again.
    assert_eq!(
        api.executions(),
        vec!["make_lib".to_string(), "make_exe".to_string()]
    );
    // No source was uploaded twice.
    let uploads = api.uploads();
    let unique: HashSet<ArtifactId> = uploads.iter().cloned().collect();
    assert_eq!(uploads.len(), unique.len());
}

#[tokio::test]
async fn tree_actions_assemble_their_members() {
    let mut graph = DependencyGraph::new();
    let member = local("data.txt");
    let tree = common::Tree::new(
        [("data.txt".to_string(), member.clone())]
            .into_iter()
            .collect(),
    );
    graph.add_trees(&[tree.clone()]).unwrap();
    let api = Arc::new(TestApi::default());
    let traverser = Traverser::new(Arc::new(graph), api.clone());

    let tree_id = ArtifactDescription::tree(tree.id()).id().clone();
    let report = traverser.traverse(&[tree_id]).await;
    assert!(report.success(), "{:?}", report);
    assert_eq!(report.results[0].1.as_ref().unwrap().object_type, ObjectType::Tree);
    assert_same_elements(api.uploads(), vec![member.id().clone()]);
}

#[tokio::test]
async fn unknown_requested_artifacts_are_reported() {
    let graph = Arc::new(DependencyGraph::new());
    let traverser = Traverser::new(graph, Arc::new(TestApi::default()));
    let report = traverser.traverse(&[local("nowhere").id().clone()]).await;
    assert!(!report.success());
    assert!(report.results[0].1.as_ref().unwrap_err().contains("not known"));
}

#[test]
fn remote_address_parsing() {
    assert_eq!(
        RemoteAddress::parse("cache.example.com:8980").unwrap(),
        RemoteAddress {
            host: "cache.example.com".to_string(),
            port: 8980,
        }
    );
    RemoteAddress::parse("no-port").expect_err("Want err");
    RemoteAddress::parse(":8980").expect_err("Want err");
    RemoteAddress::parse("host:not-a-port").expect_err("Want err");
    RemoteAddress::parse("host:99999").expect_err("Want err");
}

//
// Local execution against real processes.
//

#[cfg(unix)]
mod local_execution {
    use super::*;

    struct LocalFixture {
        _store_dir: TempDir,
        repo_dir: TempDir,
        api: LocalApi,
    }

    fn fixture() -> LocalFixture {
        let store_dir = TempDir::new().unwrap();
        let repo_dir = TempDir::new().unwrap();
        let store = Store::new(Executor::new(), store_dir.path(), DigestFunction::Native).unwrap();
        let repositories = RepositoryConfig::new()
            .with_repository("repo", RepositoryInfo::new(repo_dir.path()));
        LocalFixture {
            _store_dir: store_dir,
            repo_dir,
            api: LocalApi::new(store, repositories),
        }
    }

    fn shell(action_id: &str, script: &str, outputs: &[&str]) -> ExecutionRequest {
        ExecutionRequest {
            action_id: action_id.to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            inputs: vec![],
            output_files: outputs.iter().map(|s| s.to_string()).collect(),
            output_dirs: vec![],
            timeout: None,
            no_cache: false,
        }
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let f = fixture();
        let mut request = shell("echoes", "printf foo; printf bar >&2; exit 3", &[]);
        request.no_cache = true;
        let response = f.api.execute(&request).await.unwrap();
        assert_eq!(response.exit_code, 3);
        assert_eq!(response.stdout, Bytes::from_static(b"foo"));
        assert_eq!(response.stderr, Bytes::from_static(b"bar"));
        assert!(!response.is_cached);
    }

    #[tokio::test]
    async fn environment_is_cleared_and_explicit() {
        let f = fixture();
        let mut request = shell("env", "printf \"$FOO:$HOME\" > out", &["out"]);
        request.env.insert("FOO".to_string(), "foo".to_string());
        let response = f.api.execute(&request).await.unwrap();
        assert_eq!(response.exit_code, 0);
        let info = response.artifacts.get("out").unwrap();
        assert_eq!(
            f.api.store().load_object(info).unwrap(),
            Bytes::from_static(b"foo:")
        );
    }

    #[tokio::test]
    async fn stages_inputs_and_scans_outputs() {
        let f = fixture();
        let digest = f
            .api
            .store()
            .store_blob(Bytes::from_static(b"hello"), false)
            .await
            .unwrap();
        let mut request = shell("copy", "cat sub/in.txt sub/in.txt > out.txt", &["out.txt"]);
        request.inputs = vec![(
            "sub/in.txt".to_string(),
            ObjectInfo::new(digest, ObjectType::File),
        )];
        let response = f.api.execute(&request).await.unwrap();
        assert_eq!(response.exit_code, 0, "{:?}", response);
        let info = response.artifacts.get("out.txt").unwrap();
        assert_eq!(
            f.api.store().load_object(info).unwrap(),
            Bytes::from_static(b"hellohello")
        );
    }

    #[tokio::test]
    async fn scans_output_directories_into_trees() {
        let f = fixture();
        let mut request = shell(
            "treegen",
            "mkdir -p gen/sub && printf a > gen/f && printf b > gen/sub/g",
            &[],
        );
        request.output_dirs = vec!["gen".to_string()];
        let response = f.api.execute(&request).await.unwrap();
        assert_eq!(response.exit_code, 0);
        let info = response.artifacts.get("gen").unwrap();
        assert_eq!(info.object_type, ObjectType::Tree);
        let leaves = f
            .api
            .store()
            .recursively_read_tree_leaves(&info.digest, std::path::Path::new(""))
            .unwrap();
        let names: HashSet<PathBuf> = leaves.into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            names,
            HashSet::from([PathBuf::from("f"), PathBuf::from("sub/g")])
        );
    }

    #[tokio::test]
    async fn successful_executions_hit_the_action_cache() {
        let f = fixture();
        let request = shell("cached", "printf once > out", &["out"]);
        let first = f.api.execute(&request).await.unwrap();
        assert!(!first.is_cached);
        let second = f.api.execute(&request).await.unwrap();
        assert!(second.is_cached);
        assert_eq!(first.artifacts, second.artifacts);
    }

    #[tokio::test]
    async fn non_zero_exits_are_never_cached() {
        let f = fixture();
        let request = shell("flaky", "printf partial > out; exit 1", &["out"]);

        let first = f.api.execute(&request).await.unwrap();
        assert_eq!(first.exit_code, 1);
        assert!(!first.is_cached);
        // The declared output was still recorded.
        assert!(first.artifacts.contains_key("out"));

        // A second run re-executes: failures never populate the cache.
        let second = f.api.execute(&request).await.unwrap();
        assert_eq!(second.exit_code, 1);
        assert!(!second.is_cached);
    }

    #[tokio::test]
    async fn ingest_source_reads_the_repository_root() {
        let f = fixture();
        std::fs::create_dir_all(f.repo_dir.path().join("src")).unwrap();
        std::fs::write(f.repo_dir.path().join("src/main.cpp"), b"int main() {}").unwrap();

        let artifact = ArtifactDescription::local("src/main.cpp", "repo");
        let info = f.api.ingest_source(&artifact).await.unwrap();
        assert_eq!(info.object_type, ObjectType::File);
        assert_eq!(
            f.api.store().load_object(&info).unwrap(),
            Bytes::from_static(b"int main() {}")
        );

        let unknown = ArtifactDescription::local("src/main.cpp", "other");
        f.api.ingest_source(&unknown).await.expect_err("Want err");
    }

    #[tokio::test]
    async fn retrieve_to_paths_materializes_files_and_trees() {
        let f = fixture();
        let digest = f
            .api
            .store()
            .store_blob(Bytes::from_static(b"content"), false)
            .await
            .unwrap();
        let file_info = ObjectInfo::new(digest, ObjectType::File);
        let tree_info = f
            .api
            .store()
            .store_tree_from_entries(vec![("nested/file".to_string(), file_info)])
            .await
            .unwrap();

        let target = TempDir::new().unwrap();
        let file_path = target.path().join("plain.txt");
        let tree_path = target.path().join("unpacked");
        f.api
            .retrieve_to_paths(&[file_info, tree_info], &[file_path.clone(), tree_path.clone()])
            .await
            .unwrap();
        assert_eq!(std::fs::read(&file_path).unwrap(), b"content");
        assert_eq!(
            std::fs::read(tree_path.join("nested/file")).unwrap(),
            b"content"
        );
    }

    #[tokio::test]
    async fn end_to_end_traversal_with_real_processes() {
        let f = fixture();
        std::fs::write(f.repo_dir.path().join("greeting.txt"), b"hello").unwrap();

        let mut graph = DependencyGraph::new();
        let source = ArtifactDescription::local("greeting.txt", "repo");
        let upper = ActionDescription::new(
            vec!["upper.txt".to_string()],
            vec![],
            common::Action {
                id: "upper".to_string(),
                command: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "tr a-z A-Z < greeting.txt > upper.txt".to_string(),
                ],
                env: BTreeMap::new(),
                may_fail: None,
                no_cache: false,
            },
            [("greeting.txt".to_string(), source.clone())].into_iter().collect(),
        );
        let banner = ActionDescription::new(
            vec!["banner.txt".to_string()],
            vec![],
            common::Action {
                id: "banner".to_string(),
                command: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "printf '= '; cat upper.txt > banner.txt && printf ' =' >> banner.txt"
                        .to_string(),
                ],
                env: BTreeMap::new(),
                may_fail: None,
                no_cache: false,
            },
            [(
                "upper.txt".to_string(),
                ArtifactDescription::action("upper", "upper.txt"),
            )]
            .into_iter()
            .collect(),
        );
        graph.add(&[upper, banner]).unwrap();

        let api = Arc::new(f.api.clone());
        let traverser = Traverser::new(Arc::new(graph), api.clone());
        let report = traverser
            .traverse(&[ArtifactDescription::action("banner", "banner.txt").id().clone()])
            .await;
        assert!(report.success(), "{:?}", report);

        let info = report.results[0].1.as_ref().unwrap();
        assert_eq!(
            api.store().load_object(info).unwrap(),
            Bytes::from_static(b"HELLO =")
        );
    }
}
