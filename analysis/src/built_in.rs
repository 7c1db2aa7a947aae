// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The built-in rules. They are dispatched before user-rule resolution and follow the
//! same contract as a user rule: each handler emits an analysed target registered under
//! the target's effective configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_map::{Context, Failure};
use common::{ActionDescription, ArtifactDescription, Tree};
use expression::{
    evaluate, parse_entity_name, Configuration, EntityName, Expr, ExprMap, FunctionMap,
    NamedTarget, TargetResult,
};
use futures::future::try_join_all;
use serde_json::Value as Json;

use crate::utils::{as_string_list, get_tainted, stage_union};
use crate::{AnalysedTarget, Analysis, ConfiguredTarget};

const BUILT_IN_RULES: &[&str] = &["export", "install", "generic", "file_gen", "tree", "configure"];

pub(crate) fn is_built_in(type_name: &str) -> bool {
    BUILT_IN_RULES.contains(&type_name)
}

pub(crate) async fn handle_built_in(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    named: NamedTarget,
    type_name: &str,
    desc: &Json,
) -> async_map::Result<Arc<AnalysedTarget>> {
    match type_name {
        "file_gen" => file_gen(analysis, key, named, desc),
        "generic" => generic(analysis, context, key, named, desc).await,
        "install" => install(analysis, context, key, named, desc).await,
        "tree" => tree(analysis, context, key, named, desc).await,
        "configure" => configure(analysis, context, key, named, desc).await,
        "export" => export(analysis, context, key, named, desc).await,
        other => Err(Failure::fatal(format!("Unknown built-in rule {other:?}"))),
    }
}

fn target_vars(desc: &Json) -> Result<Vec<String>, Failure> {
    match desc.get("arguments_config") {
        None => Ok(vec![]),
        Some(value) => as_string_list(&Expr::from_json(value), "arguments_config")
            .map_err(Failure::fatal),
    }
}

fn eval_field(
    desc: &Json,
    field: &str,
    default: Expr,
    config: &Configuration,
) -> Result<Expr, Failure> {
    let expr = desc.get(field).map(Expr::from_json).unwrap_or(default);
    evaluate(&expr, config, &FunctionMap::new()).map_err(|e| {
        Failure::fatal(e.to_string()).decorate(format!("While evaluating field {field}"))
    })
}

fn own_tainted(desc: &Json, config: &Configuration) -> Result<BTreeSet<String>, Failure> {
    let expr = desc
        .get("tainted")
        .map(Expr::from_json)
        .unwrap_or_else(Expr::empty_list);
    get_tainted(&expr, config)
}

fn check_dep_taints(
    tainted: &BTreeSet<String>,
    deps: &[Arc<AnalysedTarget>],
) -> Result<(), Failure> {
    for dep in deps {
        if !dep.tainted.is_subset(tainted) {
            return Err(Failure::fatal(
                "Not tainted with all strings the dependencies are tainted with".to_string(),
            ));
        }
    }
    Ok(())
}

fn parse_name_list(
    value: &Expr,
    field: &str,
    current: &NamedTarget,
) -> Result<Vec<EntityName>, Failure> {
    let entries = value.as_list().ok_or_else(|| {
        Failure::fatal(format!("Field {field} must evaluate to a list, but got {value}"))
    })?;
    entries
        .iter()
        .map(|entry| {
            parse_entity_name(entry, current).map_err(|e| {
                Failure::fatal(format!("Parsing entry {entry} in field {field} failed: {e}"))
            })
        })
        .collect()
}

async fn request_deps(
    analysis: &Analysis,
    context: &Context,
    names: &[EntityName],
    config: &Configuration,
) -> async_map::Result<Vec<Arc<AnalysedTarget>>> {
    try_join_all(names.iter().map(|name| {
        analysis.configured_target(context, ConfiguredTarget::new(name.clone(), config.clone()))
    }))
    .await
}

fn union_vars(
    own: &[String],
    deps: &[Arc<AnalysedTarget>],
) -> BTreeSet<String> {
    let mut vars: BTreeSet<String> = own.iter().cloned().collect();
    for dep in deps {
        vars.extend(dep.vars.iter().cloned());
    }
    vars
}

fn union_taints(
    own: BTreeSet<String>,
    deps: &[Arc<AnalysedTarget>],
) -> BTreeSet<String> {
    let mut tainted = own;
    for dep in deps {
        tainted.extend(dep.tainted.iter().cloned());
    }
    tainted
}

///
/// `file_gen`: a target whose single artifact is a literal blob of the evaluated `data`,
/// staged under the evaluated `name`.
///
fn file_gen(
    analysis: Analysis,
    key: ConfiguredTarget,
    named: NamedTarget,
    desc: &Json,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let vars = target_vars(desc)?;
    let config = key.config.prune(&vars);

    let name = eval_field(desc, "name", Expr::string(named.name.clone()), &config)?;
    let name = name
        .as_str()
        .ok_or_else(|| Failure::fatal(format!("file_gen name must be a string, got {name}")))?
        .to_string();
    let data = eval_field(desc, "data", Expr::string(""), &config)?;
    let data = data
        .as_str()
        .ok_or_else(|| Failure::fatal(format!("file_gen data must be a string, got {data}")))?
        .to_string();
    let tainted = own_tainted(desc, &config)?;

    let digest = analysis.inner.digests.blob_digest(data.as_bytes());
    let artifact = Expr::artifact(ArtifactDescription::known(digest, common::ObjectType::File));
    let mut stage = ExprMap::new();
    stage.insert(name, artifact);
    let stage = Expr::map(stage);

    let analysed = Arc::new(AnalysedTarget {
        result: TargetResult::new(stage.clone(), Expr::empty_map(), stage),
        actions: vec![],
        blobs: vec![data],
        trees: vec![],
        vars: vars.iter().cloned().collect(),
        tainted,
    });
    Ok(analysis.results().add(key.name.clone(), config, analysed))
}

///
/// `generic`: stages the union of its dependencies' artifacts and runs the given shell
/// commands over them, declaring `outs` and `out_dirs`.
///
async fn generic(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    named: NamedTarget,
    desc: &Json,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let vars = target_vars(desc)?;
    let config = key.config.prune(&vars);

    let deps_value = eval_field(desc, "deps", Expr::empty_list(), &config)?;
    let dep_names = parse_name_list(&deps_value, "deps", &named)?;
    let deps = request_deps(&analysis, &context, &dep_names, &key.config).await?;

    let cmds = eval_field(desc, "cmds", Expr::empty_list(), &config)?;
    let cmds = as_string_list(&cmds, "cmds").map_err(Failure::fatal)?;
    let mut outs = eval_field(desc, "outs", Expr::empty_list(), &config)
        .and_then(|v| as_string_list(&v, "outs").map_err(Failure::fatal))?;
    let mut out_dirs = eval_field(desc, "out_dirs", Expr::empty_list(), &config)
        .and_then(|v| as_string_list(&v, "out_dirs").map_err(Failure::fatal))?;
    outs.sort();
    out_dirs.sort();
    if outs.is_empty() && out_dirs.is_empty() {
        return Err(Failure::fatal(
            "either outs or out_dirs must be specified for generic targets".to_string(),
        ));
    }
    let env_value = eval_field(desc, "env", Expr::empty_map(), &config)?;
    let env_map = env_value
        .as_map()
        .ok_or_else(|| Failure::fatal(format!("env must be a map, but got {env_value}")))?;
    let mut env = BTreeMap::new();
    for (name, value) in env_map.iter() {
        let value = value.as_str().ok_or_else(|| {
            Failure::fatal(format!("env must map to strings, but got {value} for {name}"))
        })?;
        env.insert(name.clone(), value.to_string());
    }

    let tainted = union_taints(own_tainted(desc, &config)?, &deps);
    check_dep_taints(&tainted, &deps)?;

    let input_stage = stage_union(
        deps.iter().map(|dep| &dep.result.artifact_stage),
        "inputs of generic target",
    )
    .map_err(Failure::fatal)?;
    let inputs: BTreeMap<String, ArtifactDescription> = input_stage
        .as_map()
        .expect("stage_union returns a map")
        .iter()
        .map(|(path, artifact)| {
            (
                path.clone(),
                artifact.as_artifact().expect("validated by stage_union").clone(),
            )
        })
        .collect();

    let description = ActionDescription::fresh(
        outs.clone(),
        out_dirs.clone(),
        vec!["sh".to_string(), "-c".to_string(), cmds.join("\n")],
        env,
        None,
        false,
        inputs,
    );
    let action_id = description.id().to_string();

    let mut stage = ExprMap::new();
    for output in outs.iter().chain(out_dirs.iter()) {
        stage.insert(
            output.clone(),
            Expr::artifact(ArtifactDescription::action(&action_id, output)),
        );
    }
    let stage = Expr::map(stage);

    let effective_vars = union_vars(&vars, &deps);
    let effective_conf = key.config.prune(&effective_vars);
    let analysed = Arc::new(AnalysedTarget {
        result: TargetResult::new(stage.clone(), Expr::empty_map(), stage),
        actions: vec![description],
        blobs: vec![],
        trees: vec![],
        vars: effective_vars,
        tainted,
    });
    Ok(analysis.results().add(key.name.clone(), effective_conf, analysed))
}

///
/// `install`: stages the union of its dependencies' artifacts, plus single artifacts
/// re-staged under explicit paths via `files`.
///
async fn install(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    named: NamedTarget,
    desc: &Json,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let vars = target_vars(desc)?;
    let config = key.config.prune(&vars);

    let deps_value = eval_field(desc, "deps", Expr::empty_list(), &config)?;
    let dep_names = parse_name_list(&deps_value, "deps", &named)?;
    let deps = request_deps(&analysis, &context, &dep_names, &key.config).await?;

    let mut stages: Vec<Expr> = deps.iter().map(|dep| dep.result.artifact_stage.clone()).collect();

    // `files` maps output paths to single-artifact targets.
    let mut file_deps: Vec<Arc<AnalysedTarget>> = Vec::new();
    if let Some(files) = desc.get("files") {
        let files = files
            .as_object()
            .ok_or_else(|| Failure::fatal("install files must be an object".to_string()))?;
        for (path, target) in files {
            let name = parse_entity_name(&Expr::from_json(target), &named).map_err(|e| {
                Failure::fatal(format!("Parsing install file target {target} failed: {e}"))
            })?;
            let dep = analysis
                .configured_target(
                    &context,
                    ConfiguredTarget::new(name.clone(), key.config.clone()),
                )
                .await?;
            let stage = dep.result.artifact_stage.as_map().ok_or_else(|| {
                Failure::fatal(format!("Install target {name} has a malformed stage"))
            })?;
            if stage.len() != 1 {
                return Err(Failure::fatal(format!(
                    "Install file {path:?} must name a target with exactly one artifact, \
                     but {name} stages {} artifacts",
                    stage.len()
                )));
            }
            let artifact = stage.values().next().unwrap().clone();
            let mut restaged = ExprMap::new();
            restaged.insert(common::normalize_path(path), artifact);
            stages.push(Expr::map(restaged));
            file_deps.push(dep);
        }
    }

    let stage = stage_union(stages.iter(), "install stage").map_err(Failure::fatal)?;

    let all_deps: Vec<Arc<AnalysedTarget>> =
        deps.iter().chain(file_deps.iter()).cloned().collect();
    let tainted = union_taints(own_tainted(desc, &config)?, &all_deps);
    check_dep_taints(&tainted, &all_deps)?;
    let effective_vars = union_vars(&vars, &all_deps);
    let effective_conf = key.config.prune(&effective_vars);

    let analysed = Arc::new(AnalysedTarget {
        result: TargetResult::new(stage.clone(), Expr::empty_map(), stage),
        actions: vec![],
        blobs: vec![],
        trees: vec![],
        vars: effective_vars,
        tainted,
    });
    Ok(analysis.results().add(key.name.clone(), effective_conf, analysed))
}

///
/// `tree`: collects the union of its dependencies' artifacts into a single tree artifact
/// staged under the target's name.
///
async fn tree(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    named: NamedTarget,
    desc: &Json,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let vars = target_vars(desc)?;
    let config = key.config.prune(&vars);

    let deps_value = eval_field(desc, "deps", Expr::empty_list(), &config)?;
    let dep_names = parse_name_list(&deps_value, "deps", &named)?;
    let deps = request_deps(&analysis, &context, &dep_names, &key.config).await?;

    let stage = stage_union(
        deps.iter().map(|dep| &dep.result.artifact_stage),
        "tree stage",
    )
    .map_err(Failure::fatal)?;
    let artifacts: BTreeMap<String, ArtifactDescription> = stage
        .as_map()
        .expect("stage_union returns a map")
        .iter()
        .map(|(path, artifact)| {
            (
                path.clone(),
                artifact.as_artifact().expect("validated by stage_union").clone(),
            )
        })
        .collect();
    let tree = Tree::new(artifacts);

    let tainted = union_taints(own_tainted(desc, &config)?, &deps);
    check_dep_taints(&tainted, &deps)?;
    let effective_vars = union_vars(&vars, &deps);
    let effective_conf = key.config.prune(&effective_vars);

    let mut stage = ExprMap::new();
    stage.insert(
        named.name.clone(),
        Expr::artifact(ArtifactDescription::tree(tree.id())),
    );
    let stage = Expr::map(stage);
    let analysed = Arc::new(AnalysedTarget {
        result: TargetResult::new(stage.clone(), Expr::empty_map(), stage),
        actions: vec![],
        blobs: vec![],
        trees: vec![tree],
        vars: effective_vars,
        tainted,
    });
    Ok(analysis.results().add(key.name.clone(), effective_conf, analysed))
}

///
/// `configure`: analyses the wrapped target under this configuration updated by the
/// evaluated `config` patch, passing its result through.
///
async fn configure(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    named: NamedTarget,
    desc: &Json,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let vars = target_vars(desc)?;
    let config = key.config.prune(&vars);

    let target_value = eval_field(desc, "target", Expr::none(), &config)?;
    let target = parse_entity_name(&target_value, &named).map_err(|e| {
        Failure::fatal(format!("Parsing configure target {target_value} failed: {e}"))
    })?;
    let patch = eval_field(desc, "config", Expr::empty_map(), &config)?;
    if !patch.is_map() {
        return Err(Failure::fatal(format!(
            "configure config must evaluate to a map, but got {patch}"
        )));
    }
    let transitioned = key.config.update(&patch).map_err(Failure::fatal)?;
    let patch_config = Configuration::new(patch).map_err(Failure::fatal)?;

    let dep = analysis
        .configured_target(&context, ConfiguredTarget::new(target, transitioned))
        .await?;

    let mut effective_vars: BTreeSet<String> = vars.iter().cloned().collect();
    for var in &dep.vars {
        if !patch_config.is_fixed(var) {
            effective_vars.insert(var.clone());
        }
    }
    let effective_conf = key.config.prune(&effective_vars);

    let analysed = Arc::new(AnalysedTarget {
        result: dep.result.clone(),
        actions: vec![],
        blobs: vec![],
        trees: vec![],
        vars: effective_vars,
        tainted: dep.tainted.clone(),
    });
    Ok(analysis.results().add(key.name.clone(), effective_conf, analysed))
}

///
/// `export`: restricts the configuration to the declared flexible variables, applies the
/// fixed configuration, and passes the wrapped target's result through. The export
/// surface is what makes a target's interface explicit enough to be shared.
///
async fn export(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    named: NamedTarget,
    desc: &Json,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let flexible = match desc.get("flexible_config") {
        None => vec![],
        Some(value) => as_string_list(&Expr::from_json(value), "flexible_config")
            .map_err(Failure::fatal)?,
    };
    let base = key.config.prune(&flexible);

    let fixed = eval_field(desc, "fixed_config", Expr::empty_map(), &base)?;
    if !fixed.is_map() {
        return Err(Failure::fatal(format!(
            "fixed_config must evaluate to a map, but got {fixed}"
        )));
    }
    let target_value = eval_field(desc, "target", Expr::none(), &base)?;
    let target = parse_entity_name(&target_value, &named).map_err(|e| {
        Failure::fatal(format!("Parsing export target {target_value} failed: {e}"))
    })?;

    let exported_config = base.update(&fixed).map_err(Failure::fatal)?;
    let dep = analysis
        .configured_target(&context, ConfiguredTarget::new(target, exported_config))
        .await?;

    let effective_conf = key.config.prune(&flexible);
    let analysed = Arc::new(AnalysedTarget {
        result: dep.result.clone(),
        actions: vec![],
        blobs: vec![],
        trees: vec![],
        vars: flexible.into_iter().collect(),
        tainted: dep.tainted.clone(),
    });
    Ok(analysis.results().add(key.name.clone(), effective_conf, analysed))
}
