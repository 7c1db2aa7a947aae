// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The driver of the analysis pipeline: resolves one configured target into an analysed
//! target, requesting targets files, rules, sources, and dependency targets through the
//! memoising consumers as it goes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_map::{Context, Failure};
use common::{normalize_path, tree_conflict, ActionDescription, ArtifactDescription, Tree};
use expression::{
    evaluate, parse_entity_name, parse_entity_name_from_json, AbstractNode, AnonymousTarget,
    Configuration, EntityName, EvaluationError, Evaluator, Expr, ExprMap, FunctionMap,
    NamedTarget, ReferenceKind, TargetNode, TargetResult,
};
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::maps::{module_of, tree_module_of};
use crate::utils::{
    as_string_list, as_transition_list, get_tainted, normalized_artifact_stage,
};
use crate::{built_in, AnalysedTarget, Analysis, ConfiguredTarget, UserRule};

type DepsByTransition = HashMap<ConfiguredTarget, Arc<AnalysedTarget>>;

pub(crate) async fn analyse_target(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
) -> async_map::Result<Arc<AnalysedTarget>> {
    match &key.name {
        EntityName::Anonymous(anonymous) => {
            let anonymous = anonymous.clone();
            with_target_node(analysis, context, key.clone(), anonymous).await
        }
        EntityName::Named(named) => match named.reference {
            ReferenceKind::Tree => {
                let named = named.clone();
                tree_target(analysis, context, key.clone(), named)
                    .await
                    .map_err(|e| {
                        e.decorate(format!(
                            "While analysing {} as explicit tree reference",
                            key.name
                        ))
                    })
            }
            ReferenceKind::File => analysis
                .source_target(&context, key.name.clone())
                .await
                .map_err(|e| {
                    e.decorate(format!(
                        "While analysing target {} as explicit source target",
                        key.name
                    ))
                }),
            ReferenceKind::Target => {
                let named = named.clone();
                with_targets_file(analysis, context, key, named).await
            }
        },
    }
}

async fn with_targets_file(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    named: NamedTarget,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let module = module_of(&key.name).expect("named target has a module");
    let targets_file = analysis
        .targets_file(&context, module)
        .await
        .map_err(|e| {
            e.decorate(format!(
                "While searching targets description for {}",
                key.name
            ))
        })?;

    let Some(desc) = targets_file.get(&named.name) else {
        // Not a defined target, treat as a source target.
        let source_name = EntityName::Named(NamedTarget::new(
            named.repository.clone(),
            &named.module,
            named.name.clone(),
            ReferenceKind::File,
        ));
        return analysis
            .source_target(&context, source_name)
            .await
            .map_err(|e| {
                e.decorate(format!(
                    "While analysing target {} as implicit source target",
                    key.name
                ))
            });
    };

    let type_value = desc.get("type").ok_or_else(|| {
        Failure::fatal(format!(
            "No type specified in the definition of target {}",
            key.name
        ))
    })?;

    // Built-in rules take precedence over user rules of the same name.
    if let Some(type_name) = type_value.as_str() {
        if built_in::is_built_in(type_name) {
            return built_in::handle_built_in(
                analysis.clone(),
                context,
                key.clone(),
                named,
                type_name,
                desc,
            )
            .await
            .map_err(|e| {
                e.decorate(format!(
                    "While analysing {type_name} target {}",
                    key.name
                ))
            });
        }
    }

    let rule_name = parse_entity_name_from_json(type_value, &named).map_err(|e| {
        Failure::fatal(format!(
            "Parsing rule name {type_value} for target {} failed with: {e}",
            key.name
        ))
    })?;
    let rule = analysis
        .rule(&context, rule_name.clone())
        .await
        .map_err(|e| e.decorate(format!("While looking up rule for {}", key.name)))?;
    let data = TargetData::from_desc(&rule, &named, desc).map_err(|e| {
        Failure::fatal(format!(
            "Failed to read data from target {} with rule {rule_name}: {e}",
            key.name
        ))
    })?;
    with_rule_definition(analysis, context, rule, data, key.clone())
        .await
        .map_err(|e| {
            e.decorate(format!(
                "While analysing {rule_name} target {}",
                key.name
            ))
        })
}

async fn with_target_node(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    anonymous: AnonymousTarget,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let node = anonymous
        .target_node
        .as_node()
        .ok_or_else(|| Failure::fatal(format!("{} is not a target node", key.name)))?
        .clone();
    match node {
        TargetNode::Value(result) => {
            // A fixed value node: the analysed target is the result itself.
            let result = result
                .as_result()
                .ok_or_else(|| {
                    Failure::fatal(format!("Value node of {} is not a result", key.name))
                })?
                .clone();
            Ok(Arc::new(AnalysedTarget::from_result(result)))
        }
        TargetNode::Abstract(abs) => {
            let rule_name = anonymous
                .rule_map
                .as_map()
                .and_then(|map| map.get(&abs.node_type))
                .and_then(|expr| expr.as_name())
                .cloned()
                .ok_or_else(|| {
                    Failure::fatal(format!(
                        "Cannot resolve type of node {:?} via rule map {}",
                        abs.node_type, anonymous.rule_map
                    ))
                })?;
            let rule = analysis
                .rule(&context, rule_name.clone())
                .await
                .map_err(|e| e.decorate(format!("While looking up rule for {}", key.name)))?;
            let data =
                TargetData::from_target_node(&rule, &abs, &anonymous.rule_map).map_err(|e| {
                    Failure::fatal(format!(
                        "Failed to read data from target {} with rule {rule_name}: {e}",
                        key.name
                    ))
                })?;
            with_rule_definition(analysis, context, rule, data, key.clone())
                .await
                .map_err(|e| {
                    e.decorate(format!(
                        "While analysing {rule_name} anonymous target {}",
                        key.name
                    ))
                })
        }
    }
}

async fn tree_target(
    analysis: Analysis,
    context: Context,
    key: ConfiguredTarget,
    named: NamedTarget,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let module = tree_module_of(&key.name).expect("named target has a module");
    let entries = analysis.directory(&context, module.clone()).await?;

    let mut dependencies = Vec::with_capacity(entries.files.len() + entries.dirs.len());
    for file in &entries.files {
        dependencies.push(ConfiguredTarget::new(
            EntityName::Named(NamedTarget::new(
                named.repository.clone(),
                &module.module,
                file.clone(),
                ReferenceKind::File,
            )),
            Configuration::empty(),
        ));
    }
    for dir in &entries.dirs {
        dependencies.push(ConfiguredTarget::new(
            EntityName::Named(NamedTarget::new(
                named.repository.clone(),
                &module.module,
                dir.clone(),
                ReferenceKind::Tree,
            )),
            Configuration::empty(),
        ));
    }

    let values = try_join_all(
        dependencies
            .into_iter()
            .map(|dependency| analysis.configured_target(&context, dependency)),
    )
    .await?;

    let mut artifacts: BTreeMap<String, ArtifactDescription> = BTreeMap::new();
    for value in &values {
        let runfiles = value
            .result
            .runfiles
            .as_map()
            .ok_or_else(|| Failure::fatal("Tree entry has malformed runfiles".to_string()))?;
        let (path, artifact) = runfiles.iter().next().ok_or_else(|| {
            Failure::fatal("Tree entry has no runfiles to stage".to_string())
        })?;
        let artifact = artifact.as_artifact().ok_or_else(|| {
            Failure::fatal(format!("Tree entry {path:?} is not an artifact"))
        })?;
        artifacts.insert(normalize_path(path), artifact.clone());
    }

    let tree = Tree::new(artifacts);
    let mut stage = ExprMap::new();
    stage.insert(
        named.name.clone(),
        Expr::artifact(ArtifactDescription::tree(tree.id())),
    );
    let stage = Expr::map(stage);
    let result = TargetResult::new(stage.clone(), Expr::empty_map(), stage);
    let analysed = Arc::new(AnalysedTarget {
        result,
        actions: vec![],
        blobs: vec![],
        trees: vec![tree],
        vars: BTreeSet::new(),
        tainted: BTreeSet::new(),
    });
    Ok(analysis
        .results()
        .add(key.name.clone(), Configuration::empty(), analysed))
}

///
/// The field expressions of one target, extracted either from its targets-file entry or
/// from an abstract target node.
///
pub(crate) struct TargetData {
    target_vars: Vec<String>,
    config_exprs: HashMap<String, Expr>,
    string_exprs: HashMap<String, Expr>,
    target_exprs: HashMap<String, Expr>,
    tainted_expr: Expr,
    parse_target_names: bool,
}

impl TargetData {
    fn from_desc(rule: &UserRule, named: &NamedTarget, desc: &Json) -> Result<TargetData, String> {
        let desc = desc
            .as_object()
            .ok_or_else(|| "Target description must be an object".to_string())?;
        let expected = rule.expected_fields();
        for key in desc.keys() {
            let known = expected.contains(key)
                || matches!(key.as_str(), "type" | "arguments_config" | "tainted");
            if !known {
                log::warn!(
                    "Field {key:?} of target {} is not used by rule {}",
                    named.name,
                    rule.name.name
                );
            }
        }

        let target_vars = match desc.get("arguments_config") {
            None => vec![],
            Some(Json::Array(entries)) => entries
                .iter()
                .map(|entry| {
                    entry
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| "arguments_config must be a list of strings".to_string())
                })
                .collect::<Result<Vec<String>, String>>()?,
            Some(_) => return Err("arguments_config must be a list of strings".to_string()),
        };
        let tainted_expr = desc
            .get("tainted")
            .map(Expr::from_json)
            .unwrap_or_else(Expr::empty_list);

        let read = |fields: &[String]| -> HashMap<String, Expr> {
            fields
                .iter()
                .map(|field| {
                    let expr = desc
                        .get(field)
                        .map(Expr::from_json)
                        .unwrap_or_else(Expr::empty_list);
                    (field.clone(), expr)
                })
                .collect()
        };

        Ok(TargetData {
            target_vars,
            config_exprs: read(&rule.config_fields),
            string_exprs: read(&rule.string_fields),
            target_exprs: read(&rule.target_fields),
            tainted_expr,
            parse_target_names: true,
        })
    }

    fn from_target_node(
        rule: &UserRule,
        abs: &AbstractNode,
        rule_map: &Expr,
    ) -> Result<TargetData, String> {
        let string_fields = abs
            .string_fields
            .as_map()
            .ok_or_else(|| "string_fields of abstract node must be a map".to_string())?;
        let target_fields = abs
            .target_fields
            .as_map()
            .ok_or_else(|| "target_fields of abstract node must be a map".to_string())?;

        let mut config_exprs = HashMap::new();
        for field in &rule.config_fields {
            if target_fields.contains_key(field) {
                return Err(format!(
                    "Expected config field {field:?} in string_fields of abstract node \
                     type {:?}, and not in target_fields",
                    abs.node_type
                ));
            }
            config_exprs.insert(
                field.clone(),
                string_fields.get(field).cloned().unwrap_or_else(Expr::empty_list),
            );
        }

        let mut string_exprs = HashMap::new();
        for field in &rule.string_fields {
            if target_fields.contains_key(field) {
                return Err(format!(
                    "Expected string field {field:?} in string_fields of abstract node \
                     type {:?}, and not in target_fields",
                    abs.node_type
                ));
            }
            string_exprs.insert(
                field.clone(),
                string_fields.get(field).cloned().unwrap_or_else(Expr::empty_list),
            );
        }

        let mut target_exprs = HashMap::new();
        for field in &rule.target_fields {
            if string_fields.contains_key(field) {
                return Err(format!(
                    "Expected target field {field:?} in target_fields of abstract node \
                     type {:?}, and not in string_fields",
                    abs.node_type
                ));
            }
            let nodes = target_fields
                .get(field)
                .cloned()
                .unwrap_or_else(Expr::empty_list);
            let nodes = nodes
                .as_list()
                .ok_or_else(|| format!("target_fields entry {field:?} must be a list"))?;
            // Lift every provided node into an anonymous target under this rule map.
            let names: Vec<Expr> = nodes
                .iter()
                .map(|node| {
                    Expr::name(EntityName::Anonymous(AnonymousTarget {
                        rule_map: rule_map.clone(),
                        target_node: node.clone(),
                    }))
                })
                .collect();
            target_exprs.insert(field.clone(), Expr::list(names));
        }

        Ok(TargetData {
            target_vars: vec![],
            config_exprs,
            string_exprs,
            target_exprs,
            tainted_expr: Expr::empty_list(),
            parse_target_names: false,
        })
    }
}

fn field_function(params: Arc<HashMap<String, Expr>>) -> FunctionMap {
    let mut functions = FunctionMap::new();
    functions.insert("FIELD", move |eval: &Evaluator, form: &Expr, env: &Configuration| {
        let name = eval.eval_arg(form, "name", Expr::none(), env)?;
        let name = name.as_str().ok_or_else(|| {
            EvaluationError::new(format!(
                "FIELD argument 'name' should evaluate to a string, but got {name}"
            ))
        })?;
        params
            .get(name)
            .cloned()
            .ok_or_else(|| EvaluationError::new(format!("FIELD {name:?} unknown")))
    });
    functions
}

///
/// Resolves the dependency a function-map form refers to: the `dep` argument names the
/// target (a name value, or a string parsed relative to the requesting target), and the
/// optional `transition` argument selects among the configurations it was requested
/// under.
///
fn obtain_target(
    eval: &Evaluator,
    form: &Expr,
    env: &Configuration,
    current: &Option<NamedTarget>,
    deps: &DepsByTransition,
) -> Result<Arc<AnalysedTarget>, EvaluationError> {
    let dep = eval.eval_arg(form, "dep", Expr::none(), env)?;
    let name = match dep.as_name() {
        Some(name) => name.clone(),
        None => {
            let current = current.as_ref().ok_or_else(|| {
                EvaluationError::new(format!(
                    "Dependency reference {dep} cannot be parsed without a requesting \
                     target"
                ))
            })?;
            parse_entity_name(&dep, current).map_err(EvaluationError::new)?
        }
    };
    let transition = eval.eval_arg(form, "transition", Expr::empty_map(), env)?;
    let transition = Configuration::new(transition).map_err(EvaluationError::new)?;
    deps.get(&ConfiguredTarget::new(name.clone(), transition))
        .cloned()
        .ok_or_else(|| {
            EvaluationError::new(format!("Reference to undeclared dependency {name}"))
        })
}

async fn with_rule_definition(
    analysis: Analysis,
    context: Context,
    rule: Arc<UserRule>,
    data: TargetData,
    key: ConfiguredTarget,
) -> async_map::Result<Arc<AnalysedTarget>> {
    let param_config = key.config.prune(&data.target_vars);
    let current_target = key.name.as_named().cloned();

    // Evaluate the config fields.
    let mut params: HashMap<String, Expr> = HashMap::new();
    for field in &rule.config_fields {
        let expr = &data.config_exprs[field];
        let value = evaluate(expr, &param_config, &FunctionMap::new()).map_err(|e| {
            Failure::fatal(e.to_string())
                .decorate(format!("While evaluating config field {field}"))
        })?;
        as_string_list(&value, &format!("Config field {field}")).map_err(Failure::fatal)?;
        params.insert(field.clone(), value);
    }

    // Evaluate the config transitions for every dependency-carrying field.
    let transition_functions = field_function(Arc::new(params.clone()));
    let expression_config = key.config.prune(&rule.config_vars);
    let mut config_transitions: HashMap<String, Vec<Expr>> = HashMap::new();
    let transition_fields = rule
        .target_fields
        .iter()
        .chain(rule.implicit_targets.keys())
        .chain(rule.anonymous_definitions.keys());
    for field in transition_fields {
        let expr = rule.transition_for(field);
        let value = evaluate(&expr, &expression_config, &transition_functions).map_err(|e| {
            Failure::fatal(e.to_string())
                .decorate(format!("While evaluating config transition for {field}"))
        })?;
        let transitions = as_transition_list(&value, &format!("Config transition for {field}"))
            .map_err(Failure::fatal)?;
        config_transitions.insert(field.clone(), transitions);
    }

    // Request the dependency targets, remembering which request positions feed each
    // anonymous definition.
    let mut anon_positions: HashMap<String, Vec<usize>> = rule
        .anonymous_definitions
        .values()
        .map(|def| (def.target.clone(), Vec::new()))
        .collect();
    let mut dependency_keys: Vec<ConfiguredTarget> = Vec::new();
    let mut transition_keys: Vec<ConfiguredTarget> = Vec::new();

    let mut request_field = |field: &str,
                             dep_names: Vec<EntityName>,
                             params: &mut HashMap<String, Expr>|
     -> Result<(), Failure> {
        params.insert(
            field.to_string(),
            Expr::list(dep_names.iter().cloned().map(Expr::name).collect()),
        );
        for transition in &config_transitions[field] {
            let transitioned = key.config.update(transition).map_err(Failure::fatal)?;
            let transition_config =
                Configuration::new(transition.clone()).map_err(Failure::fatal)?;
            for dep in &dep_names {
                if let Some(positions) = anon_positions.get_mut(field) {
                    positions.push(dependency_keys.len());
                }
                dependency_keys
                    .push(ConfiguredTarget::new(dep.clone(), transitioned.clone()));
                transition_keys
                    .push(ConfiguredTarget::new(dep.clone(), transition_config.clone()));
            }
        }
        Ok(())
    };

    for field in &rule.target_fields {
        let expr = &data.target_exprs[field];
        let value = evaluate(expr, &param_config, &FunctionMap::new()).map_err(|e| {
            Failure::fatal(e.to_string())
                .decorate(format!("While evaluating target parameter {field}"))
        })?;
        let entries = value.as_list().ok_or_else(|| {
            Failure::fatal(format!(
                "Target parameter {field} should evaluate to a list, but got {value}"
            ))
        })?;
        let mut dep_names = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = if data.parse_target_names {
                let current = current_target.as_ref().ok_or_else(|| {
                    Failure::fatal("Cannot parse target names without a named target".to_string())
                })?;
                parse_entity_name(entry, current).map_err(|e| {
                    Failure::fatal(format!(
                        "Parsing entry {entry} in target field {field} failed with: {e}"
                    ))
                })?
            } else {
                entry
                    .as_name()
                    .cloned()
                    .ok_or_else(|| {
                        Failure::fatal(format!(
                            "Target field {field} must contain names, but found {entry}"
                        ))
                    })?
            };
            dep_names.push(name);
        }
        request_field(field, dep_names, &mut params)?;
    }
    for (field, implicit) in &rule.implicit_targets {
        request_field(field, implicit.clone(), &mut params)?;
    }

    // Await the dependency targets.
    let mut dependency_values = try_join_all(
        dependency_keys
            .iter()
            .map(|dependency| analysis.configured_target(&context, dependency.clone())),
    )
    .await?;

    // Now that all non-anonymous targets are analysed, read their provider maps to
    // construct and request the anonymous targets.
    let mut anonymous_keys: Vec<ConfiguredTarget> = Vec::new();
    for (field, def) in &rule.anonymous_definitions {
        let mut anon_names: Vec<EntityName> = Vec::new();
        for &position in &anon_positions[&def.target] {
            let provided = dependency_values[position].result.provides.clone();
            let nodes = provided
                .as_map()
                .and_then(|map| map.get(&def.provider).cloned())
                .ok_or_else(|| {
                    Failure::fatal(format!(
                        "Provider {} in {} does not exist",
                        def.provider, def.target
                    ))
                })?;
            let nodes = nodes.as_list().ok_or_else(|| {
                Failure::fatal(format!(
                    "Provider {} in {} must be a list of target nodes but found: {nodes}",
                    def.provider, def.target
                ))
            })?;
            for node in nodes {
                if !node.is_node() {
                    return Err(Failure::fatal(format!(
                        "Entry in provider {} in {} must be a target node but found: {node}",
                        def.provider, def.target
                    )));
                }
                anon_names.push(EntityName::Anonymous(AnonymousTarget {
                    rule_map: def.rule_map.clone(),
                    target_node: node.clone(),
                }));
            }
        }

        for transition in &config_transitions[field] {
            let transitioned = key.config.update(transition).map_err(Failure::fatal)?;
            let transition_config =
                Configuration::new(transition.clone()).map_err(Failure::fatal)?;
            for anon in &anon_names {
                anonymous_keys.push(ConfiguredTarget::new(anon.clone(), transitioned.clone()));
                transition_keys
                    .push(ConfiguredTarget::new(anon.clone(), transition_config.clone()));
            }
        }
        params.insert(
            field.clone(),
            Expr::list(anon_names.into_iter().map(Expr::name).collect()),
        );
    }

    let anonymous_values = try_join_all(
        anonymous_keys
            .iter()
            .map(|dependency| analysis.configured_target(&context, dependency.clone())),
    )
    .await?;
    dependency_values.extend(anonymous_values);

    with_dependencies(
        analysis,
        rule,
        data,
        key,
        current_target,
        params,
        transition_keys,
        dependency_values,
        param_config,
        expression_config,
    )
}

fn with_dependencies(
    analysis: Analysis,
    rule: Arc<UserRule>,
    data: TargetData,
    key: ConfiguredTarget,
    current_target: Option<NamedTarget>,
    mut params: HashMap<String, Expr>,
    transition_keys: Vec<ConfiguredTarget>,
    dependency_values: Vec<Arc<AnalysedTarget>>,
    param_config: Configuration,
    expression_config: Configuration,
) -> async_map::Result<Arc<AnalysedTarget>> {
    // Associate dependency keys with values.
    let deps_by_transition: DepsByTransition = transition_keys
        .iter()
        .cloned()
        .zip(dependency_values.iter().cloned())
        .collect();

    // Compute the effective dependency on configuration variables: a variable a
    // dependency reads flows through unless the transition to it fixed the variable.
    let mut effective_vars: BTreeSet<String> = data.target_vars.iter().cloned().collect();
    effective_vars.extend(rule.config_vars.iter().cloned());
    for (transition, target) in transition_keys.iter().zip(dependency_values.iter()) {
        for var in &target.vars {
            if !transition.config.is_fixed(var) {
                effective_vars.insert(var.clone());
            }
        }
    }
    let effective_conf = key.config.prune(&effective_vars);

    // Compute and verify taintedness.
    let mut tainted = get_tainted(&data.tainted_expr, &param_config)?;
    tainted.extend(rule.tainted.iter().cloned());
    for dependency in &dependency_values {
        if !dependency.tainted.is_subset(&tainted) {
            return Err(Failure::fatal(
                "Not tainted with all strings the dependencies are tainted with".to_string(),
            ));
        }
    }

    // Evaluate the string fields, which may ask dependencies for their staging paths.
    let deps = Arc::new(deps_by_transition);
    let string_field_functions = {
        let mut functions = FunctionMap::new();
        let outs_deps = deps.clone();
        let outs_target = current_target.clone();
        functions.insert("outs", move |eval: &Evaluator, form: &Expr, env: &Configuration| {
            let target = obtain_target(eval, form, env, &outs_target, &outs_deps)?;
            let stage = target.result.artifact_stage.as_map().ok_or_else(|| {
                EvaluationError::new("Dependency has a malformed artifact stage")
            })?;
            Ok(Expr::list(stage.keys().map(Expr::string).collect()))
        });
        let runfiles_deps = deps.clone();
        let runfiles_target = current_target.clone();
        functions.insert(
            "runfiles",
            move |eval: &Evaluator, form: &Expr, env: &Configuration| {
                let target = obtain_target(eval, form, env, &runfiles_target, &runfiles_deps)?;
                let runfiles = target.result.runfiles.as_map().ok_or_else(|| {
                    EvaluationError::new("Dependency has malformed runfiles")
                })?;
                Ok(Expr::list(runfiles.keys().map(Expr::string).collect()))
            },
        );
        functions
    };
    for field in &rule.string_fields {
        let expr = &data.string_exprs[field];
        let value = evaluate(expr, &param_config, &string_field_functions).map_err(|e| {
            Failure::fatal(e.to_string())
                .decorate(format!("While evaluating string field {field}"))
        })?;
        as_string_list(&value, &format!("String field {field}")).map_err(Failure::fatal)?;
        params.insert(field.clone(), value);
    }

    // Evaluate the rule's defining expression.
    let actions: Arc<Mutex<Vec<ActionDescription>>> = Arc::new(Mutex::new(vec![]));
    let blobs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
    let trees: Arc<Mutex<Vec<Tree>>> = Arc::new(Mutex::new(vec![]));
    let functions = main_function_map(
        analysis.inner.digests,
        rule.clone(),
        Arc::new(params),
        deps,
        current_target,
        actions.clone(),
        blobs.clone(),
        trees.clone(),
    );
    let result = evaluate(&rule.expression, &expression_config, &functions).map_err(|e| {
        Failure::fatal(e.to_string())
            .decorate("While evaluating defining expression of rule".to_string())
    })?;
    let result = result
        .as_result()
        .cloned()
        .ok_or_else(|| {
            Failure::fatal(format!(
                "Defining expression should evaluate to a RESULT, but got: {result}"
            ))
        })?;

    let analysed = Arc::new(AnalysedTarget {
        result,
        actions: std::mem::take(&mut *actions.lock()),
        blobs: std::mem::take(&mut *blobs.lock()),
        trees: std::mem::take(&mut *trees.lock()),
        vars: effective_vars,
        tainted,
    });
    Ok(analysis
        .results()
        .add(key.name.clone(), effective_conf, analysed))
}

fn main_function_map(
    digests: hashing::DigestFunction,
    rule: Arc<UserRule>,
    params: Arc<HashMap<String, Expr>>,
    deps: Arc<DepsByTransition>,
    current_target: Option<NamedTarget>,
    actions: Arc<Mutex<Vec<ActionDescription>>>,
    blobs: Arc<Mutex<Vec<String>>>,
    trees: Arc<Mutex<Vec<Tree>>>,
) -> FunctionMap {
    let mut functions = field_function(params);

    let artifacts_deps = deps.clone();
    let artifacts_target = current_target.clone();
    functions.insert("DEP_ARTIFACTS", move |eval: &Evaluator, form: &Expr, env: &Configuration| {
        let target = obtain_target(eval, form, env, &artifacts_target, &artifacts_deps)?;
        Ok(target.result.artifact_stage.clone())
    });

    let runfiles_deps = deps.clone();
    let runfiles_target = current_target.clone();
    functions.insert("DEP_RUNFILES", move |eval: &Evaluator, form: &Expr, env: &Configuration| {
        let target = obtain_target(eval, form, env, &runfiles_target, &runfiles_deps)?;
        Ok(target.result.runfiles.clone())
    });

    let provides_deps = deps;
    let provides_target = current_target;
    functions.insert("DEP_PROVIDES", move |eval: &Evaluator, form: &Expr, env: &Configuration| {
        let target = obtain_target(eval, form, env, &provides_target, &provides_deps)?;
        let provider = eval.eval_arg(form, "provider", Expr::none(), env)?;
        let provider = provider.as_str().ok_or_else(|| {
            EvaluationError::new(format!(
                "DEP_PROVIDES argument 'provider' must be a string, but got {provider}"
            ))
        })?;
        match target
            .result
            .provides
            .as_map()
            .and_then(|map| map.get(provider))
        {
            Some(value) => Ok(value.clone()),
            None => eval.eval_arg(form, "default", Expr::empty_list(), env),
        }
    });

    let action_rule = rule;
    let action_collector = actions;
    functions.insert("ACTION", move |eval: &Evaluator, form: &Expr, env: &Configuration| {
        action_function(eval, form, env, &action_rule, &action_collector)
    });

    let blob_collector = blobs;
    functions.insert("BLOB", move |eval: &Evaluator, form: &Expr, env: &Configuration| {
        let data = eval.eval_arg(form, "data", Expr::string(""), env)?;
        let data = data.as_str().ok_or_else(|| {
            EvaluationError::new(format!("BLOB data has to be a string, but got {data}"))
        })?;
        let digest = digests.blob_digest(data.as_bytes());
        blob_collector.lock().push(data.to_string());
        Ok(Expr::artifact(ArtifactDescription::known(
            digest,
            common::ObjectType::File,
        )))
    });

    let tree_collector = trees;
    functions.insert("TREE", move |eval: &Evaluator, form: &Expr, env: &Configuration| {
        tree_function(eval, form, env, &tree_collector)
    });

    functions.insert("VALUE_NODE", |eval: &Evaluator, form: &Expr, env: &Configuration| {
        let value = eval.eval_arg(form, "$1", Expr::none(), env)?;
        if !value.is_result() {
            return Err(EvaluationError::new(
                "argument '$1' for VALUE_NODE not a RESULT type",
            ));
        }
        Ok(Expr::node(TargetNode::Value(value)))
    });

    functions.insert("ABSTRACT_NODE", |eval: &Evaluator, form: &Expr, env: &Configuration| {
        abstract_node_function(eval, form, env)
    });

    functions.insert("RESULT", |eval: &Evaluator, form: &Expr, env: &Configuration| {
        let artifacts = eval.eval_arg(form, "artifacts", Expr::empty_map(), env)?;
        let runfiles = eval.eval_arg(form, "runfiles", Expr::empty_map(), env)?;
        let provides = eval.eval_arg(form, "provides", Expr::empty_map(), env)?;
        for (what, value) in [("artifacts", &artifacts), ("runfiles", &runfiles)] {
            let map = value.as_map().ok_or_else(|| {
                EvaluationError::new(format!(
                    "{what} has to be a map of artifacts, but found {value}"
                ))
            })?;
            for (path, entry) in map.iter() {
                if !entry.is_artifact() {
                    return Err(EvaluationError::new(format!(
                        "{what} has to be a map of artifacts, but found {entry} for {path}"
                    )));
                }
            }
        }
        if !provides.is_map() {
            return Err(EvaluationError::new(format!(
                "provides has to be a map, but found {provides}"
            )));
        }
        Ok(Expr::result(TargetResult::new(artifacts, provides, runfiles)))
    });

    functions
}

fn action_function(
    eval: &Evaluator,
    form: &Expr,
    env: &Configuration,
    rule: &UserRule,
    actions: &Mutex<Vec<ActionDescription>>,
) -> Result<Expr, EvaluationError> {
    let inputs_value = eval.eval_arg(form, "inputs", Expr::empty_map(), env)?;
    let inputs_map = inputs_value.as_map().ok_or_else(|| {
        EvaluationError::new(format!(
            "inputs has to be a map of artifacts, but found {inputs_value}"
        ))
    })?;
    let stage = normalized_artifact_stage(inputs_map, "inputs").map_err(EvaluationError::new)?;
    let inputs: BTreeMap<String, ArtifactDescription> = stage
        .iter()
        .map(|(path, artifact)| {
            (
                path.clone(),
                artifact.as_artifact().expect("validated above").clone(),
            )
        })
        .collect();

    let read_outputs = |key: &str| -> Result<Vec<String>, EvaluationError> {
        let value = eval.eval_arg(form, key, Expr::empty_list(), env)?;
        let mut outputs = as_string_list(&value, key).map_err(EvaluationError::new)?;
        for output in outputs.iter_mut() {
            *output = normalize_path(output);
            if *output == ".." || output.starts_with("../") || *output == "." {
                return Err(EvaluationError::new(format!(
                    "{key} path {output:?} is not a valid output path"
                )));
            }
        }
        outputs.sort();
        Ok(outputs)
    };
    let outputs = read_outputs("outs")?;
    let output_dirs = read_outputs("out_dirs")?;
    if outputs.is_empty() && output_dirs.is_empty() {
        return Err(EvaluationError::new(
            "either outs or out_dirs must be specified for ACTION",
        ));
    }
    let mut all_outputs: Vec<&str> = outputs
        .iter()
        .chain(output_dirs.iter())
        .map(String::as_str)
        .collect();
    all_outputs.sort_unstable();
    for window in all_outputs.windows(2) {
        if window[0] == window[1] {
            return Err(EvaluationError::new(
                "outs and out_dirs for ACTION must be disjoint",
            ));
        }
    }

    let cmd_value = eval.eval_arg(form, "cmd", Expr::empty_list(), env)?;
    let cmd = as_string_list(&cmd_value, "cmd").map_err(EvaluationError::new)?;
    if cmd.is_empty() {
        return Err(EvaluationError::new("cmd must not be an empty list"));
    }

    let env_value = eval.eval_arg(form, "env", Expr::empty_map(), env)?;
    let env_map = env_value.as_map().ok_or_else(|| {
        EvaluationError::new(format!("env has to be a map of strings, but found {env_value}"))
    })?;
    let mut action_env = BTreeMap::new();
    for (name, value) in env_map.iter() {
        let value = value.as_str().ok_or_else(|| {
            EvaluationError::new(format!(
                "env has to be a map of strings, but found {env_value}"
            ))
        })?;
        action_env.insert(name.clone(), value.to_string());
    }

    let read_taint_list = |key: &str| -> Result<Vec<String>, EvaluationError> {
        let value = expression::literal_arg(form, key, Expr::empty_list());
        let entries = as_string_list(&value, key).map_err(EvaluationError::new)?;
        for entry in &entries {
            if !rule.tainted.contains(entry) {
                return Err(EvaluationError::new(format!(
                    "{key} contains entry {entry:?} the rule is not tainted with"
                )));
            }
        }
        Ok(entries)
    };
    let may_fail_entries = read_taint_list("may_fail")?;
    let may_fail = if may_fail_entries.is_empty() {
        None
    } else {
        let message = eval.eval_arg(form, "fail_message", Expr::string("action failed"), env)?;
        let message = message.as_str().ok_or_else(|| {
            EvaluationError::new(format!(
                "fail_message has to evaluate to a string, but got {message}"
            ))
        })?;
        Some(message.to_string())
    };
    let no_cache = !read_taint_list("no_cache")?.is_empty();

    let description = ActionDescription::fresh(
        outputs.clone(),
        output_dirs.clone(),
        cmd,
        action_env,
        may_fail,
        no_cache,
        inputs,
    );
    let action_id = description.id().to_string();
    actions.lock().push(description);

    let mut result = ExprMap::new();
    for output in outputs.iter().chain(output_dirs.iter()) {
        result.insert(
            output.clone(),
            Expr::artifact(ArtifactDescription::action(&action_id, output)),
        );
    }
    Ok(Expr::map(result))
}

fn tree_function(
    eval: &Evaluator,
    form: &Expr,
    env: &Configuration,
    trees: &Mutex<Vec<Tree>>,
) -> Result<Expr, EvaluationError> {
    let value = eval.eval_arg(form, "$1", Expr::empty_map(), env)?;
    let map = value.as_map().ok_or_else(|| {
        EvaluationError::new(format!(
            "TREE argument has to be a map of artifacts, but found {value}"
        ))
    })?;
    let mut artifacts: BTreeMap<String, ArtifactDescription> = BTreeMap::new();
    for (path, artifact) in map.iter() {
        let description = artifact.as_artifact().ok_or_else(|| {
            EvaluationError::new(format!(
                "TREE argument has to be a map of artifacts, but found {artifact} for {path}"
            ))
        })?;
        let normalized = normalize_path(path);
        if normalized == "." {
            if map.len() > 1 {
                return Err(EvaluationError::new(
                    "input path '.' or '' for TREE is only allowed for trees with a \
                     single input artifact",
                ));
            }
            if !description.is_tree() {
                return Err(EvaluationError::new(
                    "input path '.' or '' for TREE must be a tree artifact",
                ));
            }
            return Ok(artifact.clone());
        }
        if normalized == ".." || normalized.starts_with("../") {
            return Err(EvaluationError::new(format!(
                "TREE path {path:?} escapes the tree"
            )));
        }
        artifacts.insert(normalized, description.clone());
    }
    if let Some(conflict) = tree_conflict(artifacts.keys().map(String::as_str)) {
        return Err(EvaluationError::new(format!(
            "TREE conflicts on subtree {conflict:?}"
        )));
    }
    let tree = Tree::new(artifacts);
    let artifact = Expr::artifact(ArtifactDescription::tree(tree.id()));
    trees.lock().push(tree);
    Ok(artifact)
}

fn abstract_node_function(
    eval: &Evaluator,
    form: &Expr,
    env: &Configuration,
) -> Result<Expr, EvaluationError> {
    let node_type = eval.eval_arg(form, "node_type", Expr::none(), env)?;
    let node_type = node_type
        .as_str()
        .ok_or_else(|| {
            EvaluationError::new("argument 'node_type' for ABSTRACT_NODE not a string")
        })?
        .to_string();
    let string_fields = eval.eval_arg(form, "string_fields", Expr::empty_map(), env)?;
    let string_map = string_fields.as_map().ok_or_else(|| {
        EvaluationError::new("argument 'string_fields' for ABSTRACT_NODE not a map")
    })?;
    let target_fields = eval.eval_arg(form, "target_fields", Expr::empty_map(), env)?;
    let target_map = target_fields.as_map().ok_or_else(|| {
        EvaluationError::new("argument 'target_fields' for ABSTRACT_NODE not a map")
    })?;

    for (key, list) in string_map.iter() {
        let entries = list.as_list().ok_or_else(|| {
            EvaluationError::new(format!(
                "value for key {key} in argument 'string_fields' for ABSTRACT_NODE is \
                 not a list"
            ))
        })?;
        for entry in entries {
            if !entry.is_string() {
                return Err(EvaluationError::new(format!(
                    "list entry for {key} in argument 'string_fields' for ABSTRACT_NODE \
                     is not a string: {entry}"
                )));
            }
        }
        if target_map.contains_key(key) {
            return Err(EvaluationError::new(format!(
                "string_fields and target_fields are not disjoint maps, found duplicate \
                 key: {key}"
            )));
        }
    }
    for (key, list) in target_map.iter() {
        let entries = list.as_list().ok_or_else(|| {
            EvaluationError::new(format!(
                "value for key {key} in argument 'target_fields' for ABSTRACT_NODE is \
                 not a list"
            ))
        })?;
        for entry in entries {
            if !entry.is_node() {
                return Err(EvaluationError::new(format!(
                    "list entry for {key} in argument 'target_fields' for ABSTRACT_NODE \
                     is not a target node: {entry}"
                )));
            }
        }
    }

    Ok(Expr::node(TargetNode::Abstract(AbstractNode {
        node_type,
        string_fields,
        target_fields,
    })))
}
