// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use common::{normalize_path, tree_conflict};
use serde_json::Number;

use crate::{Configuration, Expr, ExprMap, Value};

///
/// A failure during expression evaluation. Carries the chain of enclosing forms, innermost
/// first, so the user can locate the failing subexpression.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EvaluationError {
    pub message: String,
    pub call_stack: Vec<String>,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> EvaluationError {
        EvaluationError {
            message: message.into(),
            call_stack: vec![],
        }
    }

    fn while_in(mut self, frame: &str) -> EvaluationError {
        self.call_stack.push(frame.to_string());
        self
    }
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.call_stack.is_empty() {
            write!(f, "\ncall stack:")?;
            for frame in &self.call_stack {
                write!(f, "\n  in {frame}")?;
            }
        }
        Ok(())
    }
}

pub type EvalResult = Result<Expr, EvaluationError>;

type BuiltinFunction = Arc<dyn Fn(&Evaluator, &Expr, &Configuration) -> EvalResult + Send + Sync>;

///
/// Caller-supplied extension functions, consulted for form types the evaluator itself does
/// not know. Each function receives the evaluator (for recursive evaluation of arguments),
/// the whole form expression, and the current environment.
///
#[derive(Clone, Default)]
pub struct FunctionMap {
    functions: HashMap<String, BuiltinFunction>,
}

impl FunctionMap {
    pub fn new() -> FunctionMap {
        FunctionMap::default()
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Evaluator, &Expr, &Configuration) -> EvalResult + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    fn get(&self, name: &str) -> Option<&BuiltinFunction> {
        self.functions.get(name)
    }
}

///
/// Evaluates the expression under the environment, with the given extension functions.
///
pub fn evaluate(expr: &Expr, env: &Configuration, functions: &FunctionMap) -> EvalResult {
    Evaluator { functions }.eval(expr, env)
}

pub struct Evaluator<'a> {
    functions: &'a FunctionMap,
}

impl Evaluator<'_> {
    pub fn eval(&self, expr: &Expr, env: &Configuration) -> EvalResult {
        match expr.value() {
            Value::List(entries) => {
                let evaluated: Result<Vec<Expr>, EvaluationError> =
                    entries.iter().map(|e| self.eval(e, env)).collect();
                Ok(Expr::list(evaluated?))
            }
            Value::Map(map) => match map.get("type") {
                // A map without the 'type' keyword is a literal, evaluated entry-wise.
                None => {
                    let mut evaluated = ExprMap::new();
                    for (key, value) in map.iter() {
                        evaluated.insert(key.clone(), self.eval(value, env)?);
                    }
                    Ok(Expr::map(evaluated))
                }
                Some(form_type) => {
                    let form_type = form_type
                        .as_str()
                        .ok_or_else(|| {
                            EvaluationError::new(format!(
                                "Keyword 'type' must be a string, but found {expr}"
                            ))
                        })?
                        .to_string();
                    self.eval_form(&form_type, expr, env)
                        .map_err(|e| e.while_in(&form_type))
                }
            },
            _ => Ok(expr.clone()),
        }
    }

    ///
    /// Evaluates the argument under the given key of the form, or the default if absent.
    ///
    pub fn eval_arg(&self, form: &Expr, key: &str, default: Expr, env: &Configuration) -> EvalResult {
        self.eval(&literal_arg(form, key, default), env)
    }

    fn eval_form(&self, form_type: &str, form: &Expr, env: &Configuration) -> EvalResult {
        match form_type {
            "var" => self.eval_var(form, env),
            "if" => self.eval_if(form, env),
            "==" => {
                let lhs = self.eval_arg(form, "$1", Expr::none(), env)?;
                let rhs = self.eval_arg(form, "$2", Expr::none(), env)?;
                Ok(Expr::bool(lhs == rhs))
            }
            "and" => {
                let entries = self.eval_list_arg(form, "$1", env)?;
                Ok(Expr::bool(entries.iter().all(is_true)))
            }
            "or" => {
                let entries = self.eval_list_arg(form, "$1", env)?;
                Ok(Expr::bool(entries.iter().any(is_true)))
            }
            "not" => {
                let value = self.eval_arg(form, "$1", Expr::none(), env)?;
                Ok(Expr::bool(!is_true(&value)))
            }
            "case" => self.eval_case(form, env),
            "let*" => self.eval_let(form, env),
            "env" => self.eval_env(form, env),
            "fail" => {
                let msg = self.eval_arg(form, "msg", Expr::string("fail"), env)?;
                Err(EvaluationError::new(render_message(&msg)))
            }
            "assert_non_empty" => self.eval_assert_non_empty(form, env),
            "++" => self.eval_concat(form, env),
            "nub_right" => self.eval_nub_right(form, env),
            "range" => self.eval_range(form, env),
            "join" => self.eval_join(form, env),
            "keys" => {
                let map = self.eval_map_arg(form, "$1", env)?;
                Ok(Expr::list(map.keys().map(Expr::string).collect()))
            }
            "values" => {
                let map = self.eval_map_arg(form, "$1", env)?;
                Ok(Expr::list(map.values().cloned().collect()))
            }
            "empty_map" => Ok(Expr::empty_map()),
            "singleton_map" => {
                let key = self.eval_string_arg(form, "key", env)?;
                let value = self.eval_arg(form, "value", Expr::none(), env)?;
                let mut map = ExprMap::new();
                map.insert(key, value);
                Ok(Expr::map(map))
            }
            "map_union" => self.eval_map_union(form, env, false),
            "disjoint_map_union" => self.eval_map_union(form, env, true),
            "lookup" => self.eval_lookup(form, env),
            "foreach" => self.eval_foreach(form, env),
            "foreach_map" => self.eval_foreach_map(form, env),
            "concat_target_name" => self.eval_concat_target_name(form, env),
            "basename" => {
                let path = self.eval_string_arg(form, "$1", env)?;
                Ok(Expr::string(basename(&path)))
            }
            "change_ending" => self.eval_change_ending(form, env),
            "to_subdir" => self.eval_to_subdir(form, env),
            "+" => self.eval_arith(form, env, 0_i64, |a, b| a.checked_add(b), |a, b| a + b),
            "*" => self.eval_arith(form, env, 1_i64, |a, b| a.checked_mul(b), |a, b| a * b),
            other => match self.functions.get(other) {
                Some(function) => function(self, form, env),
                None => Err(EvaluationError::new(format!(
                    "Unknown syntactical construct {other:?}"
                ))),
            },
        }
    }

    fn eval_var(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let name = literal_arg(form, "name", Expr::none());
        let name = name.as_str().ok_or_else(|| {
            EvaluationError::new(format!(
                "Argument 'name' of 'var' must be a literal string, but found {name}"
            ))
        })?;
        let value = env.at(name);
        if value.is_none() {
            self.eval_arg(form, "default", Expr::none(), env)
        } else {
            Ok(value)
        }
    }

    fn eval_if(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let cond = self.eval_arg(form, "cond", Expr::none(), env)?;
        if is_true(&cond) {
            self.eval_arg(form, "then", Expr::none(), env)
        } else {
            self.eval_arg(form, "else", Expr::none(), env)
        }
    }

    fn eval_case(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let selector = self.eval_arg(form, "expr", Expr::none(), env)?;
        let cases = literal_arg(form, "case", Expr::empty_map());
        let cases = cases.as_map().ok_or_else(|| {
            EvaluationError::new(format!(
                "Argument 'case' of 'case' must be a map of expressions, but found {cases}"
            ))
        })?;
        if let Some(branch) = selector.as_str().and_then(|s| cases.get(s)) {
            self.eval(branch, env)
        } else {
            self.eval_arg(form, "default", Expr::none(), env)
        }
    }

    fn eval_let(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let bindings = literal_arg(form, "bindings", Expr::empty_list());
        let bindings = bindings.as_list().ok_or_else(|| {
            EvaluationError::new(format!(
                "Argument 'bindings' of 'let*' must be a list of pairs, but found {bindings}"
            ))
        })?;
        let mut env = env.clone();
        for binding in bindings {
            let pair = binding.as_list().filter(|p| p.len() == 2).ok_or_else(|| {
                EvaluationError::new(format!(
                    "Binding in 'let*' must be a [name, expression] pair, but found {binding}"
                ))
            })?;
            let name = pair[0].as_str().ok_or_else(|| {
                EvaluationError::new(format!(
                    "Binding name in 'let*' must be a string, but found {}",
                    pair[0]
                ))
            })?;
            let value = self.eval(&pair[1], &env)?;
            let mut patch = ExprMap::new();
            patch.insert(name.to_string(), value);
            env = env
                .update(&Expr::map(patch))
                .map_err(EvaluationError::new)?;
        }
        self.eval_arg(form, "body", Expr::none(), &env)
    }

    fn eval_env(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let vars = literal_arg(form, "vars", Expr::empty_list());
        let vars = vars.as_list().ok_or_else(|| {
            EvaluationError::new(format!(
                "Argument 'vars' of 'env' must be a list of strings, but found {vars}"
            ))
        })?;
        let mut map = ExprMap::new();
        for var in vars {
            let name = var.as_str().ok_or_else(|| {
                EvaluationError::new(format!(
                    "Argument 'vars' of 'env' must be a list of strings, but found {var}"
                ))
            })?;
            map.insert(name.to_string(), env.at(name));
        }
        Ok(Expr::map(map))
    }

    fn eval_assert_non_empty(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let value = self.eval_arg(form, "$1", Expr::none(), env)?;
        let empty = match value.value() {
            Value::String(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            Value::None => true,
            _ => false,
        };
        if empty {
            let msg = self.eval_arg(form, "msg", Expr::string("expected non-empty value"), env)?;
            Err(EvaluationError::new(render_message(&msg)))
        } else {
            Ok(value)
        }
    }

    fn eval_concat(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let lists = self.eval_list_arg(form, "$1", env)?;
        let mut result: Vec<Expr> = Vec::new();
        for entry in lists {
            let entries = entry.as_list().ok_or_else(|| {
                EvaluationError::new(format!(
                    "Argument of '++' must be a list of lists, but found entry {entry}"
                ))
            })?;
            result.extend_from_slice(entries);
        }
        Ok(Expr::list(result))
    }

    fn eval_nub_right(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let entries = self.eval_list_arg(form, "$1", env)?;
        let mut seen = std::collections::HashSet::new();
        let mut reversed: Vec<Expr> = Vec::with_capacity(entries.len());
        for entry in entries.iter().rev() {
            if seen.insert(entry.to_hash()) {
                reversed.push(entry.clone());
            }
        }
        reversed.reverse();
        Ok(Expr::list(reversed))
    }

    fn eval_range(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let bound = self.eval_arg(form, "$1", Expr::none(), env)?;
        let count = match bound.value() {
            Value::Number(n) => n.as_f64().unwrap_or(0.0).max(0.0) as usize,
            Value::String(s) => s.parse::<usize>().unwrap_or(0),
            _ => 0,
        };
        Ok(Expr::list(
            (0..count).map(|i| Expr::string(i.to_string())).collect(),
        ))
    }

    fn eval_join(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let separator = self.eval_arg(form, "separator", Expr::string(""), env)?;
        let separator = separator.as_str().ok_or_else(|| {
            EvaluationError::new(format!(
                "Argument 'separator' of 'join' must be a string, but found {separator}"
            ))
        })?;
        let entries = self.eval_list_arg(form, "$1", env)?;
        let strings: Result<Vec<&str>, EvaluationError> = entries
            .iter()
            .map(|e| {
                e.as_str().ok_or_else(|| {
                    EvaluationError::new(format!(
                        "Argument of 'join' must be a list of strings, but found entry {e}"
                    ))
                })
            })
            .collect();
        Ok(Expr::string(strings?.join(separator)))
    }

    fn eval_map_union(&self, form: &Expr, env: &Configuration, disjoint: bool) -> EvalResult {
        let maps = self.eval_list_arg(form, "$1", env)?;
        let mut union = ExprMap::new();
        for entry in maps {
            let map = entry.as_map().ok_or_else(|| {
                EvaluationError::new(format!(
                    "Argument of 'map_union' must be a list of maps, but found entry {entry}"
                ))
            })?;
            for (key, value) in map.iter() {
                if disjoint {
                    if let Some(existing) = union.get(key) {
                        if existing != value {
                            return Err(EvaluationError::new(format!(
                                "Conflicting values for key {key:?} in disjoint_map_union: \
                                 {existing} vs {value}"
                            )));
                        }
                    }
                }
                union.insert(key.clone(), value.clone());
            }
        }
        Ok(Expr::map(union))
    }

    fn eval_lookup(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let key = self.eval_string_arg(form, "key", env)?;
        let map = self.eval_map_arg(form, "map", env)?;
        match map.get(&key) {
            Some(value) if !value.is_none() => Ok(value.clone()),
            _ => self.eval_arg(form, "default", Expr::none(), env),
        }
    }

    fn eval_foreach(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let var = literal_string_arg(form, "var", "_")?;
        let range = self.eval_list_arg(form, "range", env)?;
        let body = literal_arg(form, "body", Expr::none());
        let mut result = Vec::with_capacity(range.len());
        for entry in range {
            let mut patch = ExprMap::new();
            patch.insert(var.clone(), entry);
            let env = env.update(&Expr::map(patch)).map_err(EvaluationError::new)?;
            result.push(self.eval(&body, &env)?);
        }
        Ok(Expr::list(result))
    }

    fn eval_foreach_map(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let var_key = literal_string_arg(form, "var_key", "_")?;
        let var_val = literal_string_arg(form, "var_val", "$_")?;
        let range = self.eval_map_arg(form, "range", env)?;
        let body = literal_arg(form, "body", Expr::none());
        let mut result = Vec::with_capacity(range.len());
        for (key, value) in range.iter() {
            let mut patch = ExprMap::new();
            patch.insert(var_key.clone(), Expr::string(key.clone()));
            patch.insert(var_val.clone(), value.clone());
            let env = env.update(&Expr::map(patch)).map_err(EvaluationError::new)?;
            result.push(self.eval(&body, &env)?);
        }
        Ok(Expr::list(result))
    }

    fn eval_concat_target_name(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let base = self.eval_arg(form, "$1", Expr::none(), env)?;
        let appendix = self.eval_arg(form, "$2", Expr::string(""), env)?;
        let appendix = match appendix.value() {
            Value::String(s) => s.clone(),
            Value::List(entries) => {
                let strings: Result<Vec<&str>, EvaluationError> = entries
                    .iter()
                    .map(|e| {
                        e.as_str().ok_or_else(|| {
                            EvaluationError::new(format!(
                                "Argument '$2' of 'concat_target_name' must be a string or \
                                 list of strings, but found entry {e}"
                            ))
                        })
                    })
                    .collect();
                strings?.concat()
            }
            _ => {
                return Err(EvaluationError::new(format!(
                    "Argument '$2' of 'concat_target_name' must be a string or list of \
                     strings, but found {appendix}"
                )))
            }
        };
        match base.value() {
            Value::String(s) => Ok(Expr::string(format!("{s}{appendix}"))),
            Value::List(entries) if !entries.is_empty() => {
                let last = entries.last().unwrap().as_str().ok_or_else(|| {
                    EvaluationError::new(format!(
                        "Last entry of 'concat_target_name' argument must be a string, but \
                         found {base}"
                    ))
                })?;
                let mut result = entries.clone();
                *result.last_mut().unwrap() = Expr::string(format!("{last}{appendix}"));
                Ok(Expr::list(result))
            }
            _ => Err(EvaluationError::new(format!(
                "Argument '$1' of 'concat_target_name' must be a name (string or list), but \
                 found {base}"
            ))),
        }
    }

    fn eval_change_ending(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let path = self.eval_string_arg(form, "$1", env)?;
        let ending = self.eval_arg(form, "ending", Expr::string(""), env)?;
        let ending = ending.as_str().ok_or_else(|| {
            EvaluationError::new(format!(
                "Argument 'ending' of 'change_ending' must be a string, but found {ending}"
            ))
        })?;
        let (dir, base) = match path.rfind('/') {
            Some(pos) => (&path[..pos + 1], &path[pos + 1..]),
            None => ("", path.as_str()),
        };
        let stem = match base.rfind('.') {
            Some(pos) if pos > 0 => &base[..pos],
            _ => base,
        };
        Ok(Expr::string(format!("{dir}{stem}{ending}")))
    }

    fn eval_to_subdir(&self, form: &Expr, env: &Configuration) -> EvalResult {
        let subdir = self.eval_arg(form, "subdir", Expr::string("."), env)?;
        let subdir = subdir.as_str().ok_or_else(|| {
            EvaluationError::new(format!(
                "Argument 'subdir' of 'to_subdir' must be a string, but found {subdir}"
            ))
        })?;
        let flat = is_true(&self.eval_arg(form, "flat", Expr::bool(false), env)?);
        let stage = self.eval_map_arg(form, "$1", env)?;
        let mut result = ExprMap::new();
        for (path, value) in stage.iter() {
            let new_path = if flat {
                normalize_path(&format!("{}/{}", subdir, basename(path)))
            } else {
                normalize_path(&format!("{subdir}/{path}"))
            };
            if let Some(existing) = result.get(&new_path) {
                if existing != value {
                    return Err(EvaluationError::new(format!(
                        "to_subdir leads to a staging conflict at {new_path:?}"
                    )));
                }
            }
            result.insert(new_path, value.clone());
        }
        if let Some(conflict) = tree_conflict(result.keys().map(String::as_str)) {
            return Err(EvaluationError::new(format!(
                "to_subdir conflicts on subtree {conflict:?}"
            )));
        }
        Ok(Expr::map(result))
    }

    fn eval_arith(
        &self,
        form: &Expr,
        env: &Configuration,
        unit: i64,
        int_op: impl Fn(i64, i64) -> Option<i64>,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> EvalResult {
        let entries = self.eval_list_arg(form, "$1", env)?;
        let mut int_acc: Option<i64> = Some(unit);
        let mut float_acc = unit as f64;
        for entry in &entries {
            let number = entry.as_number().ok_or_else(|| {
                EvaluationError::new(format!(
                    "Arithmetic argument must be a list of numbers, but found entry {entry}"
                ))
            })?;
            int_acc = match (int_acc, number.as_i64()) {
                (Some(acc), Some(i)) => int_op(acc, i),
                _ => None,
            };
            float_acc = float_op(float_acc, number.as_f64().unwrap_or(0.0));
        }
        let result = match int_acc {
            Some(i) => Number::from(i),
            None => Number::from_f64(float_acc).ok_or_else(|| {
                EvaluationError::new("Arithmetic result is not representable".to_string())
            })?,
        };
        Ok(Expr::number(result))
    }

    fn eval_list_arg(
        &self,
        form: &Expr,
        key: &str,
        env: &Configuration,
    ) -> Result<Vec<Expr>, EvaluationError> {
        let value = self.eval_arg(form, key, Expr::empty_list(), env)?;
        match value.value() {
            Value::List(entries) => Ok(entries.clone()),
            _ => Err(EvaluationError::new(format!(
                "Argument {key:?} must be a list, but found {value}"
            ))),
        }
    }

    fn eval_map_arg(
        &self,
        form: &Expr,
        key: &str,
        env: &Configuration,
    ) -> Result<ExprMap, EvaluationError> {
        let value = self.eval_arg(form, key, Expr::empty_map(), env)?;
        match value.value() {
            Value::Map(map) => Ok(map.clone()),
            _ => Err(EvaluationError::new(format!(
                "Argument {key:?} must be a map, but found {value}"
            ))),
        }
    }

    fn eval_string_arg(
        &self,
        form: &Expr,
        key: &str,
        env: &Configuration,
    ) -> Result<String, EvaluationError> {
        let value = self.eval_arg(form, key, Expr::none(), env)?;
        value.as_str().map(str::to_string).ok_or_else(|| {
            EvaluationError::new(format!(
                "Argument {key:?} must be a string, but found {value}"
            ))
        })
    }
}

///
/// The unevaluated argument under the given key of a form, or the default if absent.
///
pub fn literal_arg(form: &Expr, key: &str, default: Expr) -> Expr {
    form.as_map()
        .and_then(|map| map.get(key).cloned())
        .unwrap_or(default)
}

fn literal_string_arg(form: &Expr, key: &str, default: &str) -> Result<String, EvaluationError> {
    let value = literal_arg(form, key, Expr::string(default));
    value.as_str().map(str::to_string).ok_or_else(|| {
        EvaluationError::new(format!(
            "Argument {key:?} must be a literal string, but found {value}"
        ))
    })
}

///
/// The truthiness used by 'if', 'and', 'or': null, false, zero, and empty strings, lists,
/// and maps are false; everything else is true.
///
pub fn is_true(expr: &Expr) -> bool {
    match expr.value() {
        Value::None => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::List(l) => !l.is_empty(),
        Value::Map(m) => !m.is_empty(),
        _ => true,
    }
}

fn render_message(msg: &Expr) -> String {
    match msg.as_str() {
        Some(s) => s.to_string(),
        None => msg.to_string(),
    }
}

fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}
