use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;
use serde_json::{Map, Value as JsonValue};

use crate::error::ConvertError;
use crate::model::number_to_json;
use crate::query_functions::{Builtin, lookup_builtin, match_object};
use crate::query_lexer::compile_regex;
use crate::query_model::{BinaryOp, Expr, PathExpr, Step};
use crate::query_parser::{DEFAULT_MAX_NESTING, parse_expression_with_limit};

/// Ranges and padded strings larger than this are refused instead of allocating.
pub(crate) const MAX_RANGE_LEN: i64 = 10_000_000;

// =============================================================================
// EvalValue - result of an evaluation
// =============================================================================

/// Result of evaluating an expression. `Missing` means the expression produced
/// nothing, which is distinct from a JSON `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Missing,
    Value(JsonValue),
}

impl EvalValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, EvalValue::Missing)
    }

    pub fn into_value(self) -> Option<JsonValue> {
        match self {
            EvalValue::Value(v) => Some(v),
            EvalValue::Missing => None,
        }
    }

    pub fn as_value(&self) -> Option<&JsonValue> {
        match self {
            EvalValue::Value(v) => Some(v),
            EvalValue::Missing => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOptions {
    /// Maximum nesting of evaluation calls, recursion through lambdas included.
    pub max_depth: usize,
    /// Maximum nesting accepted by the parser.
    pub max_nesting: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            max_depth: 512,
            max_nesting: DEFAULT_MAX_NESTING,
        }
    }
}

/// Parse `expression` and evaluate it against `document`.
pub fn evaluate(document: &JsonValue, expression: &str) -> Result<EvalValue, ConvertError> {
    evaluate_with_options(document, expression, &EvalOptions::default())
}

pub fn evaluate_with_options(
    document: &JsonValue,
    expression: &str,
    options: &EvalOptions,
) -> Result<EvalValue, ConvertError> {
    let expr = parse_expression_with_limit(expression, options.max_nesting)?;
    Evaluator::with_options(document, *options).evaluate(&expr)
}

// =============================================================================
// Internal values and scopes
// =============================================================================

/// Value flowing between expressions during evaluation.
#[derive(Debug, Clone)]
pub(crate) enum Value {
    Absent,
    Json(JsonValue),
    Func(Rc<Callable>),
}

impl Value {
    pub(crate) fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    fn into_eval_value(self) -> EvalValue {
        match self {
            Value::Json(v) => EvalValue::Value(v),
            Value::Absent | Value::Func(_) => EvalValue::Missing,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Callable {
    Lambda(Lambda),
    Builtin(Builtin),
    /// A regex literal. Called with a string it yields its first match.
    Regex(Regex),
}

impl Callable {
    /// Number of arguments handed over by higher-order functions such as `$map`.
    pub(crate) fn arity(&self) -> usize {
        match self {
            Callable::Lambda(lambda) => lambda.params.len(),
            Callable::Builtin(builtin) => builtin.min_args.max(1),
            Callable::Regex(_) => 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Lambda {
    params: Vec<String>,
    body: Rc<Expr>,
    scope: Scope,
    input: JsonValue,
    /// Name the lambda was assigned to, bound again on every call for recursion.
    self_name: Option<String>,
}

/// Variable bindings visible to an expression. Blocks and calls clone it and add
/// their own bindings, so inner bindings never leak out.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
    bindings: HashMap<String, Value>,
}

impl Scope {
    fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    fn bind(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), value);
    }
}

// =============================================================================
// Evaluator
// =============================================================================

/// Walks a parsed expression against one input document.
///
/// The document is only borrowed; evaluation has no side effects.
pub struct Evaluator<'a> {
    root: &'a JsonValue,
    options: EvalOptions,
    depth: Cell<usize>,
}

enum StepOutput {
    Items(Vec<JsonValue>),
    /// A single array produced by the last step, returned as is.
    Kept(JsonValue),
}

enum StepValue {
    Plain(JsonValue),
    Filtered(Vec<JsonValue>),
}

impl<'a> Evaluator<'a> {
    pub fn new(root: &'a JsonValue) -> Self {
        Self::with_options(root, EvalOptions::default())
    }

    pub fn with_options(root: &'a JsonValue, options: EvalOptions) -> Self {
        Self {
            root,
            options,
            depth: Cell::new(0),
        }
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<EvalValue, ConvertError> {
        self.depth.set(0);
        let value = self.eval(expr, self.root, &Scope::default())?;
        Ok(value.into_eval_value())
    }

    pub(crate) fn eval(
        &self,
        expr: &Expr,
        input: &JsonValue,
        scope: &Scope,
    ) -> Result<Value, ConvertError> {
        let depth = self.depth.get() + 1;
        if depth > self.options.max_depth {
            return Err(ConvertError::eval(format!(
                "evaluation exceeded the maximum depth of {}",
                self.options.max_depth
            )));
        }
        self.depth.set(depth);
        let result = self.eval_inner(expr, input, scope);
        self.depth.set(depth - 1);
        result
    }

    fn eval_inner(
        &self,
        expr: &Expr,
        input: &JsonValue,
        scope: &Scope,
    ) -> Result<Value, ConvertError> {
        match expr {
            Expr::Literal(value) => Ok(Value::Json(value.clone())),
            Expr::Name(name) => Ok(lookup_field(input, name)),
            Expr::Wildcard => Ok(collapse(wildcard(input))),
            Expr::Context => Ok(Value::Json(input.clone())),
            Expr::Root => Ok(Value::Json(self.root.clone())),
            Expr::Variable(name) => Ok(self.lookup_variable(name, scope)),
            Expr::Regex { pattern, flags } => {
                let regex = compile_regex(pattern, flags)
                    .map_err(|err| ConvertError::eval(format!("invalid regex: {}", err)))?;
                Ok(Value::Func(Rc::new(Callable::Regex(regex))))
            }
            Expr::Path(path) => self.eval_path(path, input, scope),
            Expr::Array(items) => self.eval_array(items, input, scope),
            Expr::Range(_, _) => Err(ConvertError::eval(
                "range operator '..' is only allowed inside an array constructor",
            )),
            Expr::Object(pairs) => {
                let items = match input {
                    JsonValue::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                self.eval_group(items, pairs, scope)
            }
            Expr::Group { base, pairs } => {
                let items = match self.eval(base, input, scope)? {
                    Value::Absent => Vec::new(),
                    Value::Json(JsonValue::Array(items)) => items,
                    Value::Json(other) => vec![other],
                    Value::Func(_) => {
                        return Err(ConvertError::eval("cannot group a function value"));
                    }
                };
                self.eval_group(items, pairs, scope)
            }
            Expr::Filter { base, predicate } => {
                let items = match self.eval(base, input, scope)? {
                    Value::Absent => return Ok(Value::Absent),
                    Value::Json(value) => into_items(value),
                    Value::Func(_) => {
                        return Err(ConvertError::eval("cannot filter a function value"));
                    }
                };
                Ok(collapse(self.apply_predicate(predicate, items, scope)?))
            }
            Expr::Negate(operand) => match self.eval(operand, input, scope)? {
                Value::Absent => Ok(Value::Absent),
                Value::Json(JsonValue::Number(n)) => {
                    let n = n.as_f64().unwrap_or(0.0);
                    Ok(Value::Json(finite_number(-n, "-")?))
                }
                other => Err(ConvertError::eval(format!(
                    "cannot negate a value of type {}",
                    type_name(&other)
                ))),
            },
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs, input, scope),
            Expr::Condition {
                cond,
                then,
                otherwise,
            } => {
                if truthy(&self.eval(cond, input, scope)?) {
                    self.eval(then, input, scope)
                } else if let Some(otherwise) = otherwise {
                    self.eval(otherwise, input, scope)
                } else {
                    Ok(Value::Absent)
                }
            }
            Expr::Assign { value, .. } => self.eval(value, input, scope),
            Expr::Block(statements) => self.eval_block(statements, input, scope),
            Expr::Lambda { params, body } => Ok(Value::Func(Rc::new(Callable::Lambda(Lambda {
                params: params.clone(),
                body: Rc::clone(body),
                scope: scope.clone(),
                input: input.clone(),
                self_name: None,
            })))),
            Expr::Call { callee, args } => {
                let func = self.resolve_callee(callee, input, scope)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, input, scope)?);
                }
                self.call_function(&func, values, input)
            }
            Expr::Apply { lhs, rhs } => {
                let first = self.eval(lhs, input, scope)?;
                match rhs.as_ref() {
                    Expr::Call { callee, args } => {
                        let func = self.resolve_callee(callee, input, scope)?;
                        let mut values = Vec::with_capacity(args.len() + 1);
                        values.push(first);
                        for arg in args {
                            values.push(self.eval(arg, input, scope)?);
                        }
                        self.call_function(&func, values, input)
                    }
                    other => match self.eval(other, input, scope)? {
                        Value::Func(func) => self.call_function(&func, vec![first], input),
                        _ => Err(ConvertError::eval(
                            "right side of '~>' must be a function",
                        )),
                    },
                }
            }
        }
    }

    fn lookup_variable(&self, name: &str, scope: &Scope) -> Value {
        if let Some(value) = scope.get(name) {
            return value.clone();
        }
        match lookup_builtin(name) {
            Some(builtin) => Value::Func(Rc::new(Callable::Builtin(builtin))),
            None => Value::Absent,
        }
    }

    // -------------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------------

    fn eval_path(
        &self,
        path: &PathExpr,
        input: &JsonValue,
        scope: &Scope,
    ) -> Result<Value, ConvertError> {
        let Some((first, rest)) = path.steps.split_first() else {
            return Ok(Value::Absent);
        };

        // A leading variable is evaluated once; otherwise an array input is a sequence.
        let inputs: Vec<&JsonValue> = match (&first.expr, input) {
            (Expr::Variable(_) | Expr::Root | Expr::Context, _) => vec![input],
            (_, JsonValue::Array(items)) => items.iter().collect(),
            _ => vec![input],
        };
        let mut output = self.eval_step(first, &inputs, scope, rest.is_empty())?;

        for (idx, step) in rest.iter().enumerate() {
            let items = match output {
                StepOutput::Items(items) => items,
                StepOutput::Kept(value) => vec![value],
            };
            if items.is_empty() {
                return Ok(Value::Absent);
            }
            let inputs: Vec<&JsonValue> = items.iter().collect();
            output = self.eval_step(step, &inputs, scope, idx + 1 == rest.len())?;
        }

        Ok(match output {
            StepOutput::Kept(value) => Value::Json(value),
            StepOutput::Items(items) if path.keep_array && !items.is_empty() => {
                Value::Json(JsonValue::Array(items))
            }
            StepOutput::Items(items) => collapse(items),
        })
    }

    fn eval_step(
        &self,
        step: &Step,
        inputs: &[&JsonValue],
        scope: &Scope,
        last: bool,
    ) -> Result<StepOutput, ConvertError> {
        let mut results = Vec::with_capacity(inputs.len());
        for item in inputs {
            let value = match self.eval(&step.expr, item, scope)? {
                Value::Absent => continue,
                Value::Json(value) => value,
                Value::Func(_) => {
                    return Err(ConvertError::eval(
                        "a path step evaluated to a function",
                    ));
                }
            };
            if step.predicates.is_empty() {
                results.push(StepValue::Plain(value));
            } else {
                let mut items = into_items(value);
                for predicate in &step.predicates {
                    items = self.apply_predicate(predicate, items, scope)?;
                }
                results.push(StepValue::Filtered(items));
            }
        }

        if last && results.len() == 1 {
            if let Some(StepValue::Plain(JsonValue::Array(_))) = results.first() {
                if let Some(StepValue::Plain(value)) = results.pop() {
                    return Ok(StepOutput::Kept(value));
                }
            }
        }

        let keep_arrays = step.expr.is_array_constructor();
        let mut items = Vec::new();
        for result in results {
            match result {
                StepValue::Plain(JsonValue::Array(values)) if !keep_arrays => items.extend(values),
                StepValue::Plain(value) => items.push(value),
                StepValue::Filtered(values) => items.extend(values),
            }
        }
        Ok(StepOutput::Items(items))
    }

    /// Keep the items selected by `predicate`. A numeric result selects by index,
    /// anything else is cast to a boolean.
    fn apply_predicate(
        &self,
        predicate: &Expr,
        items: Vec<JsonValue>,
        scope: &Scope,
    ) -> Result<Vec<JsonValue>, ConvertError> {
        let len = items.len();
        let mut kept = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let result = self.eval(predicate, &item, scope)?;
            let keep = match &result {
                Value::Json(JsonValue::Number(n)) => index_matches(n.as_f64(), index, len),
                Value::Json(JsonValue::Array(values))
                    if !values.is_empty() && values.iter().all(JsonValue::is_number) =>
                {
                    values
                        .iter()
                        .any(|n| index_matches(n.as_f64(), index, len))
                }
                other => truthy(other),
            };
            if keep {
                kept.push(item);
            }
        }
        Ok(kept)
    }

    // -------------------------------------------------------------------------
    // Constructors
    // -------------------------------------------------------------------------

    fn eval_array(
        &self,
        items: &[Expr],
        input: &JsonValue,
        scope: &Scope,
    ) -> Result<Value, ConvertError> {
        let mut out = Vec::new();
        for item in items {
            if let Expr::Range(start, end) = item {
                let start = range_bound(self.eval(start, input, scope)?)?;
                let end = range_bound(self.eval(end, input, scope)?)?;
                if let (Some(start), Some(end)) = (start, end) {
                    if end - start >= MAX_RANGE_LEN {
                        return Err(ConvertError::eval(format!(
                            "range {}..{} has more than {} items",
                            start, end, MAX_RANGE_LEN
                        )));
                    }
                    out.extend((start..=end).map(JsonValue::from));
                }
                continue;
            }
            match self.eval(item, input, scope)? {
                Value::Absent => {}
                Value::Json(JsonValue::Array(values)) if !item.is_array_constructor() => {
                    out.extend(values)
                }
                Value::Json(value) => out.push(value),
                Value::Func(_) => {
                    return Err(ConvertError::eval(
                        "functions cannot be stored in an array",
                    ));
                }
            }
        }
        Ok(Value::Json(JsonValue::Array(out)))
    }

    /// Object construction. Items are grouped by the string key each pair yields;
    /// the value is evaluated once per group with the group's items as context.
    fn eval_group(
        &self,
        mut items: Vec<JsonValue>,
        pairs: &[(Expr, Expr)],
        scope: &Scope,
    ) -> Result<Value, ConvertError> {
        if items.is_empty() {
            items.push(JsonValue::Null);
        }

        let mut groups: Vec<(String, usize, Vec<JsonValue>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for item in &items {
            for (pair_index, (key_expr, _)) in pairs.iter().enumerate() {
                let key = match self.eval(key_expr, item, scope)? {
                    Value::Absent => continue,
                    Value::Json(JsonValue::String(key)) => key,
                    other => {
                        return Err(ConvertError::eval(format!(
                            "object key must evaluate to a string, got {}",
                            type_name(&other)
                        )));
                    }
                };
                match index.get(&key) {
                    Some(&group) => {
                        if groups[group].1 != pair_index {
                            return Err(ConvertError::eval(format!(
                                "multiple key definitions evaluate to the same key: {}",
                                key
                            )));
                        }
                        groups[group].2.push(item.clone());
                    }
                    None => {
                        index.insert(key.clone(), groups.len());
                        groups.push((key, pair_index, vec![item.clone()]));
                    }
                }
            }
        }

        let mut out = Map::new();
        for (key, pair_index, mut members) in groups {
            let context = if members.len() == 1 {
                members.remove(0)
            } else {
                JsonValue::Array(members)
            };
            match self.eval(&pairs[pair_index].1, &context, scope)? {
                Value::Absent => {}
                Value::Json(value) => {
                    out.insert(key, value);
                }
                Value::Func(_) => {
                    return Err(ConvertError::eval(format!(
                        "value for key '{}' is a function",
                        key
                    )));
                }
            }
        }
        Ok(Value::Json(JsonValue::Object(out)))
    }

    fn eval_block(
        &self,
        statements: &[Expr],
        input: &JsonValue,
        scope: &Scope,
    ) -> Result<Value, ConvertError> {
        let mut scope = scope.clone();
        let mut last = Value::Absent;
        for statement in statements {
            last = match statement {
                Expr::Assign { name, value } => {
                    let value = name_lambda(self.eval(value, input, &scope)?, name);
                    scope.bind(name, value.clone());
                    value
                }
                other => self.eval(other, input, &scope)?,
            };
        }
        Ok(last)
    }

    // -------------------------------------------------------------------------
    // Operators
    // -------------------------------------------------------------------------

    fn eval_binary(
        &self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        input: &JsonValue,
        scope: &Scope,
    ) -> Result<Value, ConvertError> {
        match op {
            BinaryOp::And => {
                let result = truthy(&self.eval(lhs, input, scope)?)
                    && truthy(&self.eval(rhs, input, scope)?);
                return Ok(Value::Json(JsonValue::Bool(result)));
            }
            BinaryOp::Or => {
                let result = truthy(&self.eval(lhs, input, scope)?)
                    || truthy(&self.eval(rhs, input, scope)?);
                return Ok(Value::Json(JsonValue::Bool(result)));
            }
            _ => {}
        }

        let left = self.eval(lhs, input, scope)?;
        let right = self.eval(rhs, input, scope)?;
        match op {
            BinaryOp::Add
            | BinaryOp::Subtract
            | BinaryOp::Multiply
            | BinaryOp::Divide
            | BinaryOp::Modulo => arithmetic(op, &left, &right),
            BinaryOp::Concat => {
                let mut text = to_display_string(&left);
                text.push_str(&to_display_string(&right));
                Ok(Value::Json(JsonValue::String(text)))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let result = match (&left, &right) {
                    (Value::Json(l), Value::Json(r)) => {
                        let equal = json_equal(l, r);
                        if op == BinaryOp::Eq { equal } else { !equal }
                    }
                    _ => false,
                };
                Ok(Value::Json(JsonValue::Bool(result)))
            }
            BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
                compare(op, &left, &right).map(|b| Value::Json(JsonValue::Bool(b)))
            }
            BinaryOp::In => {
                let result = match (&left, &right) {
                    (Value::Json(needle), Value::Json(JsonValue::Array(haystack))) => {
                        haystack.iter().any(|item| json_equal(needle, item))
                    }
                    (Value::Json(needle), Value::Json(single)) => json_equal(needle, single),
                    _ => false,
                };
                Ok(Value::Json(JsonValue::Bool(result)))
            }
            BinaryOp::And | BinaryOp::Or => Ok(Value::Absent),
        }
    }

    // -------------------------------------------------------------------------
    // Function calls
    // -------------------------------------------------------------------------

    fn resolve_callee(
        &self,
        callee: &Expr,
        input: &JsonValue,
        scope: &Scope,
    ) -> Result<Rc<Callable>, ConvertError> {
        if let Expr::Variable(name) = callee {
            return match scope.get(name) {
                Some(Value::Func(func)) => Ok(Rc::clone(func)),
                Some(_) => Err(ConvertError::eval(format!("${} is not a function", name))),
                None => lookup_builtin(name)
                    .map(|builtin| Rc::new(Callable::Builtin(builtin)))
                    .ok_or_else(|| ConvertError::eval(format!("unknown function ${}", name))),
            };
        }
        match self.eval(callee, input, scope)? {
            Value::Func(func) => Ok(func),
            _ => Err(ConvertError::eval(
                "attempted to call a value that is not a function",
            )),
        }
    }

    pub(crate) fn call_function(
        &self,
        func: &Rc<Callable>,
        args: Vec<Value>,
        input: &JsonValue,
    ) -> Result<Value, ConvertError> {
        match func.as_ref() {
            Callable::Builtin(builtin) => self.call_builtin(builtin, args, input),
            Callable::Regex(regex) => Ok(match args.into_iter().next() {
                Some(Value::Json(JsonValue::String(text))) => regex
                    .captures(&text)
                    .map(|caps| Value::Json(match_object(&text, &caps)))
                    .unwrap_or(Value::Absent),
                Some(Value::Absent) | None => Value::Absent,
                Some(other) => {
                    return Err(ConvertError::eval(format!(
                        "a regex can only be applied to a string, got {}",
                        type_name(&other)
                    )));
                }
            }),
            Callable::Lambda(lambda) => {
                let mut scope = lambda.scope.clone();
                if let Some(name) = &lambda.self_name {
                    scope.bind(name, Value::Func(Rc::clone(func)));
                }
                let mut args = args.into_iter();
                for param in &lambda.params {
                    scope.bind(param, args.next().unwrap_or(Value::Absent));
                }
                self.eval(&lambda.body, &lambda.input, &scope)
            }
        }
    }
}

/// Mark a freshly assigned lambda with its own name so the body can recurse.
fn name_lambda(value: Value, name: &str) -> Value {
    if let Value::Func(func) = &value {
        if let Callable::Lambda(lambda) = func.as_ref() {
            if lambda.self_name.is_none() {
                return Value::Func(Rc::new(Callable::Lambda(Lambda {
                    params: lambda.params.clone(),
                    body: Rc::clone(&lambda.body),
                    scope: lambda.scope.clone(),
                    input: lambda.input.clone(),
                    self_name: Some(name.to_string()),
                })));
            }
        }
    }
    value
}

// =============================================================================
// Sequence helpers
// =============================================================================

/// Collapse a result sequence: nothing is absent, one item is the item itself.
pub(crate) fn collapse(mut items: Vec<JsonValue>) -> Value {
    match items.len() {
        0 => Value::Absent,
        1 => Value::Json(items.remove(0)),
        _ => Value::Json(JsonValue::Array(items)),
    }
}

/// Treat a value as a sequence: arrays yield their elements, scalars themselves.
pub(crate) fn into_items(value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items,
        other => vec![other],
    }
}

fn lookup_field(input: &JsonValue, name: &str) -> Value {
    match input {
        JsonValue::Object(map) => match map.get(name) {
            Some(value) => Value::Json(value.clone()),
            None => Value::Absent,
        },
        JsonValue::Array(items) => {
            let mut found = Vec::new();
            for item in items {
                match lookup_field(item, name) {
                    Value::Json(JsonValue::Array(values)) => found.extend(values),
                    Value::Json(value) => found.push(value),
                    _ => {}
                }
            }
            collapse(found)
        }
        _ => Value::Absent,
    }
}

fn wildcard(input: &JsonValue) -> Vec<JsonValue> {
    let mut out = Vec::new();
    match input {
        JsonValue::Object(map) => {
            for value in map.values() {
                match value {
                    JsonValue::Array(values) => flatten_into(values, &mut out),
                    other => out.push(other.clone()),
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                out.extend(wildcard(item));
            }
        }
        _ => {}
    }
    out
}

fn flatten_into(values: &[JsonValue], out: &mut Vec<JsonValue>) {
    for value in values {
        match value {
            JsonValue::Array(inner) => flatten_into(inner, out),
            other => out.push(other.clone()),
        }
    }
}

fn index_matches(position: Option<f64>, index: usize, len: usize) -> bool {
    let Some(position) = position else {
        return false;
    };
    let mut position = position.floor();
    if position < 0.0 {
        position += len as f64;
    }
    position == index as f64
}

fn range_bound(value: Value) -> Result<Option<i64>, ConvertError> {
    match value {
        Value::Absent => Ok(None),
        Value::Json(JsonValue::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Some(f as i64)),
            _ => Err(ConvertError::eval("range bounds must be integers")),
        },
        _ => Err(ConvertError::eval("range bounds must be integers")),
    }
}

// =============================================================================
// Casting and comparison
// =============================================================================

/// Boolean cast used by predicates, conditions, `and`, `or`, `$boolean`.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Absent | Value::Func(_) => false,
        Value::Json(json) => json_truthy(json),
    }
}

fn json_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) if items.len() == 1 => json_truthy(&items[0]),
        JsonValue::Array(items) => items.iter().any(json_truthy),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

/// Deep equality where numbers compare by value.
pub(crate) fn json_equal(left: &JsonValue, right: &JsonValue) -> bool {
    match (left, right) {
        (JsonValue::Number(l), JsonValue::Number(r)) => l.as_f64() == r.as_f64(),
        (JsonValue::Array(l), JsonValue::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| json_equal(a, b))
        }
        (JsonValue::Object(l), JsonValue::Object(r)) => {
            l.len() == r.len()
                && l.iter()
                    .all(|(key, value)| r.get(key).is_some_and(|other| json_equal(value, other)))
        }
        _ => left == right,
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<bool, ConvertError> {
    let ordering = match (left, right) {
        (Value::Absent, _) | (_, Value::Absent) => return Ok(false),
        (Value::Json(JsonValue::Number(l)), Value::Json(JsonValue::Number(r))) => {
            let (l, r) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
            l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal)
        }
        (Value::Json(JsonValue::String(l)), Value::Json(JsonValue::String(r))) => l.cmp(r),
        _ => {
            return Err(ConvertError::eval(format!(
                "operator {} cannot compare {} with {}",
                op.symbol(),
                type_name(left),
                type_name(right)
            )));
        }
    };
    Ok(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Lte => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ConvertError> {
    let operand = |value: &Value, side: &str| -> Result<Option<f64>, ConvertError> {
        match value {
            Value::Absent => Ok(None),
            Value::Json(JsonValue::Number(n)) => Ok(n.as_f64()),
            other => Err(ConvertError::eval(format!(
                "{} side of operator {} must be a number, got {}",
                side,
                op.symbol(),
                type_name(other)
            ))),
        }
    };
    let (Some(l), Some(r)) = (operand(left, "left")?, operand(right, "right")?) else {
        return Ok(Value::Absent);
    };
    let result = match op {
        BinaryOp::Add => l + r,
        BinaryOp::Subtract => l - r,
        BinaryOp::Multiply => l * r,
        BinaryOp::Divide => l / r,
        _ => l % r,
    };
    finite_number(result, op.symbol()).map(Value::Json)
}

pub(crate) fn finite_number(value: f64, operation: &str) -> Result<JsonValue, ConvertError> {
    number_to_json(value).ok_or_else(|| {
        ConvertError::eval(format!("{} produced a non-finite number", operation))
    })
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Absent => "undefined",
        Value::Func(_) => "function",
        Value::Json(json) => json_type_name(json),
    }
}

pub(crate) fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

// =============================================================================
// Stringification
// =============================================================================

/// Number formatting shared by `&` and `$string`: integers print without a
/// fraction, other values are rounded to 15 significant digits.
pub(crate) fn format_number(value: f64) -> String {
    if let Some(JsonValue::Number(n)) = number_to_json(value) {
        if let Some(i) = n.as_i64() {
            return i.to_string();
        }
    }
    round_significant(value).to_string()
}

fn round_significant(value: f64) -> f64 {
    format!("{:.14e}", value).parse::<f64>().unwrap_or(value)
}

fn normalize_numbers(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Number(n) if !n.is_i64() && !n.is_u64() => n
            .as_f64()
            .and_then(|f| number_to_json(round_significant(f)))
            .unwrap_or(JsonValue::Null),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(normalize_numbers).collect()),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), normalize_numbers(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub(crate) fn json_to_string(value: &JsonValue, pretty: bool) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => format_number(n.as_f64().unwrap_or(0.0)),
        },
        other => {
            let normalized = normalize_numbers(other);
            let text = if pretty {
                serde_json::to_string_pretty(&normalized)
            } else {
                serde_json::to_string(&normalized)
            };
            text.unwrap_or_default()
        }
    }
}

/// Operand text for `&`; absent values and functions contribute nothing.
fn to_display_string(value: &Value) -> String {
    match value {
        Value::Json(json) => json_to_string(json, false),
        Value::Absent | Value::Func(_) => String::new(),
    }
}
