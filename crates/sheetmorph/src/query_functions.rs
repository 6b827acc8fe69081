//! Built-in `$functions`.
//!
//! Value functions return `Missing` when their first argument is absent; wrong
//! argument types and arities are evaluation errors naming the function.

use std::rc::Rc;

use regex::{Captures, Regex};
use serde_json::{Map, Value as JsonValue};

use crate::error::ConvertError;
use crate::query_eval::{
    Callable, Evaluator, MAX_RANGE_LEN, Value, collapse, finite_number, into_items, json_equal,
    json_to_string, json_type_name, truthy, type_name,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Builtin {
    pub(crate) name: &'static str,
    pub(crate) min_args: usize,
    pub(crate) max_args: usize,
    /// The context item stands in for a missing first argument.
    pub(crate) context_arg: bool,
}

const fn builtin(
    name: &'static str,
    min_args: usize,
    max_args: usize,
    context_arg: bool,
) -> Builtin {
    Builtin {
        name,
        min_args,
        max_args,
        context_arg,
    }
}

const BUILTINS: &[Builtin] = &[
    builtin("string", 1, 2, true),
    builtin("number", 1, 1, true),
    builtin("boolean", 1, 1, true),
    builtin("not", 1, 1, true),
    builtin("exists", 1, 1, false),
    builtin("count", 1, 1, false),
    builtin("sum", 1, 1, false),
    builtin("max", 1, 1, false),
    builtin("min", 1, 1, false),
    builtin("average", 1, 1, false),
    builtin("length", 1, 1, true),
    builtin("substring", 2, 3, true),
    builtin("substringBefore", 2, 2, true),
    builtin("substringAfter", 2, 2, true),
    builtin("uppercase", 1, 1, true),
    builtin("lowercase", 1, 1, true),
    builtin("trim", 1, 1, true),
    builtin("contains", 2, 2, true),
    builtin("split", 2, 3, true),
    builtin("join", 1, 2, false),
    builtin("replace", 3, 4, true),
    builtin("match", 2, 3, true),
    builtin("pad", 2, 3, true),
    builtin("keys", 1, 1, false),
    builtin("lookup", 2, 2, false),
    builtin("merge", 1, 1, false),
    builtin("append", 2, 2, false),
    builtin("distinct", 1, 1, false),
    builtin("reverse", 1, 1, false),
    builtin("sort", 1, 2, false),
    builtin("type", 1, 1, false),
    builtin("abs", 1, 1, true),
    builtin("floor", 1, 1, true),
    builtin("ceil", 1, 1, true),
    builtin("round", 1, 2, true),
    builtin("power", 2, 2, true),
    builtin("sqrt", 1, 1, true),
    builtin("map", 2, 2, false),
    builtin("filter", 2, 2, false),
    builtin("reduce", 2, 3, false),
    builtin("each", 2, 2, false),
    builtin("single", 1, 2, false),
];

pub(crate) fn lookup_builtin(name: &str) -> Option<Builtin> {
    BUILTINS.iter().find(|builtin| builtin.name == name).copied()
}

/// Positional arguments of one builtin call.
struct Args {
    name: &'static str,
    values: Vec<Value>,
}

impl Args {
    fn get(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&Value::Absent)
    }

    fn error(&self, index: usize, expected: &str) -> ConvertError {
        ConvertError::eval(format!(
            "function ${}: argument {} must be {}, got {}",
            self.name,
            index + 1,
            expected,
            type_name(self.get(index))
        ))
    }

    fn fail(&self, message: impl std::fmt::Display) -> ConvertError {
        ConvertError::eval(format!("function ${}: {}", self.name, message))
    }

    fn string(&self, index: usize) -> Result<Option<&str>, ConvertError> {
        match self.get(index) {
            Value::Absent => Ok(None),
            Value::Json(JsonValue::String(s)) => Ok(Some(s)),
            _ => Err(self.error(index, "a string")),
        }
    }

    /// A string or regex argument; required, so absence is an error.
    fn pattern(&self, index: usize) -> Result<Pattern<'_>, ConvertError> {
        match self.get(index) {
            Value::Json(JsonValue::String(s)) => Ok(Pattern::Text(s)),
            Value::Func(func) => match func.as_ref() {
                Callable::Regex(regex) => Ok(Pattern::Regex(regex)),
                _ => Err(self.error(index, "a string or regex")),
            },
            _ => Err(self.error(index, "a string or regex")),
        }
    }

    /// Optional non-negative count argument such as the limit of `$split`.
    fn limit(&self, index: usize) -> Result<Option<usize>, ConvertError> {
        match self.number(index)? {
            Some(n) if n < 0.0 => Err(self.fail("the limit must not be negative")),
            Some(n) => Ok(Some(n.floor() as usize)),
            None => Ok(None),
        }
    }

    fn number(&self, index: usize) -> Result<Option<f64>, ConvertError> {
        match self.get(index) {
            Value::Absent => Ok(None),
            Value::Json(JsonValue::Number(n)) => Ok(n.as_f64()),
            _ => Err(self.error(index, "a number")),
        }
    }

    /// An array argument; a scalar counts as a one-item array.
    fn items(&self, index: usize) -> Result<Option<Vec<JsonValue>>, ConvertError> {
        match self.get(index) {
            Value::Absent => Ok(None),
            Value::Json(value) => Ok(Some(into_items(value.clone()))),
            Value::Func(_) => Err(self.error(index, "an array")),
        }
    }

    fn numbers(&self, index: usize) -> Result<Option<Vec<f64>>, ConvertError> {
        let Some(items) = self.items(index)? else {
            return Ok(None);
        };
        items
            .iter()
            .map(|item| item.as_f64().ok_or_else(|| self.error(index, "an array of numbers")))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    fn function(&self, index: usize) -> Result<Rc<Callable>, ConvertError> {
        match self.get(index) {
            Value::Func(func) => Ok(Rc::clone(func)),
            _ => Err(self.error(index, "a function")),
        }
    }
}

enum Pattern<'a> {
    Text(&'a str),
    Regex(&'a Regex),
}

fn string_value(text: impl Into<String>) -> Value {
    Value::Json(JsonValue::String(text.into()))
}

fn bool_value(b: bool) -> Value {
    Value::Json(JsonValue::Bool(b))
}

impl<'a> Evaluator<'a> {
    pub(crate) fn call_builtin(
        &self,
        builtin: &Builtin,
        mut values: Vec<Value>,
        input: &JsonValue,
    ) -> Result<Value, ConvertError> {
        if builtin.context_arg && values.len() + 1 == builtin.min_args {
            values.insert(0, Value::Json(input.clone()));
        }
        if values.len() < builtin.min_args || values.len() > builtin.max_args {
            let expected = if builtin.min_args == builtin.max_args {
                builtin.min_args.to_string()
            } else {
                format!("{} to {}", builtin.min_args, builtin.max_args)
            };
            return Err(ConvertError::eval(format!(
                "function ${} expects {} arguments, got {}",
                builtin.name,
                expected,
                values.len()
            )));
        }
        let args = Args {
            name: builtin.name,
            values,
        };

        match builtin.name {
            "string" => string_fn(&args),
            "number" => number_fn(&args),
            "boolean" => Ok(match args.get(0) {
                Value::Absent => Value::Absent,
                other => bool_value(truthy(other)),
            }),
            "not" => Ok(match args.get(0) {
                Value::Absent => Value::Absent,
                other => bool_value(!truthy(other)),
            }),
            "exists" => Ok(bool_value(!args.get(0).is_absent())),
            "count" => Ok(Value::Json(JsonValue::from(match args.get(0) {
                Value::Absent => 0,
                Value::Json(JsonValue::Array(items)) => items.len(),
                _ => 1,
            }))),
            "sum" | "max" | "min" | "average" => aggregate_fn(&args),
            "length" => Ok(match args.string(0)? {
                Some(s) => Value::Json(JsonValue::from(s.chars().count())),
                None => Value::Absent,
            }),
            "substring" => substring_fn(&args),
            "substringBefore" | "substringAfter" => {
                let (Some(text), Some(chars)) = (args.string(0)?, args.string(1)?) else {
                    return Ok(args.string(0)?.map(string_value).unwrap_or(Value::Absent));
                };
                let result = match text.find(chars) {
                    Some(pos) if builtin.name == "substringBefore" => &text[..pos],
                    Some(pos) => &text[pos + chars.len()..],
                    None => text,
                };
                Ok(string_value(result))
            }
            "uppercase" => Ok(args
                .string(0)?
                .map(|s| string_value(s.to_uppercase()))
                .unwrap_or(Value::Absent)),
            "lowercase" => Ok(args
                .string(0)?
                .map(|s| string_value(s.to_lowercase()))
                .unwrap_or(Value::Absent)),
            "trim" => Ok(args
                .string(0)?
                .map(|s| string_value(s.split_whitespace().collect::<Vec<_>>().join(" ")))
                .unwrap_or(Value::Absent)),
            "contains" => {
                let Some(text) = args.string(0)? else {
                    return Ok(Value::Absent);
                };
                Ok(bool_value(match args.pattern(1)? {
                    Pattern::Text(pattern) => text.contains(pattern),
                    Pattern::Regex(regex) => regex.is_match(text),
                }))
            }
            "split" => split_fn(&args),
            "join" => join_fn(&args),
            "replace" => replace_fn(&args),
            "match" => match_fn(&args),
            "pad" => pad_fn(&args),
            "keys" => Ok(keys_fn(args.get(0))),
            "lookup" => {
                let key = args.string(1)?.ok_or_else(|| args.error(1, "a string"))?;
                Ok(match args.get(0) {
                    Value::Json(value) => lookup_key(value, key),
                    _ => Value::Absent,
                })
            }
            "merge" => merge_fn(&args),
            "append" => Ok(match (args.get(0), args.get(1)) {
                (Value::Absent, other) | (other, Value::Absent) => other.clone(),
                (Value::Json(first), Value::Json(second)) => {
                    let mut items = into_items(first.clone());
                    items.extend(into_items(second.clone()));
                    Value::Json(JsonValue::Array(items))
                }
                _ => return Err(args.fail("cannot append a function")),
            }),
            "distinct" => Ok(match args.get(0) {
                Value::Json(JsonValue::Array(items)) => {
                    let mut unique: Vec<JsonValue> = Vec::with_capacity(items.len());
                    for item in items {
                        if !unique.iter().any(|seen| json_equal(seen, item)) {
                            unique.push(item.clone());
                        }
                    }
                    Value::Json(JsonValue::Array(unique))
                }
                other => other.clone(),
            }),
            "reverse" => Ok(match args.get(0) {
                Value::Json(JsonValue::Array(items)) => {
                    Value::Json(JsonValue::Array(items.iter().rev().cloned().collect()))
                }
                other => other.clone(),
            }),
            "sort" => self.sort_fn(&args, input),
            "type" => Ok(match args.get(0) {
                Value::Absent => Value::Absent,
                Value::Func(_) => string_value("function"),
                Value::Json(value) => string_value(json_type_name(value)),
            }),
            "abs" | "floor" | "ceil" | "sqrt" => {
                let Some(n) = args.number(0)? else {
                    return Ok(Value::Absent);
                };
                let result = match builtin.name {
                    "abs" => n.abs(),
                    "floor" => n.floor(),
                    "ceil" => n.ceil(),
                    _ if n < 0.0 => {
                        return Err(args.fail("cannot take the square root of a negative number"));
                    }
                    _ => n.sqrt(),
                };
                finite_number(result, builtin.name).map(Value::Json)
            }
            "round" => {
                let Some(n) = args.number(0)? else {
                    return Ok(Value::Absent);
                };
                let precision = args.number(1)?.unwrap_or(0.0).trunc() as i32;
                finite_number(round_half_even(n, precision), "$round").map(Value::Json)
            }
            "power" => {
                let Some(base) = args.number(0)? else {
                    return Ok(Value::Absent);
                };
                let exponent = args.number(1)?.ok_or_else(|| args.error(1, "a number"))?;
                finite_number(base.powf(exponent), "$power").map(Value::Json)
            }
            "map" | "filter" => self.map_filter_fn(&args, input),
            "reduce" => self.reduce_fn(&args, input),
            "each" => self.each_fn(&args, input),
            "single" => self.single_fn(&args, input),
            other => Err(ConvertError::eval(format!("unknown function ${}", other))),
        }
    }

    /// Call `func` with as many of `candidates` as it declares parameters.
    fn call_with(
        &self,
        func: &Rc<Callable>,
        candidates: Vec<Value>,
        input: &JsonValue,
    ) -> Result<Value, ConvertError> {
        let arity = func.arity();
        let args = candidates.into_iter().take(arity).collect();
        self.call_function(func, args, input)
    }

    fn map_filter_fn(&self, args: &Args, input: &JsonValue) -> Result<Value, ConvertError> {
        let Some(items) = args.items(0)? else {
            return Ok(Value::Absent);
        };
        let func = args.function(1)?;
        let whole = JsonValue::Array(items.clone());
        let mut out = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let result = self.call_with(
                &func,
                vec![
                    Value::Json(item.clone()),
                    Value::Json(JsonValue::from(index)),
                    Value::Json(whole.clone()),
                ],
                input,
            )?;
            if args.name == "filter" {
                if truthy(&result) {
                    out.push(item);
                }
            } else if let Value::Json(value) = result {
                out.push(value);
            }
        }
        Ok(collapse(out))
    }

    fn reduce_fn(&self, args: &Args, input: &JsonValue) -> Result<Value, ConvertError> {
        let Some(items) = args.items(0)? else {
            return Ok(Value::Absent);
        };
        let func = args.function(1)?;
        if func.arity() < 2 {
            return Err(args.fail("the reducer must take at least two parameters"));
        }
        let whole = JsonValue::Array(items.clone());
        let mut items = items.into_iter().enumerate();
        let mut acc = match args.get(2) {
            Value::Absent => match items.next() {
                Some((_, first)) => Value::Json(first),
                None => return Ok(Value::Absent),
            },
            init => init.clone(),
        };
        for (index, item) in items {
            acc = self.call_with(
                &func,
                vec![
                    acc,
                    Value::Json(item),
                    Value::Json(JsonValue::from(index)),
                    Value::Json(whole.clone()),
                ],
                input,
            )?;
        }
        Ok(acc)
    }

    fn each_fn(&self, args: &Args, input: &JsonValue) -> Result<Value, ConvertError> {
        let object = match args.get(0) {
            Value::Absent => return Ok(Value::Absent),
            Value::Json(JsonValue::Object(map)) => map.clone(),
            _ => return Err(args.error(0, "an object")),
        };
        let func = args.function(1)?;
        let whole = JsonValue::Object(object.clone());
        let mut out = Vec::new();
        for (key, value) in object {
            let result = self.call_with(
                &func,
                vec![
                    Value::Json(value),
                    string_value(key),
                    Value::Json(whole.clone()),
                ],
                input,
            )?;
            if let Value::Json(value) = result {
                out.push(value);
            }
        }
        Ok(collapse(out))
    }

    fn single_fn(&self, args: &Args, input: &JsonValue) -> Result<Value, ConvertError> {
        let Some(items) = args.items(0)? else {
            return Ok(Value::Absent);
        };
        let func = match args.get(1) {
            Value::Absent => None,
            _ => Some(args.function(1)?),
        };
        let whole = JsonValue::Array(items.clone());
        let mut found = None;
        for (index, item) in items.into_iter().enumerate() {
            let matched = match &func {
                Some(func) => truthy(&self.call_with(
                    func,
                    vec![
                        Value::Json(item.clone()),
                        Value::Json(JsonValue::from(index)),
                        Value::Json(whole.clone()),
                    ],
                    input,
                )?),
                None => true,
            };
            if matched {
                if found.is_some() {
                    return Err(args.fail("more than one value matched"));
                }
                found = Some(item);
            }
        }
        found
            .map(Value::Json)
            .ok_or_else(|| args.fail("no value matched"))
    }

    fn sort_fn(&self, args: &Args, input: &JsonValue) -> Result<Value, ConvertError> {
        let items = match args.get(0) {
            Value::Absent => return Ok(Value::Absent),
            Value::Json(JsonValue::Array(items)) => items.clone(),
            other => return Ok(other.clone()),
        };
        let sorted = match args.get(1) {
            Value::Absent => {
                let all_numbers = items.iter().all(JsonValue::is_number);
                let all_strings = items.iter().all(JsonValue::is_string);
                if !all_numbers && !all_strings {
                    return Err(args.fail(
                        "without a comparator the array must hold only numbers or only strings",
                    ));
                }
                merge_sort(items, &mut |a: &JsonValue, b: &JsonValue| {
                    Ok(match (a, b) {
                        (JsonValue::String(a), JsonValue::String(b)) => a > b,
                        _ => a.as_f64() > b.as_f64(),
                    })
                })?
            }
            _ => {
                let func = args.function(1)?;
                merge_sort(items, &mut |a: &JsonValue, b: &JsonValue| {
                    let swap = self.call_with(
                        &func,
                        vec![Value::Json(a.clone()), Value::Json(b.clone())],
                        input,
                    )?;
                    Ok(truthy(&swap))
                })?
            }
        };
        Ok(Value::Json(JsonValue::Array(sorted)))
    }
}

// =============================================================================
// Value functions
// =============================================================================

fn string_fn(args: &Args) -> Result<Value, ConvertError> {
    let pretty = truthy(args.get(1));
    Ok(match args.get(0) {
        Value::Absent => Value::Absent,
        Value::Func(_) => string_value(""),
        Value::Json(value) => string_value(json_to_string(value, pretty)),
    })
}

fn number_fn(args: &Args) -> Result<Value, ConvertError> {
    match args.get(0) {
        Value::Absent => Ok(Value::Absent),
        Value::Json(JsonValue::Number(n)) => Ok(Value::Json(JsonValue::Number(n.clone()))),
        Value::Json(JsonValue::Bool(b)) => Ok(Value::Json(JsonValue::from(u8::from(*b)))),
        Value::Json(JsonValue::String(s)) => {
            let parsed = serde_json::from_str::<JsonValue>(s.trim())
                .ok()
                .and_then(|value| value.as_f64());
            match parsed {
                Some(n) => finite_number(n, "$number").map(Value::Json),
                None => Err(args.fail(format!("unable to cast '{}' to a number", s))),
            }
        }
        _ => Err(args.error(0, "a number, string or boolean")),
    }
}

fn aggregate_fn(args: &Args) -> Result<Value, ConvertError> {
    let Some(numbers) = args.numbers(0)? else {
        return Ok(Value::Absent);
    };
    if numbers.is_empty() {
        return Ok(if args.name == "sum" {
            Value::Json(JsonValue::from(0))
        } else {
            Value::Absent
        });
    }
    let sum: f64 = numbers.iter().sum();
    let result = match args.name {
        "sum" => sum,
        "max" => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        "min" => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        _ => sum / numbers.len() as f64,
    };
    finite_number(result, args.name).map(Value::Json)
}

fn substring_fn(args: &Args) -> Result<Value, ConvertError> {
    let Some(text) = args.string(0)? else {
        return Ok(Value::Absent);
    };
    let start = args.number(1)?.ok_or_else(|| args.error(1, "a number"))?;
    let length = args.number(2)?;

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as f64;
    let mut start = start.floor();
    if start < 0.0 {
        start = (len + start).max(0.0);
    }
    let start = start.min(len);
    let end = match length {
        Some(length) if length <= 0.0 => start,
        Some(length) => (start + length.floor()).min(len),
        None => len,
    };
    Ok(string_value(
        chars[start as usize..end as usize].iter().collect::<String>(),
    ))
}

fn split_fn(args: &Args) -> Result<Value, ConvertError> {
    let Some(text) = args.string(0)? else {
        return Ok(Value::Absent);
    };
    let limit = args.limit(2)?.unwrap_or(usize::MAX);
    let parts: Vec<JsonValue> = match args.pattern(1)? {
        Pattern::Text("") => text
            .chars()
            .take(limit)
            .map(|c| JsonValue::String(c.to_string()))
            .collect(),
        Pattern::Text(separator) => text
            .split(separator)
            .take(limit)
            .map(|part| JsonValue::String(part.to_string()))
            .collect(),
        Pattern::Regex(regex) => regex
            .split(text)
            .take(limit)
            .map(|part| JsonValue::String(part.to_string()))
            .collect(),
    };
    Ok(Value::Json(JsonValue::Array(parts)))
}

fn join_fn(args: &Args) -> Result<Value, ConvertError> {
    let Some(items) = args.items(0)? else {
        return Ok(Value::Absent);
    };
    let separator = args.string(1)?.unwrap_or("");
    let mut parts = Vec::with_capacity(items.len());
    for item in &items {
        match item {
            JsonValue::String(s) => parts.push(s.as_str()),
            _ => return Err(args.error(0, "an array of strings")),
        }
    }
    Ok(string_value(parts.join(separator)))
}

/// Literal patterns replace text as is; regex replacements may refer to groups
/// with `$1` or `${name}`.
fn replace_fn(args: &Args) -> Result<Value, ConvertError> {
    let Some(text) = args.string(0)? else {
        return Ok(Value::Absent);
    };
    let pattern = args.pattern(1)?;
    let replacement = args.string(2)?.ok_or_else(|| args.error(2, "a string"))?;
    let limit = args.limit(3)?;
    let result = match pattern {
        Pattern::Text("") => return Err(args.fail("the pattern must not be empty")),
        Pattern::Text(pattern) => match limit {
            Some(n) => text.replacen(pattern, replacement, n),
            None => text.replace(pattern, replacement),
        },
        // a limit of 0 means "replace all" to the regex crate
        Pattern::Regex(_) if limit == Some(0) => text.to_string(),
        Pattern::Regex(regex) => regex
            .replacen(text, limit.unwrap_or(0), replacement)
            .into_owned(),
    };
    Ok(string_value(result))
}

fn match_fn(args: &Args) -> Result<Value, ConvertError> {
    let Some(text) = args.string(0)? else {
        return Ok(Value::Absent);
    };
    let Pattern::Regex(regex) = args.pattern(1)? else {
        return Err(args.error(1, "a regex"));
    };
    let limit = args.limit(2)?.unwrap_or(usize::MAX);
    let matches = regex
        .captures_iter(text)
        .take(limit)
        .map(|caps| match_object(text, &caps))
        .collect();
    Ok(collapse(matches))
}

/// `{"match", "index", "groups"}` for one regex match. `index` counts characters;
/// groups that did not participate are empty strings.
pub(crate) fn match_object(text: &str, caps: &Captures<'_>) -> JsonValue {
    let Some(whole) = caps.get(0) else {
        return JsonValue::Null;
    };
    let groups: Vec<JsonValue> = caps
        .iter()
        .skip(1)
        .map(|group| JsonValue::String(group.map(|m| m.as_str()).unwrap_or("").to_string()))
        .collect();
    let mut object = Map::new();
    object.insert("match".to_string(), JsonValue::String(whole.as_str().to_string()));
    object.insert(
        "index".to_string(),
        JsonValue::from(text[..whole.start()].chars().count()),
    );
    object.insert("groups".to_string(), JsonValue::Array(groups));
    JsonValue::Object(object)
}

fn pad_fn(args: &Args) -> Result<Value, ConvertError> {
    let Some(text) = args.string(0)? else {
        return Ok(Value::Absent);
    };
    let width = args.number(1)?.ok_or_else(|| args.error(1, "a number"))?.trunc();
    let fill = match args.string(2)? {
        Some("") | None => " ",
        Some(fill) => fill,
    };
    if width.abs() > MAX_RANGE_LEN as f64 {
        return Err(args.fail(format!("width {} exceeds {}", width, MAX_RANGE_LEN)));
    }
    let current = text.chars().count();
    let target = width.abs() as usize;
    if target <= current {
        return Ok(string_value(text));
    }
    let padding: String = fill.chars().cycle().take(target - current).collect();
    Ok(string_value(if width > 0.0 {
        format!("{}{}", text, padding)
    } else {
        format!("{}{}", padding, text)
    }))
}

fn keys_fn(value: &Value) -> Value {
    let mut keys: Vec<JsonValue> = Vec::new();
    let mut add = |map: &Map<String, JsonValue>| {
        for key in map.keys() {
            let key = JsonValue::String(key.clone());
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    };
    match value {
        Value::Json(JsonValue::Object(map)) => add(map),
        Value::Json(JsonValue::Array(items)) => {
            for item in items {
                if let JsonValue::Object(map) = item {
                    add(map);
                }
            }
        }
        _ => {}
    }
    collapse(keys)
}

fn lookup_key(value: &JsonValue, key: &str) -> Value {
    match value {
        JsonValue::Object(map) => map
            .get(key)
            .map(|value| Value::Json(value.clone()))
            .unwrap_or(Value::Absent),
        JsonValue::Array(items) => {
            let mut found = Vec::new();
            for item in items {
                match lookup_key(item, key) {
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

fn merge_fn(args: &Args) -> Result<Value, ConvertError> {
    let Some(items) = args.items(0)? else {
        return Ok(Value::Absent);
    };
    let mut merged = Map::new();
    for item in items {
        match item {
            JsonValue::Object(map) => merged.extend(map),
            _ => return Err(args.error(0, "an array of objects")),
        }
    }
    Ok(Value::Json(JsonValue::Object(merged)))
}

/// Round half to even at `precision` decimal places. The decimal shift goes
/// through exponent notation so `2.675` at two places sees `267.5`.
fn round_half_even(value: f64, precision: i32) -> f64 {
    let shifted = format!("{}e{}", value, precision)
        .parse::<f64>()
        .unwrap_or(value);
    let rounded = shifted.round_ties_even();
    format!("{}e{}", rounded, -precision)
        .parse::<f64>()
        .unwrap_or(rounded)
}

/// Stable merge sort; `after(a, b)` returns true when `a` must come after `b`.
fn merge_sort<F>(mut items: Vec<JsonValue>, after: &mut F) -> Result<Vec<JsonValue>, ConvertError>
where
    F: FnMut(&JsonValue, &JsonValue) -> Result<bool, ConvertError>,
{
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, after)?;
    let right = merge_sort(right, after)?;

    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => after(a, b)?,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        if let Some(value) = next {
            out.push(value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod query_functions_tests {
    use crate::error::ConvertErrorKind;
    use crate::query_eval::{EvalValue, evaluate};
    use serde_json::{Value as JsonValue, json};

    fn value(doc: &JsonValue, expr: &str) -> JsonValue {
        match evaluate(doc, expr).unwrap() {
            EvalValue::Value(v) => v,
            EvalValue::Missing => panic!("expected a value for {expr}"),
        }
    }

    fn run(expr: &str) -> JsonValue {
        value(&json!({}), expr)
    }

    fn missing(expr: &str) -> bool {
        evaluate(&json!({}), expr).unwrap().is_missing()
    }

    #[test]
    fn test_string_and_number_casts() {
        assert_eq!(run("$string(100)"), json!("100"));
        assert_eq!(run("$string(1.5)"), json!("1.5"));
        assert_eq!(run("$string(true)"), json!("true"));
        assert_eq!(run("$string({'a': [1, 2]})"), json!(r#"{"a":[1,2]}"#));
        assert_eq!(run("$number('12.5')"), json!(12.5));
        assert_eq!(run("$number(true)"), json!(1));
        assert!(missing("$string($undefined)"));
        assert!(evaluate(&json!({}), "$number('abc')").is_err());
    }

    #[test]
    fn test_boolean_functions() {
        assert_eq!(run("$boolean('')"), json!(false));
        assert_eq!(run("$boolean([0, 1])"), json!(true));
        assert_eq!(run("$not(0)"), json!(true));
        assert_eq!(run("$exists(nothing)"), json!(false));
        assert_eq!(run("$exists(0)"), json!(true));
    }

    #[test]
    fn test_numeric_aggregates() {
        let doc = json!({"v": [1, 2, 3, 6]});
        assert_eq!(value(&doc, "$count(v)"), json!(4));
        assert_eq!(value(&doc, "$sum(v)"), json!(12));
        assert_eq!(value(&doc, "$max(v)"), json!(6));
        assert_eq!(value(&doc, "$min(v)"), json!(1));
        assert_eq!(value(&doc, "$average(v)"), json!(3));
        assert_eq!(value(&doc, "$count(nothing)"), json!(0));
        assert_eq!(value(&doc, "$sum([])"), json!(0));
        assert!(evaluate(&doc, "$max([])").unwrap().is_missing());
        assert!(evaluate(&json!({"v": ["a"]}), "$sum(v)").is_err());
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(run("$length('héllo')"), json!(5));
        assert_eq!(run("$substring('Hello World', 3)"), json!("lo World"));
        assert_eq!(run("$substring('Hello World', 3, 5)"), json!("lo Wo"));
        assert_eq!(run("$substring('Hello World', -4)"), json!("orld"));
        assert_eq!(run("$substringBefore('a-b-c', '-')"), json!("a"));
        assert_eq!(run("$substringAfter('a-b-c', '-')"), json!("b-c"));
        assert_eq!(run("$substringAfter('abc', '-')"), json!("abc"));
        assert_eq!(run("$uppercase('abc')"), json!("ABC"));
        assert_eq!(run("$lowercase('ABC')"), json!("abc"));
        assert_eq!(run("$trim('  a \n b  ')"), json!("a b"));
        assert_eq!(run("$contains('abc', 'bc')"), json!(true));
        assert_eq!(run("$split('a,b,c', ',')"), json!(["a", "b", "c"]));
        assert_eq!(run("$split('a,b,c', ',', 2)"), json!(["a", "b"]));
        assert_eq!(run("$join(['a', 'b'], '-')"), json!("a-b"));
        assert_eq!(run("$replace('a.b.c', '.', '/')"), json!("a/b/c"));
        assert_eq!(run("$replace('a.b.c', '.', '/', 1)"), json!("a/b.c"));
        assert_eq!(run("$pad('7', -3, '0')"), json!("007"));
        assert_eq!(run("$pad('ab', 4)"), json!("ab  "));
    }

    #[test]
    fn test_pad_width_is_capped() {
        let err = evaluate(&json!({}), "$pad('x', 1e15)").unwrap_err();
        assert_eq!(err.kind, ConvertErrorKind::Evaluation);
        assert!(err.message.contains("$pad"));
        assert!(evaluate(&json!({}), "$pad('x', -1e15)").is_err());
    }

    #[test]
    fn test_regex_patterns() {
        let doc = json!({"s": "a-b-c", "code": "Ab_12"});
        assert_eq!(value(&doc, "$replace(s, /-/, '_')"), json!("a_b_c"));
        assert_eq!(value(&doc, "$replace(s, /-/, '_', 1)"), json!("a_b-c"));
        assert_eq!(value(&doc, "$replace(s, /-/, '_', 0)"), json!("a-b-c"));
        assert_eq!(value(&doc, "$replace(code, /([a-z]+)_(\\d+)/i, '$2$1')"), json!("12Ab"));
        assert_eq!(value(&doc, "$split(s, /-/)"), json!(["a", "b", "c"]));
        assert_eq!(value(&doc, "$split(s, /-/, 2)"), json!(["a", "b"]));
        assert_eq!(value(&doc, "$contains(code, /ab/i)"), json!(true));
        assert_eq!(value(&doc, "$contains(code, /ab/)"), json!(false));
        assert_eq!(value(&doc, "s.$contains(/^a/)"), json!(true));
    }

    #[test]
    fn test_match() {
        let doc = json!({"s": "x1 é22"});
        assert_eq!(
            value(&doc, "$match(s, /[a-zé](\\d+)/)"),
            json!([
                {"match": "x1", "index": 0, "groups": ["1"]},
                {"match": "é22", "index": 3, "groups": ["22"]}
            ])
        );
        assert_eq!(
            value(&doc, "$match(s, /(\\d)(z)?/, 1)"),
            json!({"match": "1", "index": 1, "groups": ["1", ""]})
        );
        assert!(missing("$match('abc', /z/)"));
        assert!(missing("$match($undefined, /z/)"));
        assert!(evaluate(&json!({}), "$match('abc', 'b')").is_err());
    }

    #[test]
    fn test_regex_is_callable() {
        assert_eq!(run("/a(b)/('xab').groups"), json!(["b"]));
        assert!(missing("/z/('xab')"));
        assert_eq!(run("$type(/a/)"), json!("function"));
    }

    #[test]
    fn test_string_function_type_error_names_function() {
        let err = evaluate(&json!({}), "$uppercase(1)").unwrap_err();
        assert_eq!(err.kind, ConvertErrorKind::Evaluation);
        assert!(err.message.contains("$uppercase"));
    }

    #[test]
    fn test_arity_error() {
        let err = evaluate(&json!({}), "$substring()").unwrap_err();
        assert!(err.message.contains("$substring"));
    }

    #[test]
    fn test_context_argument() {
        let doc = json!({"names": ["ada", "bob"]});
        assert_eq!(value(&doc, "names.$uppercase()"), json!(["ADA", "BOB"]));
        assert_eq!(value(&doc, "names.$string()"), json!(["ada", "bob"]));
    }

    #[test]
    fn test_object_functions() {
        let doc = json!({"o": {"a": 1, "b": 2}, "list": [{"a": 1}, {"a": 2, "c": 3}]});
        assert_eq!(value(&doc, "$keys(o)"), json!(["a", "b"]));
        assert_eq!(value(&doc, "$keys(list)"), json!(["a", "c"]));
        assert_eq!(value(&doc, "$lookup(o, 'b')"), json!(2));
        assert_eq!(value(&doc, "$lookup(list, 'a')"), json!([1, 2]));
        assert_eq!(value(&doc, "$merge(list)"), json!({"a": 2, "c": 3}));
        assert_eq!(value(&doc, "$type(o)"), json!("object"));
        assert_eq!(value(&doc, "$type($uppercase)"), json!("function"));
    }

    #[test]
    fn test_array_functions() {
        assert_eq!(run("$append([1, 2], 3)"), json!([1, 2, 3]));
        assert_eq!(run("$append(nothing, 3)"), json!(3));
        assert_eq!(run("$distinct([1, 2, 1, 1.0])"), json!([1, 2]));
        assert_eq!(run("$reverse([1, 2, 3])"), json!([3, 2, 1]));
        assert_eq!(run("$sort([3, 1, 2])"), json!([1, 2, 3]));
        assert_eq!(run("$sort(['b', 'a'])"), json!(["a", "b"]));
        assert_eq!(run("$sort([1, 3, 2], function($l, $r) { $l < $r })"), json!([3, 2, 1]));
        assert!(evaluate(&json!({}), "$sort([1, 'a'])").is_err());
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(run("$abs(-3)"), json!(3));
        assert_eq!(run("$floor(2.7)"), json!(2));
        assert_eq!(run("$ceil(2.1)"), json!(3));
        assert_eq!(run("$round(2.5)"), json!(2));
        assert_eq!(run("$round(3.5)"), json!(4));
        assert_eq!(run("$round(2.675, 2)"), json!(2.68));
        assert_eq!(run("$power(2, 10)"), json!(1024));
        assert_eq!(run("$sqrt(16)"), json!(4));
        assert!(evaluate(&json!({}), "$sqrt(-1)").is_err());
    }

    #[test]
    fn test_higher_order_functions() {
        assert_eq!(run("$map([1, 2, 3], function($v) { $v * 10 })"), json!([10, 20, 30]));
        assert_eq!(run("$map(['a', 'b'], function($v, $i) { $v & $i })"), json!(["a0", "b1"]));
        assert_eq!(run("$filter([1, 2, 3, 4], function($v) { $v % 2 = 0 })"), json!([2, 4]));
        assert_eq!(run("$reduce([1, 2, 3], function($acc, $v) { $acc + $v })"), json!(6));
        assert_eq!(run("$reduce([1, 2, 3], function($acc, $v) { $acc + $v }, 10)"), json!(16));
        assert_eq!(
            run("$each({'a': 1, 'b': 2}, function($v, $k) { $k & '=' & $v })"),
            json!(["a=1", "b=2"])
        );
        assert_eq!(run("$single([1, 2, 3], function($v) { $v > 2 })"), json!(3));
        assert!(evaluate(&json!({}), "$single([1, 2])").is_err());
        assert_eq!(run("$map(['a', 'b'], $uppercase)"), json!(["A", "B"]));
    }

    #[test]
    fn test_absent_first_argument_propagates() {
        for expr in [
            "$uppercase(nothing)",
            "$substring(nothing, 1)",
            "$join(nothing)",
            "$map(nothing, function($v) { $v })",
            "$round(nothing)",
            "$keys(nothing)",
        ] {
            assert!(missing(expr), "{expr}");
        }
    }
}
