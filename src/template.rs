//! Template engine: `{{ expr }}` extraction and recursive substitution.
//!
//! Expressions are CEL programs evaluated against the layered context.
//! A string that is exactly one token ("complete template") yields the
//! raw typed result; a token embedded in other text ("inline") splices
//! the stringified result. `walk` applies this rule type-directed over
//! arbitrary JSON values, and over typed records via a
//! dump, walk, revalidate round trip.

use crate::context::LayeredContext;
use crate::error::{Error, Result};
use cel::{Context, Program};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{(.+?)\}\}").expect("failed to compile token regex")
});

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("failed to compile ident regex")
});

/// Marker embedded in execution errors raised by bounded generators,
/// recognized when mapping CEL failures back to engine errors.
const COMPREHENSION_LIMIT_MARKER: &str = "comprehension limit exceeded";

/// Recursive template substitution over values and typed records.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    max_comprehension_length: usize,
}

impl TemplateEngine {
    pub fn new(max_comprehension_length: usize) -> Self {
        Self {
            max_comprehension_length,
        }
    }

    /// Type-directed substitution: strings are rendered, mappings and
    /// lists recurse, keys are never substituted, scalars pass through.
    pub fn walk(&self, value: &Value, ctx: &LayeredContext) -> Result<Value> {
        match value {
            Value::String(s) => self.render_str(s, ctx),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.walk(item, ctx)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.walk(item, ctx))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            scalar => Ok(scalar.clone()),
        }
    }

    /// Walk a typed record: dump to a JSON tree, substitute, and
    /// revalidate into the original shape (variants preserved).
    pub fn walk_record<T>(&self, record: &T, ctx: &LayeredContext) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let dumped = serde_json::to_value(record)
            .map_err(|e| Error::validation(format!("cannot dump record: {e}")))?;
        let walked = self.walk(&dumped, ctx)?;
        serde_json::from_value(walked).map_err(|e| {
            Error::validation(format!("substituted record no longer validates: {e}"))
        })
    }

    /// Render a single string: complete templates keep their evaluated
    /// type, inline templates splice stringified results.
    pub fn render_str(&self, s: &str, ctx: &LayeredContext) -> Result<Value> {
        let mut tokens = TOKEN_RE.find_iter(s);
        let (first, second) = (tokens.next(), tokens.next());

        if let (Some(only), None) = (&first, &second) {
            if only.start() == 0 && only.end() == s.len() {
                let expr = &s[only.start() + 2..only.end() - 2];
                return self.evaluate(expr, ctx);
            }
        }
        if first.is_none() {
            return Ok(Value::String(s.to_string()));
        }

        let mut out = String::with_capacity(s.len());
        let mut last_end = 0;
        for caps in TOKEN_RE.captures_iter(s) {
            let whole = caps.get(0).expect("regex match has group 0");
            out.push_str(&s[last_end..whole.start()]);
            let result = self.evaluate(&caps[1], ctx)?;
            out.push_str(&stringify(&result));
            last_end = whole.end();
        }
        out.push_str(&s[last_end..]);
        Ok(Value::String(out))
    }

    /// Evaluate one expression against the context, returning JSON.
    pub fn evaluate(&self, expr: &str, ctx: &LayeredContext) -> Result<Value> {
        let trimmed = expr.trim();
        let processed = preprocess_expr(trimmed);
        debug!("evaluating expression: {processed}");

        let program = Program::compile(&processed)
            .map_err(|e| Error::template(trimmed, format!("compile error: {e}")))?;

        let vars = Arc::new(ctx.flatten());
        let cel_ctx = self.build_context(&vars).map_err(|message| Error::Template {
            expression: trimmed.to_string(),
            message,
            location: Default::default(),
        })?;

        let result = program
            .execute(&cel_ctx)
            .map_err(|e| self.execution_error(trimmed, e))?;

        result
            .json()
            .map_err(|e| Error::template(trimmed, format!("result not representable: {e}")))
    }

    /// Evaluate and coerce to a truth value (non-zero, non-empty).
    pub fn evaluate_truthy(&self, expr: &str, ctx: &LayeredContext) -> Result<bool> {
        Ok(json_is_truthy(&self.evaluate(expr, ctx)?))
    }

    fn execution_error(&self, expr: &str, err: cel::ExecutionError) -> Error {
        let message = err.to_string();
        if message.contains(COMPREHENSION_LIMIT_MARKER) {
            Error::ComprehensionLimit {
                limit: self.max_comprehension_length,
                location: Default::default(),
            }
        } else {
            Error::template(expr, message)
        }
    }

    fn build_context<'a>(
        &self,
        vars: &Arc<HashMap<String, Value>>,
    ) -> std::result::Result<Context<'a>, String> {
        let mut context = Context::default();

        for (key, value) in vars.iter() {
            if !IDENT_RE.is_match(key) {
                continue;
            }
            context
                .add_variable(key.as_str(), value.clone())
                .map_err(|e| format!("cannot bind variable '{key}': {e}"))?;
        }

        register_helpers(&mut context, vars.clone(), self.max_comprehension_length);
        Ok(context)
    }
}

/// Rewrite spelling aliases onto CEL's names: `len(` → `size(`,
/// `str(` → `string(`, `float(` → `double(`.
fn preprocess_expr(expr: &str) -> String {
    static LEN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\blen\(").expect("failed to compile len regex")
    });
    static STR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\bstr\(").expect("failed to compile str regex")
    });
    static FLOAT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\bfloat\(").expect("failed to compile float regex")
    });

    let result = LEN_RE.replace_all(expr, "size(").into_owned();
    let result = STR_RE.replace_all(&result, "string(").into_owned();
    FLOAT_RE.replace_all(&result, "double(").into_owned()
}

/// String form used when splicing an inline token.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn json_is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn function_error(name: &str, message: impl std::fmt::Display) -> cel::ExecutionError {
    cel::ExecutionError::function_error(name, message.to_string())
}

fn as_number(value: &cel::Value) -> Option<f64> {
    match value {
        cel::Value::Int(i) => Some(*i as f64),
        cel::Value::UInt(u) => Some(*u as f64),
        cel::Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn cel_is_truthy(value: &cel::Value) -> bool {
    match value {
        cel::Value::Bool(b) => *b,
        cel::Value::Int(i) => *i != 0,
        cel::Value::UInt(u) => *u != 0,
        cel::Value::Float(f) => *f != 0.0,
        cel::Value::String(s) => !s.is_empty(),
        cel::Value::Null => false,
        cel::Value::List(list) => !list.is_empty(),
        cel::Value::Map(map) => !map.map.is_empty(),
        _ => true,
    }
}

fn expect_list(name: &'static str, value: &cel::Value) -> std::result::Result<Arc<Vec<cel::Value>>, cel::ExecutionError> {
    match value {
        cel::Value::List(items) => Ok(items.clone()),
        other => Err(function_error(name, format!("expected a list, got {other:?}"))),
    }
}

/// Register the helper functions the expression language provides on
/// top of CEL's own macros and operators.
fn register_helpers(
    context: &mut Context<'_>,
    vars: Arc<HashMap<String, Value>>,
    comprehension_limit: usize,
) {
    // get(name, default): context probe with fallback
    let lookup = vars.clone();
    context.add_function(
        "get",
        move |name: Arc<String>,
              default: cel::Value|
              -> std::result::Result<cel::Value, cel::ExecutionError> {
            match lookup.get(name.as_str()) {
                Some(found) => cel::to_value(found.clone())
                    .map_err(|e| function_error("get", e)),
                None => Ok(default),
            }
        },
    );

    // exists(name): is the name bound anywhere in the context?
    let probe = vars;
    context.add_function("exists", move |name: Arc<String>| -> bool {
        probe.contains_key(name.as_str())
    });

    // env(var, default)
    context.add_function(
        "env",
        |name: Arc<String>, default: Arc<String>| -> Arc<String> {
            Arc::new(std::env::var(name.as_str()).unwrap_or_else(|_| default.to_string()))
        },
    );

    context.add_function("uuid4", || -> Arc<String> {
        Arc::new(uuid::Uuid::new_v4().to_string())
    });

    // range(n) is the comprehension generator; it enforces the element
    // bound so map/filter over it stay bounded.
    context.add_function(
        "range",
        move |n: i64| -> std::result::Result<cel::Value, cel::ExecutionError> {
            if n < 0 {
                return Err(function_error("range", "negative length"));
            }
            if n as usize > comprehension_limit {
                return Err(function_error(
                    "range",
                    format!("{COMPREHENSION_LIMIT_MARKER}: {n} > {comprehension_limit}"),
                ));
            }
            Ok(cel::Value::List(Arc::new(
                (0..n).map(cel::Value::Int).collect(),
            )))
        },
    );

    context.add_function(
        "min",
        |list: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            pick_extreme("min", &list, |a, b| a < b)
        },
    );
    context.add_function(
        "max",
        |list: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            pick_extreme("max", &list, |a, b| a > b)
        },
    );

    context.add_function(
        "sum",
        |list: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            let items = expect_list("sum", &list)?;
            let mut all_int = true;
            let mut total = 0.0f64;
            for item in items.iter() {
                if !matches!(item, cel::Value::Int(_) | cel::Value::UInt(_)) {
                    all_int = false;
                }
                total += as_number(item)
                    .ok_or_else(|| function_error("sum", "non-numeric element"))?;
            }
            if all_int {
                Ok(cel::Value::Int(total as i64))
            } else {
                Ok(cel::Value::Float(total))
            }
        },
    );

    context.add_function(
        "abs",
        |value: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            match value {
                cel::Value::Int(i) => Ok(cel::Value::Int(i.abs())),
                cel::Value::UInt(u) => Ok(cel::Value::UInt(u)),
                cel::Value::Float(f) => Ok(cel::Value::Float(f.abs())),
                other => Err(function_error("abs", format!("expected a number, got {other:?}"))),
            }
        },
    );

    context.add_function(
        "round",
        |value: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            match value {
                cel::Value::Int(i) => Ok(cel::Value::Int(i)),
                cel::Value::UInt(u) => Ok(cel::Value::UInt(u)),
                cel::Value::Float(f) => Ok(cel::Value::Int(f.round() as i64)),
                other => Err(function_error("round", format!("expected a number, got {other:?}"))),
            }
        },
    );

    context.add_function(
        "sorted",
        |list: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            let items = expect_list("sorted", &list)?;
            let mut sorted: Vec<cel::Value> = items.as_ref().clone();
            // Numbers sort numerically, strings lexicographically;
            // mixed lists are an error.
            if sorted.iter().all(|v| as_number(v).is_some()) {
                sorted.sort_by(|a, b| {
                    as_number(a)
                        .partial_cmp(&as_number(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            } else if sorted.iter().all(|v| matches!(v, cel::Value::String(_))) {
                sorted.sort_by(|a, b| match (a, b) {
                    (cel::Value::String(x), cel::Value::String(y)) => x.cmp(y),
                    _ => std::cmp::Ordering::Equal,
                });
            } else {
                return Err(function_error("sorted", "list is not homogeneously sortable"));
            }
            Ok(cel::Value::List(Arc::new(sorted)))
        },
    );

    context.add_function(
        "reversed",
        |list: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            let items = expect_list("reversed", &list)?;
            let mut reversed: Vec<cel::Value> = items.as_ref().clone();
            reversed.reverse();
            Ok(cel::Value::List(Arc::new(reversed)))
        },
    );

    context.add_function(
        "enumerate",
        |list: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            let items = expect_list("enumerate", &list)?;
            let pairs = items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    cel::Value::List(Arc::new(vec![cel::Value::Int(i as i64), v.clone()]))
                })
                .collect();
            Ok(cel::Value::List(Arc::new(pairs)))
        },
    );

    context.add_function(
        "zip",
        |a: cel::Value, b: cel::Value| -> std::result::Result<cel::Value, cel::ExecutionError> {
            let left = expect_list("zip", &a)?;
            let right = expect_list("zip", &b)?;
            let pairs = left
                .iter()
                .zip(right.iter())
                .map(|(x, y)| cel::Value::List(Arc::new(vec![x.clone(), y.clone()])))
                .collect();
            Ok(cel::Value::List(Arc::new(pairs)))
        },
    );

    context.add_function(
        "any",
        |list: cel::Value| -> std::result::Result<bool, cel::ExecutionError> {
            Ok(expect_list("any", &list)?.iter().any(cel_is_truthy))
        },
    );
    context.add_function(
        "all",
        |list: cel::Value| -> std::result::Result<bool, cel::ExecutionError> {
            Ok(expect_list("all", &list)?.iter().all(cel_is_truthy))
        },
    );

    // urlencode(str)
    context.add_function("urlencode", |s: Arc<String>| -> Arc<String> {
        Arc::new(
            url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>(),
        )
    });
}

fn pick_extreme(
    name: &'static str,
    list: &cel::Value,
    better: fn(f64, f64) -> bool,
) -> std::result::Result<cel::Value, cel::ExecutionError> {
    let items = expect_list(name, list)?;
    let mut best: Option<(f64, cel::Value)> = None;
    for item in items.iter() {
        let n = as_number(item)
            .ok_or_else(|| function_error(name, "non-numeric element"))?;
        match &best {
            Some((current, _)) if !better(n, *current) => {}
            _ => best = Some((n, item.clone())),
        }
    }
    best.map(|(_, v)| v)
        .ok_or_else(|| function_error(name, "empty list"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(pairs: &[(&str, Value)]) -> LayeredContext {
        let mut ctx = LayeredContext::new();
        ctx.push_frozen(
            "test",
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        ctx
    }

    fn engine() -> TemplateEngine {
        TemplateEngine::new(50_000)
    }

    #[test]
    fn complete_template_preserves_type() {
        let ctx = LayeredContext::new();
        assert_eq!(engine().render_str("{{ 42 }}", &ctx).unwrap(), json!(42));
        assert_eq!(
            engine().render_str("{{ [1, 2, 3] }}", &ctx).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            engine().render_str("{{ {'a': 1} }}", &ctx).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn inline_template_yields_string() {
        let ctx = LayeredContext::new();
        assert_eq!(
            engine().render_str("n={{ 42 }}", &ctx).unwrap(),
            json!("n=42")
        );
        assert_eq!(
            engine().render_str("{{ 1 }}-{{ 2 }}", &ctx).unwrap(),
            json!("1-2")
        );
    }

    #[test]
    fn two_tokens_are_not_a_complete_template() {
        let ctx = ctx_with(&[("a", json!(1)), ("b", json!(2))]);
        assert_eq!(
            engine().render_str("{{ a }} {{ b }}", &ctx).unwrap(),
            json!("1 2")
        );
    }

    #[test]
    fn plain_string_passes_through() {
        let ctx = LayeredContext::new();
        assert_eq!(
            engine().render_str("no tokens here", &ctx).unwrap(),
            json!("no tokens here")
        );
    }

    #[test]
    fn context_names_resolve_by_layer_priority() {
        let mut ctx = LayeredContext::new();
        ctx.push_frozen("low", [("who".to_string(), json!("scenario"))].into());
        ctx.push_frozen("high", [("who".to_string(), json!("iteration"))].into());
        assert_eq!(
            engine().render_str("{{ who }}", &ctx).unwrap(),
            json!("iteration")
        );
    }

    #[test]
    fn lowercase_literals_work() {
        let ctx = LayeredContext::new();
        assert_eq!(engine().evaluate("true", &ctx).unwrap(), json!(true));
        assert_eq!(engine().evaluate("null", &ctx).unwrap(), json!(null));
        assert_eq!(
            engine().evaluate("false ? 1 : 2", &ctx).unwrap(),
            json!(2)
        );
    }

    #[test]
    fn arithmetic_and_comparison() {
        let ctx = ctx_with(&[("x", json!(10))]);
        assert_eq!(engine().evaluate("x * 2 + 1", &ctx).unwrap(), json!(21));
        assert!(engine().evaluate_truthy("x > 5 && x < 20", &ctx).unwrap());
        assert!(!engine().evaluate_truthy("x == 11", &ctx).unwrap());
    }

    #[test]
    fn len_alias_is_rewritten() {
        let ctx = ctx_with(&[("items", json!([1, 2, 3]))]);
        assert_eq!(engine().evaluate("len(items)", &ctx).unwrap(), json!(3));
    }

    #[test]
    fn conversion_aliases_are_rewritten() {
        let ctx = ctx_with(&[("n", json!(7))]);
        assert_eq!(engine().evaluate("str(n)", &ctx).unwrap(), json!("7"));
        assert_eq!(engine().evaluate("int('5')", &ctx).unwrap(), json!(5));
        assert_eq!(engine().evaluate("float(n)", &ctx).unwrap(), json!(7.0));
    }

    #[test]
    fn comprehension_over_range() {
        let ctx = LayeredContext::new();
        assert_eq!(
            engine()
                .evaluate("range(4).map(i, i * i)", &ctx)
                .unwrap(),
            json!([0, 1, 4, 9])
        );
        assert_eq!(
            engine()
                .evaluate("range(6).filter(i, i % 2 == 0)", &ctx)
                .unwrap(),
            json!([0, 2, 4])
        );
    }

    #[test]
    fn comprehension_limit_boundary() {
        let small = TemplateEngine::new(5);
        let ctx = LayeredContext::new();
        assert_eq!(
            small.evaluate("size(range(5))", &ctx).unwrap(),
            json!(5)
        );
        let err = small.evaluate("size(range(6))", &ctx).unwrap_err();
        assert!(matches!(err, Error::ComprehensionLimit { limit: 5, .. }));
    }

    #[test]
    fn helper_get_and_exists() {
        let ctx = ctx_with(&[("token", json!("T"))]);
        assert_eq!(
            engine().evaluate("get('token', 'fallback')", &ctx).unwrap(),
            json!("T")
        );
        assert_eq!(
            engine().evaluate("get('missing', 'fallback')", &ctx).unwrap(),
            json!("fallback")
        );
        assert!(engine().evaluate_truthy("exists('token')", &ctx).unwrap());
        assert!(!engine().evaluate_truthy("exists('missing')", &ctx).unwrap());
    }

    #[test]
    fn helper_env_with_default() {
        let ctx = LayeredContext::new();
        assert_eq!(
            engine()
                .evaluate("env('STAGEHAND_SURELY_UNSET', 'dflt')", &ctx)
                .unwrap(),
            json!("dflt")
        );
    }

    #[test]
    fn helper_uuid4_shape() {
        let ctx = LayeredContext::new();
        let value = engine().evaluate("uuid4()", &ctx).unwrap();
        let s = value.as_str().unwrap();
        assert_eq!(s.len(), 36);
        assert_eq!(s.matches('-').count(), 4);
    }

    #[test]
    fn numeric_helpers() {
        let ctx = ctx_with(&[("xs", json!([3, 1, 2]))]);
        assert_eq!(engine().evaluate("min(xs)", &ctx).unwrap(), json!(1));
        assert_eq!(engine().evaluate("max(xs)", &ctx).unwrap(), json!(3));
        assert_eq!(engine().evaluate("sum(xs)", &ctx).unwrap(), json!(6));
        assert_eq!(engine().evaluate("abs(-4)", &ctx).unwrap(), json!(4));
        assert_eq!(engine().evaluate("round(2.6)", &ctx).unwrap(), json!(3));
    }

    #[test]
    fn sequence_helpers() {
        let ctx = ctx_with(&[("xs", json!([3, 1, 2]))]);
        assert_eq!(
            engine().evaluate("sorted(xs)", &ctx).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            engine().evaluate("reversed(xs)", &ctx).unwrap(),
            json!([2, 1, 3])
        );
        assert_eq!(
            engine().evaluate("enumerate(['a', 'b'])", &ctx).unwrap(),
            json!([[0, "a"], [1, "b"]])
        );
        assert_eq!(
            engine().evaluate("zip([1, 2], ['a', 'b'])", &ctx).unwrap(),
            json!([[1, "a"], [2, "b"]])
        );
        assert!(engine().evaluate_truthy("any([false, true])", &ctx).unwrap());
        assert!(!engine().evaluate_truthy("all([true, false])", &ctx).unwrap());
    }

    #[test]
    fn urlencode_helper() {
        let ctx = ctx_with(&[("q", json!("a b&c"))]);
        assert_eq!(
            engine().evaluate("urlencode(q)", &ctx).unwrap(),
            json!("a+b%26c")
        );
    }

    #[test]
    fn undefined_name_is_template_error() {
        let ctx = LayeredContext::new();
        let err = engine().evaluate("nope + 1", &ctx).unwrap_err();
        assert!(matches!(err, Error::Template { .. }));
    }

    #[test]
    fn syntax_error_is_template_error() {
        let ctx = LayeredContext::new();
        let err = engine().evaluate("invalid %%% expr", &ctx).unwrap_err();
        match err {
            Error::Template { expression, .. } => {
                assert_eq!(expression, "invalid %%% expr");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn division_by_zero_is_template_error() {
        let ctx = LayeredContext::new();
        let err = engine().evaluate("1 / 0", &ctx).unwrap_err();
        assert!(matches!(err, Error::Template { .. }));
    }

    #[test]
    fn walk_recurses_and_leaves_keys_alone() {
        let ctx = ctx_with(&[("id", json!(42)), ("name", json!("alice"))]);
        let walked = engine()
            .walk(
                &json!({
                    "{{ name }}": "key untouched",
                    "user": {"id": "{{ id }}", "label": "user-{{ id }}"},
                    "tags": ["{{ name }}", "fixed"]
                }),
                &ctx,
            )
            .unwrap();
        assert_eq!(
            walked,
            json!({
                "{{ name }}": "key untouched",
                "user": {"id": 42, "label": "user-42"},
                "tags": ["alice", "fixed"]
            })
        );
    }

    #[test]
    fn walk_is_idempotent_without_templates() {
        let ctx = LayeredContext::new();
        let value = json!({"a": [1, "two", {"b": null}]});
        let once = engine().walk(&value, &ctx).unwrap();
        let twice = engine().walk(&once, &ctx).unwrap();
        assert_eq!(once, value);
        assert_eq!(twice, once);
    }

    #[test]
    fn walk_record_preserves_variants() {
        use crate::model::Body;
        let ctx = ctx_with(&[("n", json!(7))]);
        let body = Body::Json(json!({"count": "{{ n }}"}));
        let walked = engine().walk_record(&body, &ctx).unwrap();
        match walked {
            Body::Json(value) => assert_eq!(value, json!({"count": 7})),
            other => panic!("variant changed: {other:?}"),
        }
    }
}
