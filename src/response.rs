//! Response capture and ordered verify/save processing.
//!
//! A stage's `response` list runs in author order. Verify steps fail on
//! the first check that does not hold; save steps merge their outputs
//! (later entries overwrite earlier) into a map that is promoted to the
//! global context when the stage completes. Saves made by one step are
//! visible to the expressions of later steps in the same stage.

use crate::context::LayeredContext;
use crate::error::{Error, Result};
use crate::functions::{FunctionRegistry, Kwargs};
use crate::model::{
    ResponseStep, Save, SchemaSource, StatusExpectation, Substitution, UserFunctionRef, Verify,
};
use crate::template::TemplateEngine;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Captured response: status, lowercased headers, decoded body.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ResponseData {
    /// Drain a transport response into an owned capture.
    pub async fn capture(response: reqwest::Response) -> Result<Self> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transport(format!("failed to read response body: {e}")))?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Parse the body as JSON, on demand.
    pub fn json(&self) -> std::result::Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// The `response` binding visible to verify expressions:
    /// `{status, headers, json, text}`.
    pub fn to_context_value(&self) -> Value {
        json!({
            "status": self.status,
            "headers": self.headers,
            "json": self.json().ok(),
            "text": self.body,
        })
    }
}

/// Filesystem surroundings for schema-by-path lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv<'a> {
    pub scenario_dir: Option<&'a Path>,
    pub root: Option<&'a Path>,
}

/// Run the ordered steps, returning the merged save map.
pub fn process_steps(
    engine: &TemplateEngine,
    registry: &FunctionRegistry,
    steps: &[ResponseStep],
    response: &ResponseData,
    ctx: &LayeredContext,
    env: &ProcessEnv<'_>,
) -> Result<IndexMap<String, Value>> {
    let mut view = ctx.snapshot();
    view.push_frozen(
        "response",
        [("response".to_string(), response.to_context_value())].into(),
    );

    let mut merged: IndexMap<String, Value> = IndexMap::new();
    for (index, step) in steps.iter().enumerate() {
        match step {
            ResponseStep::Verify(verify) => {
                run_verify(engine, registry, verify, response, &view, env)?;
                debug!("verify step {index} held");
            }
            ResponseStep::Save(save) => {
                let saved = run_save(engine, registry, save, response, &view)?;
                for (name, value) in saved {
                    view.set(name.clone(), value.clone())?;
                    merged.insert(name, value);
                }
                debug!("save step {index} produced {} values", merged.len());
            }
        }
    }
    Ok(merged)
}

fn run_verify(
    engine: &TemplateEngine,
    registry: &FunctionRegistry,
    verify: &Verify,
    response: &ResponseData,
    ctx: &LayeredContext,
    env: &ProcessEnv<'_>,
) -> Result<()> {
    match &verify.status {
        Some(StatusExpectation::Exact(expected)) => {
            if response.status != *expected {
                return Err(Error::verify(format!(
                    "status: expected {expected}, got {}",
                    response.status
                )));
            }
        }
        Some(StatusExpectation::AnyOf(allowed)) => {
            if !allowed.contains(&response.status) {
                return Err(Error::verify(format!(
                    "status: {} not in {allowed:?}",
                    response.status
                )));
            }
        }
        None => {}
    }

    for (name, expected) in &verify.headers {
        let expected = render_to_string(engine, expected, ctx)?;
        match response.header(name) {
            // Name matching is case-insensitive; value comparison is
            // exact and case-sensitive.
            Some(actual) if actual == expected => {}
            Some(actual) => {
                return Err(Error::verify(format!(
                    "header '{name}': expected '{expected}', got '{actual}'"
                )));
            }
            None => {
                return Err(Error::verify(format!("header '{name}' missing")));
            }
        }
    }

    for expression in &verify.expressions {
        if !engine.evaluate_truthy(expression, ctx)? {
            return Err(Error::verify(format!("expression '{expression}' was falsy")));
        }
    }

    if let Some(body) = &verify.body {
        run_body_checks(engine, body, response, ctx, env)?;
    }

    for reference in &verify.user_functions {
        let function = registry.resolve_verify(reference)?;
        let kwargs = walked_kwargs(engine, reference, ctx)?;
        let held = function(response, &kwargs).map_err(|e| {
            Error::verify(format!("user function '{}': {e}", reference.function()))
        })?;
        if !held {
            return Err(Error::verify(format!(
                "user function '{}' returned falsy",
                reference.function()
            )));
        }
    }

    Ok(())
}

fn run_body_checks(
    engine: &TemplateEngine,
    body: &crate::model::VerifyBody,
    response: &ResponseData,
    ctx: &LayeredContext,
    env: &ProcessEnv<'_>,
) -> Result<()> {
    if let Some(source) = &body.schema {
        let schema = load_schema(source, env)?;
        let instance = response.json().map_err(|e| {
            Error::verify(format!("schema check: response is not valid JSON: {e}"))
        })?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| Error::validation(format!("invalid JSON Schema: {e}")))?;
        validator
            .validate(&instance)
            .map_err(|e| Error::verify(format!("schema check: {e}")))?;
    }

    for needle in &body.contains {
        let needle = render_to_string(engine, needle, ctx)?;
        if !response.body.contains(&needle) {
            return Err(Error::verify(format!("body does not contain '{needle}'")));
        }
    }
    for needle in &body.not_contains {
        let needle = render_to_string(engine, needle, ctx)?;
        if response.body.contains(&needle) {
            return Err(Error::verify(format!("body contains forbidden '{needle}'")));
        }
    }

    for pattern in &body.matches {
        if !whole_body_match(pattern, &response.body)? {
            return Err(Error::verify(format!("body does not match /{pattern}/")));
        }
    }
    for pattern in &body.not_matches {
        if whole_body_match(pattern, &response.body)? {
            return Err(Error::verify(format!("body matches forbidden /{pattern}/")));
        }
    }

    Ok(())
}

/// The pattern must cover the entire decoded body.
fn whole_body_match(pattern: &str, body: &str) -> Result<bool> {
    let anchored = format!("^(?s:{pattern})$");
    let regex = Regex::new(&anchored)
        .map_err(|e| Error::validation(format!("invalid pattern /{pattern}/: {e}")))?;
    Ok(regex.is_match(body))
}

fn load_schema(source: &SchemaSource, env: &ProcessEnv<'_>) -> Result<Value> {
    match source {
        SchemaSource::Inline(schema) => Ok(schema.clone()),
        SchemaSource::Path(path) => {
            let raw = Path::new(path);
            let joined = match env.scenario_dir {
                Some(dir) if raw.is_relative() => dir.join(raw),
                _ => raw.to_path_buf(),
            };
            let canonical = joined.canonicalize().map_err(|e| {
                Error::path(format!("cannot resolve schema '{}': {e}", joined.display()))
            })?;
            if let Some(root) = env.root {
                let root = root.canonicalize().map_err(|e| {
                    Error::path(format!("bad root '{}': {e}", root.display()))
                })?;
                if !canonical.starts_with(&root) {
                    return Err(Error::path(format!(
                        "schema '{}' escapes the scenario root",
                        canonical.display()
                    )));
                }
            }
            let text = std::fs::read_to_string(&canonical).map_err(|e| {
                Error::path(format!("cannot read schema '{}': {e}", canonical.display()))
            })?;
            serde_json::from_str(&text)
                .map_err(|e| Error::validation(format!("schema is not valid JSON: {e}")))
        }
    }
}

fn run_save(
    engine: &TemplateEngine,
    registry: &FunctionRegistry,
    save: &Save,
    response: &ResponseData,
    ctx: &LayeredContext,
) -> Result<IndexMap<String, Value>> {
    let mut out: IndexMap<String, Value> = IndexMap::new();

    for (name, expression) in &save.jmespath {
        let document = jmespath_document(expression, response)?;
        let compiled = jmespath::compile(expression).map_err(|e| {
            Error::save(format!("invalid JMESPath '{expression}': {e}"))
        })?;
        let found = compiled.search(document).map_err(|e| {
            Error::save(format!("JMESPath '{expression}' failed: {e}"))
        })?;
        let value = serde_json::to_value(found.as_ref()).map_err(|e| {
            Error::save(format!("JMESPath '{expression}' result: {e}"))
        })?;
        out.insert(name.clone(), value);
    }

    for substitution in &save.substitutions {
        match substitution {
            Substitution::Vars(vars) => {
                for (name, literal) in vars {
                    out.insert(name.clone(), engine.walk(literal, ctx)?);
                }
            }
            Substitution::Functions(functions) => {
                for (name, reference) in functions {
                    let function = registry.resolve_substitution(reference)?;
                    let kwargs = walked_kwargs(engine, reference, ctx)?;
                    let value = function(&kwargs).map_err(|e| {
                        Error::save(format!("substitution '{name}': {e}"))
                    })?;
                    out.insert(name.clone(), value);
                }
            }
        }
    }

    for reference in &save.user_functions {
        let function = registry.resolve_save(reference)?;
        let kwargs = walked_kwargs(engine, reference, ctx)?;
        let produced = function(response, &kwargs).map_err(|e| {
            Error::save(format!("user function '{}': {e}", reference.function()))
        })?;
        for (name, value) in produced {
            out.insert(name, value);
        }
    }

    Ok(out)
}

/// Expressions rooted at `status` or `headers` run against a small
/// projection; everything else runs over the parsed JSON body.
fn jmespath_document(expression: &str, response: &ResponseData) -> Result<Value> {
    let root = expression
        .split(|c: char| c == '.' || c == '[')
        .next()
        .unwrap_or("");
    if root == "status" || root == "headers" {
        Ok(json!({
            "status": response.status,
            "headers": response.headers,
        }))
    } else {
        response
            .json()
            .map_err(|e| Error::save(format!("response is not valid JSON: {e}")))
    }
}

fn render_to_string(
    engine: &TemplateEngine,
    text: &str,
    ctx: &LayeredContext,
) -> Result<String> {
    Ok(match engine.render_str(text, ctx)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn walked_kwargs(
    engine: &TemplateEngine,
    reference: &UserFunctionRef,
    ctx: &LayeredContext,
) -> Result<Kwargs> {
    let mut out = Kwargs::new();
    if let Some(kwargs) = reference.kwargs() {
        for (key, value) in kwargs {
            out.insert(key.clone(), engine.walk(value, ctx)?);
        }
    }
    Ok(out)
}
