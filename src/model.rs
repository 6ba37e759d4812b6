//! Typed scenario model.
//!
//! A scenario document (after reference resolution) deserializes into
//! these types. Discriminated unions (bodies, substitutions, response
//! steps, parallel modes, parameter blocks) are externally tagged serde
//! enums, so "exactly one variant" is enforced by the deserializer.
//! [`Scenario::validate`] covers the cross-field rules serde cannot.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// A single test document: an ordered chain of HTTP stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Name derived from the file (`test_<name>.<suffix>.json`).
    #[serde(skip)]
    pub name: String,
    /// Directory of the source file; relative paths in bodies and
    /// schemas resolve against it.
    #[serde(skip)]
    pub source_dir: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
    /// Host-framework marker strings applied at scenario scope.
    #[serde(default)]
    pub marks: Vec<String>,
    /// Host-provided values injected into every stage context.
    #[serde(default)]
    pub fixtures: Vec<String>,
    /// Factory producing the default per-request authenticator.
    #[serde(default)]
    pub auth: Option<UserFunctionRef>,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    #[serde(deserialize_with = "de_stages")]
    pub stages: Vec<Stage>,
}

/// One HTTP request plus its response processing, executed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub marks: Vec<String>,
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    /// Execute even if a prior stage failed.
    #[serde(default)]
    pub always_run: bool,
    /// Parameter blocks composed by Cartesian product.
    #[serde(default)]
    pub parametrize: Vec<Parameter>,
    #[serde(default)]
    pub parallel: Option<ParallelConfig>,
    pub request: Request,
    #[serde(default, deserialize_with = "de_response_steps")]
    pub response: Vec<ResponseStep>,
}

/// Declarative HTTP request. String fields are templated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Query parameters; values may be scalars or lists.
    #[serde(default)]
    pub params: IndexMap<String, ParamValue>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub body: Option<Body>,
    /// Overrides the scenario-level auth factory.
    #[serde(default)]
    pub auth: Option<UserFunctionRef>,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_true")]
    pub allow_redirects: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

/// A query parameter value: one scalar or a list of scalars.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Many(Vec<Value>),
    One(Value),
}

/// Request body; the variant decides wire encoding and the default
/// `Content-Type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    /// JSON-encoded payload.
    Json(Value),
    /// `application/x-www-form-urlencoded` pairs.
    Form(IndexMap<String, String>),
    /// Raw XML text.
    Xml(String),
    /// Plain text.
    Text(String),
    /// Base64-encoded bytes, decoded before sending.
    Base64(String),
    /// File contents, path relative to the scenario file.
    Binary(String),
    /// Multipart upload: field name → file path.
    Files(IndexMap<String, String>),
    /// GraphQL request envelope.
    Graphql {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<Value>,
    },
}

/// TLS policy for a scenario.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// `true`/`false`, or a path to a CA bundle.
    #[serde(default)]
    pub verify: SslVerify,
    /// Client certificate: combined PEM path or `[cert, key]` pair.
    #[serde(default)]
    pub cert: Option<ClientCert>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SslVerify {
    Flag(bool),
    CaBundle(PathBuf),
}

impl Default for SslVerify {
    fn default() -> Self {
        Self::Flag(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientCert {
    Combined(PathBuf),
    Pair(PathBuf, PathBuf),
}

/// A named binding added to a context layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substitution {
    /// Literal values.
    Vars(IndexMap<String, Value>),
    /// Each function is invoked (kwargs only) and its return value
    /// bound; entries evaluate in authoring order, so later ones may
    /// reference earlier.
    Functions(IndexMap<String, UserFunctionRef>),
}

/// A response-processing step: assert or extract, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStep {
    Verify(Verify),
    Save(Save),
}

/// Assertions over the response, evaluated in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Verify {
    /// Expected status: a scalar or an allow-list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusExpectation>,
    /// Header name (case-insensitive) → exact expected value.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Template expressions, each of which must evaluate truthy.
    #[serde(default)]
    pub expressions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<VerifyBody>,
    /// Each is called with the response and must return truthy.
    #[serde(default)]
    pub user_functions: Vec<UserFunctionRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusExpectation {
    AnyOf(Vec<u16>),
    Exact(u16),
}

/// Body-level checks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerifyBody {
    /// Inline JSON Schema document, or a path to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaSource>,
    #[serde(default)]
    pub contains: Vec<String>,
    #[serde(default)]
    pub not_contains: Vec<String>,
    /// Regex patterns the whole decoded body must match.
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub not_matches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaSource {
    Path(String),
    Inline(Value),
}

/// Extractions promoted into the scenario context when the stage ends.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Save {
    /// Variable name → JMESPath expression over the response JSON
    /// (or the status/headers projection).
    #[serde(default)]
    pub jmespath: IndexMap<String, String>,
    /// Substitutions evaluated now, in the stage context.
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    /// Each returns a map of names to values, merged in order.
    #[serde(default)]
    pub user_functions: Vec<UserFunctionRef>,
}

/// Reference to a host-registered callable.
///
/// Authored either as a bare string (`"module.path:symbol"` or
/// `"symbol"`) or as `{function, kwargs}`. Kwargs are template-walked
/// before invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserFunctionRef {
    Name(String),
    Detailed {
        function: String,
        #[serde(default)]
        kwargs: IndexMap<String, Value>,
    },
}

impl UserFunctionRef {
    pub fn function(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { function, .. } => function,
        }
    }

    pub fn kwargs(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Name(_) => None,
            Self::Detailed { kwargs, .. } => Some(kwargs),
        }
    }
}

/// Intra-stage concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelConfig {
    /// `n` independent invocations of the stage.
    Repeat {
        n: usize,
        max_concurrency: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        calls_per_sec: Option<f64>,
    },
    /// One invocation per expanded parameter row.
    Foreach {
        parameters: Vec<Parameter>,
        max_concurrency: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        calls_per_sec: Option<f64>,
    },
}

impl ParallelConfig {
    pub fn max_concurrency(&self) -> usize {
        match self {
            Self::Repeat {
                max_concurrency, ..
            }
            | Self::Foreach {
                max_concurrency, ..
            } => *max_concurrency,
        }
    }

    pub fn calls_per_sec(&self) -> Option<f64> {
        match self {
            Self::Repeat { calls_per_sec, .. } | Self::Foreach { calls_per_sec, .. } => {
                *calls_per_sec
            }
        }
    }
}

/// One block of a `parametrize` cross-product.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// One key with a list of values: one row per value.
    Individual(IndividualParams),
    /// Explicit rows, each a full mapping.
    Combinations(CombinationParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndividualParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// Exactly one key is allowed here; validation enforces it.
    #[serde(flatten)]
    pub values: IndexMap<String, Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinationParams {
    pub rows: Vec<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
}

fn default_timeout() -> f64 {
    30.0
}

fn default_true() -> bool {
    true
}

/// Stages may be authored as a sequence of stage objects or as a keyed
/// mapping whose keys name the stages; mapping order is preserved.
fn de_stages<'de, D>(deserializer: D) -> std::result::Result<Vec<Stage>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as DeError;

    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(DeError::custom))
            .collect(),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, mut body)| {
                if let Value::Object(fields) = &mut body {
                    fields
                        .entry("name".to_string())
                        .or_insert_with(|| Value::String(key));
                }
                serde_json::from_value(body).map_err(DeError::custom)
            })
            .collect(),
        other => Err(DeError::custom(format!(
            "stages must be a sequence or a mapping, got {}",
            json_kind(&other)
        ))),
    }
}

/// Response steps may be a sequence or a keyed mapping; mapping keys
/// are documentary only.
fn de_response_steps<'de, D>(deserializer: D) -> std::result::Result<Vec<ResponseStep>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as DeError;

    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(DeError::custom))
            .collect(),
        Value::Object(map) => map
            .into_values()
            .map(|item| serde_json::from_value(item).map_err(DeError::custom))
            .collect(),
        other => Err(DeError::custom(format!(
            "response must be a sequence or a mapping, got {}",
            json_kind(&other)
        ))),
    }
}

/// Human name of a JSON value's kind, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Scenario {
    /// Deserialize a resolved document and run the cross-field checks.
    pub fn from_value(value: Value) -> Result<Self> {
        let scenario: Scenario =
            serde_json::from_value(value).map_err(|e| Error::validation(e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse a scenario from a JSON string (resolution already done).
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| Error::validation(e.to_string()))?;
        Self::from_value(value)
    }

    /// Cross-field validation the deserializer cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut stage_names: Vec<&str> = Vec::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(Error::validation("stage name must be non-empty"));
            }
            if stage_names.contains(&stage.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            stage_names.push(&stage.name);
            stage.validate()?;
        }

        check_unique(&self.fixtures, "scenario fixture")?;

        // Fixture names are immutable: scenario-level vars must not
        // redefine them.
        for sub in &self.substitutions {
            if let Substitution::Vars(vars) = sub {
                for name in vars.keys() {
                    if self.fixtures.contains(name) {
                        return Err(Error::validation(format!(
                            "substitution '{name}' collides with a fixture of the same name"
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

impl Stage {
    fn validate(&self) -> Result<()> {
        check_unique(&self.fixtures, "stage fixture")?;

        if self.request.timeout <= 0.0 {
            return Err(Error::validation(format!(
                "stage '{}': timeout must be positive",
                self.name
            )));
        }

        for block in &self.parametrize {
            block.validate(&self.name)?;
        }

        if self.parallel.is_some() && !self.parametrize.is_empty() {
            return Err(Error::validation(format!(
                "stage '{}': parametrize and parallel cannot be combined; \
                 use parallel.foreach for parameterized parallel runs",
                self.name
            )));
        }

        if let Some(parallel) = &self.parallel {
            if parallel.max_concurrency() < 1 {
                return Err(Error::validation(format!(
                    "stage '{}': max_concurrency must be at least 1",
                    self.name
                )));
            }
            if let Some(rate) = parallel.calls_per_sec() {
                if rate <= 0.0 {
                    return Err(Error::validation(format!(
                        "stage '{}': calls_per_sec must be positive",
                        self.name
                    )));
                }
            }
            if let ParallelConfig::Foreach { parameters, .. } = parallel {
                for block in parameters {
                    block.validate(&self.name)?;
                }
            }
        }

        for step in &self.response {
            if let ResponseStep::Verify(verify) = step {
                match &verify.status {
                    Some(StatusExpectation::Exact(code)) => check_status(*code, &self.name)?,
                    Some(StatusExpectation::AnyOf(codes)) => {
                        for code in codes {
                            check_status(*code, &self.name)?;
                        }
                    }
                    None => {}
                }
            }
        }

        Ok(())
    }
}

impl Parameter {
    fn validate(&self, stage: &str) -> Result<()> {
        match self {
            Self::Individual(block) => {
                if block.values.len() != 1 {
                    return Err(Error::validation(format!(
                        "stage '{stage}': an individual block takes exactly one parameter key, got {}",
                        block.values.len()
                    )));
                }
                if let Some(ids) = &block.ids {
                    let rows = block.values.values().next().map_or(0, Vec::len);
                    if ids.len() != rows {
                        return Err(Error::validation(format!(
                            "stage '{stage}': ids length {} does not match {} values",
                            ids.len(),
                            rows
                        )));
                    }
                }
            }
            Self::Combinations(block) => {
                if let Some(ids) = &block.ids {
                    if ids.len() != block.rows.len() {
                        return Err(Error::validation(format!(
                            "stage '{stage}': ids length {} does not match {} rows",
                            ids.len(),
                            block.rows.len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_unique(names: &[String], what: &str) -> Result<()> {
    for (i, name) in names.iter().enumerate() {
        if names[..i].contains(name) {
            return Err(Error::validation(format!("duplicate {what} '{name}'")));
        }
    }
    Ok(())
}

fn check_status(code: u16, stage: &str) -> Result<()> {
    if !(100..=599).contains(&code) {
        return Err(Error::validation(format!(
            "stage '{stage}': {code} is not a valid HTTP status code"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_stage(name: &str) -> Value {
        json!({
            "name": name,
            "request": {"url": "http://example.com/ping"},
            "response": [{"verify": {"status": 200}}]
        })
    }

    #[test]
    fn stages_accept_sequence_form() {
        let scenario = Scenario::from_value(json!({
            "stages": [minimal_stage("a"), minimal_stage("b")]
        }))
        .unwrap();
        assert_eq!(scenario.stages.len(), 2);
        assert_eq!(scenario.stages[0].name, "a");
        assert_eq!(scenario.stages[0].request.method, HttpMethod::Get);
        assert!((scenario.stages[0].request.timeout - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stages_accept_keyed_mapping_in_order() {
        let scenario = Scenario::from_value(json!({
            "stages": {
                "login": {"request": {"url": "/login", "method": "POST"}},
                "fetch": {"request": {"url": "/me"}}
            }
        }))
        .unwrap();
        let names: Vec<&str> = scenario.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["login", "fetch"]);
        assert_eq!(scenario.stages[0].request.method, HttpMethod::Post);
    }

    #[test]
    fn duplicate_stage_names_rejected() {
        let err = Scenario::from_value(json!({
            "stages": [minimal_stage("a"), minimal_stage("a")]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn body_variants_are_exclusive() {
        let ok: Body = serde_json::from_value(json!({"json": {"a": 1}})).unwrap();
        assert!(matches!(ok, Body::Json(_)));

        let err = serde_json::from_value::<Body>(json!({
            "json": {"a": 1},
            "text": "nope"
        }));
        assert!(err.is_err());
    }

    #[test]
    fn response_step_requires_exactly_one_kind() {
        let err = serde_json::from_value::<ResponseStep>(json!({
            "verify": {"status": 200},
            "save": {"jmespath": {"x": "x"}}
        }));
        assert!(err.is_err());

        let ok: ResponseStep = serde_json::from_value(json!({
            "save": {"jmespath": {"token": "token"}}
        }))
        .unwrap();
        assert!(matches!(ok, ResponseStep::Save(_)));
    }

    #[test]
    fn response_steps_accept_keyed_mapping() {
        let scenario = Scenario::from_value(json!({
            "stages": [{
                "name": "s",
                "request": {"url": "/x"},
                "response": {
                    "check status": {"verify": {"status": 200}},
                    "grab token": {"save": {"jmespath": {"token": "token"}}}
                }
            }]
        }))
        .unwrap();
        assert_eq!(scenario.stages[0].response.len(), 2);
        assert!(matches!(
            scenario.stages[0].response[0],
            ResponseStep::Verify(_)
        ));
    }

    #[test]
    fn status_list_deserializes() {
        let verify: Verify =
            serde_json::from_value(json!({"status": [200, 201, 204]})).unwrap();
        assert!(matches!(
            verify.status,
            Some(StatusExpectation::AnyOf(ref codes)) if codes.len() == 3
        ));
    }

    #[test]
    fn invalid_status_code_rejected() {
        let err = Scenario::from_value(json!({
            "stages": [{
                "name": "s",
                "request": {"url": "/x"},
                "response": [{"verify": {"status": 9000}}]
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("not a valid HTTP status"));
    }

    #[test]
    fn fixture_var_collision_rejected() {
        let err = Scenario::from_value(json!({
            "fixtures": ["token"],
            "substitutions": [{"vars": {"token": "x"}}],
            "stages": [minimal_stage("a")]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("collides with a fixture"));
    }

    #[test]
    fn user_function_ref_forms() {
        let bare: UserFunctionRef = serde_json::from_value(json!("helpers:make_auth")).unwrap();
        assert_eq!(bare.function(), "helpers:make_auth");
        assert!(bare.kwargs().is_none());

        let detailed: UserFunctionRef = serde_json::from_value(json!({
            "function": "bearer",
            "kwargs": {"token": "{{ token }}"}
        }))
        .unwrap();
        assert_eq!(detailed.function(), "bearer");
        assert_eq!(detailed.kwargs().unwrap().len(), 1);
    }

    #[test]
    fn individual_block_requires_single_key() {
        let err = Scenario::from_value(json!({
            "stages": [{
                "name": "s",
                "request": {"url": "/x"},
                "parametrize": [{"individual": {"a": [1], "b": [2]}}]
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("exactly one parameter key"));
    }

    #[test]
    fn ids_length_mismatch_rejected() {
        let err = Scenario::from_value(json!({
            "stages": [{
                "name": "s",
                "request": {"url": "/x"},
                "parametrize": [{"individual": {"env": ["dev", "prod"], "ids": ["only-one"]}}]
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("ids length"));
    }

    #[test]
    fn parametrize_with_parallel_rejected() {
        let err = Scenario::from_value(json!({
            "stages": [{
                "name": "s",
                "request": {"url": "/x"},
                "parametrize": [{"individual": {"env": ["dev"]}}],
                "parallel": {"repeat": {"n": 2, "max_concurrency": 2}}
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("cannot be combined"));
    }

    #[test]
    fn parallel_ranges_enforced() {
        let err = Scenario::from_value(json!({
            "stages": [{
                "name": "s",
                "request": {"url": "/x"},
                "parallel": {"repeat": {"n": 3, "max_concurrency": 0}}
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));

        let err = Scenario::from_value(json!({
            "stages": [{
                "name": "s",
                "request": {"url": "/x"},
                "parallel": {"repeat": {"n": 3, "max_concurrency": 2, "calls_per_sec": 0.0}}
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("calls_per_sec"));
    }

    #[test]
    fn ssl_verify_forms() {
        let flag: SslConfig = serde_json::from_value(json!({"verify": false})).unwrap();
        assert!(matches!(flag.verify, SslVerify::Flag(false)));

        let bundle: SslConfig =
            serde_json::from_value(json!({"verify": "certs/ca.pem"})).unwrap();
        assert!(matches!(bundle.verify, SslVerify::CaBundle(_)));

        let pair: SslConfig =
            serde_json::from_value(json!({"cert": ["client.pem", "client.key"]})).unwrap();
        assert!(matches!(pair.cert, Some(ClientCert::Pair(_, _))));
    }
}
