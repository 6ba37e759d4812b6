//! User function registry and binder.
//!
//! Scenarios reference host callables as `"module.path:symbol"` or as a
//! bare `"symbol"` resolved through a search order of registered module
//! prefixes. Four arities exist, one per use site: save, verify, auth
//! factory, substitution. References are resolved once at scenario load
//! so a typo fails before any request is sent.

use crate::error::{Error, Result};
use crate::model::{Scenario, Stage, Substitution, UserFunctionRef};
use crate::request::Authenticator;
use crate::response::ResponseData;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Keyword arguments passed to a user function, template-walked by the
/// caller before invocation.
pub type Kwargs = IndexMap<String, Value>;

pub type SaveFn =
    Arc<dyn Fn(&ResponseData, &Kwargs) -> anyhow::Result<IndexMap<String, Value>> + Send + Sync>;
pub type VerifyFn = Arc<dyn Fn(&ResponseData, &Kwargs) -> anyhow::Result<bool> + Send + Sync>;
pub type AuthFn = Arc<dyn Fn(&Kwargs) -> anyhow::Result<Authenticator> + Send + Sync>;
pub type SubstitutionFn = Arc<dyn Fn(&Kwargs) -> anyhow::Result<Value> + Send + Sync>;

/// A registered callable, tagged by the arity it supports.
#[derive(Clone)]
pub enum UserFunction {
    Save(SaveFn),
    Verify(VerifyFn),
    Auth(AuthFn),
    Substitution(SubstitutionFn),
}

impl std::fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UserFunction").field(&self.kind()).finish()
    }
}

impl UserFunction {
    fn kind(&self) -> &'static str {
        match self {
            Self::Save(_) => "save",
            Self::Verify(_) => "verify",
            Self::Auth(_) => "auth",
            Self::Substitution(_) => "substitution",
        }
    }
}

/// Name → callable table with bare-symbol search order.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    entries: HashMap<String, UserFunction>,
    /// Module prefixes probed, in order, for bare symbols.
    search_order: Vec<String>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-seeded with the builtin auth factories so
    /// scenarios can say `"auth": "bearer"` with no host code.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.add_search_module("stagehand.auth");
        registry.register("stagehand.auth:bearer", UserFunction::Auth(Arc::new(bearer)));
        registry.register("stagehand.auth:basic", UserFunction::Auth(Arc::new(basic)));
        registry.register("stagehand.auth:header", UserFunction::Auth(Arc::new(header)));
        registry
    }

    /// Register a callable under `module:symbol` (or a bare name).
    pub fn register(&mut self, name: impl Into<String>, function: UserFunction) -> &mut Self {
        self.entries.insert(name.into(), function);
        self
    }

    /// Append a module prefix to the bare-symbol search order.
    pub fn add_search_module(&mut self, module: impl Into<String>) -> &mut Self {
        self.search_order.push(module.into());
        self
    }

    /// Resolve a reference: exact `module:symbol` lookup, or the
    /// search order for bare symbols.
    pub fn resolve(&self, reference: &UserFunctionRef) -> Result<&UserFunction> {
        let name = reference.function();
        if name.contains(':') {
            return self
                .entries
                .get(name)
                .ok_or_else(|| Error::bind(name, "not registered"));
        }

        if let Some(found) = self.entries.get(name) {
            return Ok(found);
        }
        for module in &self.search_order {
            if let Some(found) = self.entries.get(&format!("{module}:{name}")) {
                return Ok(found);
            }
        }
        Err(Error::bind(
            name,
            format!(
                "bare symbol not found in search order [{}]",
                self.search_order.join(", ")
            ),
        ))
    }

    pub fn resolve_save(&self, reference: &UserFunctionRef) -> Result<SaveFn> {
        match self.resolve(reference)? {
            UserFunction::Save(f) => Ok(f.clone()),
            other => Err(wrong_kind(reference, "save", other)),
        }
    }

    pub fn resolve_verify(&self, reference: &UserFunctionRef) -> Result<VerifyFn> {
        match self.resolve(reference)? {
            UserFunction::Verify(f) => Ok(f.clone()),
            other => Err(wrong_kind(reference, "verify", other)),
        }
    }

    pub fn resolve_auth(&self, reference: &UserFunctionRef) -> Result<AuthFn> {
        match self.resolve(reference)? {
            UserFunction::Auth(f) => Ok(f.clone()),
            other => Err(wrong_kind(reference, "auth", other)),
        }
    }

    pub fn resolve_substitution(&self, reference: &UserFunctionRef) -> Result<SubstitutionFn> {
        match self.resolve(reference)? {
            UserFunction::Substitution(f) => Ok(f.clone()),
            other => Err(wrong_kind(reference, "substitution", other)),
        }
    }

    /// Pre-resolve every reference a scenario makes, so binding
    /// failures surface at load time rather than mid-run.
    pub fn check_scenario(&self, scenario: &Scenario) -> Result<()> {
        if let Some(auth) = &scenario.auth {
            self.resolve_auth(auth)?;
        }
        self.check_substitutions(&scenario.substitutions)?;
        for stage in &scenario.stages {
            self.check_stage(stage)?;
        }
        Ok(())
    }

    fn check_stage(&self, stage: &Stage) -> Result<()> {
        self.check_substitutions(&stage.substitutions)?;
        if let Some(auth) = &stage.request.auth {
            self.resolve_auth(auth)?;
        }
        for step in &stage.response {
            match step {
                crate::model::ResponseStep::Verify(verify) => {
                    for reference in &verify.user_functions {
                        self.resolve_verify(reference)?;
                    }
                }
                crate::model::ResponseStep::Save(save) => {
                    for reference in &save.user_functions {
                        self.resolve_save(reference)?;
                    }
                    self.check_substitutions(&save.substitutions)?;
                }
            }
        }
        Ok(())
    }

    fn check_substitutions(&self, substitutions: &[Substitution]) -> Result<()> {
        for sub in substitutions {
            if let Substitution::Functions(functions) = sub {
                for reference in functions.values() {
                    self.resolve_substitution(reference)?;
                }
            }
        }
        Ok(())
    }
}

fn wrong_kind(reference: &UserFunctionRef, wanted: &str, found: &UserFunction) -> Error {
    Error::bind(
        reference.function(),
        format!("registered as a {} function, needed {wanted}", found.kind()),
    )
}

fn kwarg_str(kwargs: &Kwargs, key: &str) -> anyhow::Result<String> {
    match kwargs.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => anyhow::bail!("missing kwarg '{key}'"),
    }
}

// ── builtin auth factories ──────────────────────────────────────────

fn bearer(kwargs: &Kwargs) -> anyhow::Result<Authenticator> {
    Ok(Authenticator::Bearer {
        token: kwarg_str(kwargs, "token")?,
    })
}

fn basic(kwargs: &Kwargs) -> anyhow::Result<Authenticator> {
    Ok(Authenticator::Basic {
        username: kwarg_str(kwargs, "username")?,
        password: kwargs
            .get("password")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn header(kwargs: &Kwargs) -> anyhow::Result<Authenticator> {
    Ok(Authenticator::Header {
        name: kwarg_str(kwargs, "name")?,
        value: kwarg_str(kwargs, "value")?,
    })
}

/// Convenience save function used by tests and simple hosts: echoes
/// its kwargs back as the saved map.
pub fn save_kwargs(_: &ResponseData, kwargs: &Kwargs) -> anyhow::Result<IndexMap<String, Value>> {
    Ok(kwargs.clone())
}

/// Convenience verify function: response status is in the 2xx range.
pub fn verify_ok(response: &ResponseData, _: &Kwargs) -> anyhow::Result<bool> {
    Ok((200..300).contains(&response.status))
}

/// Convenience substitution function: a monotonic-ish run marker.
pub fn run_id(_: &Kwargs) -> anyhow::Result<Value> {
    Ok(json!(uuid::Uuid::new_v4().to_string()))
}
