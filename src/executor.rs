//! Stage execution engine.
//!
//! A scenario runs its stages in authored order over a layered context:
//! scenario substitutions and fixtures at the bottom, the accumulated
//! global saves above them, and per-iteration stage layers on top. Each
//! stage iteration walks the state machine: build context, render the
//! request, send it, process the response steps, promote saves. A
//! failure marks the scenario failed; later stages run only when
//! `always_run` is set, observing whatever was saved before the
//! failure.

use crate::context::LayeredContext;
use crate::error::{Error, Result};
use crate::functions::FunctionRegistry;
use crate::host::Host;
use crate::loader::EngineConfig;
use crate::model::{
    ClientCert, ParallelConfig, Scenario, SslConfig, SslVerify, Stage, Substitution,
};
use crate::params::{self, DispatchGate, ParamRow};
use crate::report::{ScenarioReport, StageReport, StageStatus};
use crate::request::{build_request, Authenticator, RequestEnv};
use crate::response::{process_steps, ProcessEnv, ResponseData};
use crate::template::TemplateEngine;
use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Per-stage lifecycle, mostly for trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageState {
    BuildingCtx,
    Rendering,
    Sending,
    ProcessingResponse,
}

/// Executes scenarios against live endpoints.
#[async_trait]
pub trait ScenarioRunner: Send + Sync {
    async fn run(&self, scenario: &Scenario, host: &dyn Host) -> Result<ScenarioReport>;
}

/// The default runner.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    registry: Arc<FunctionRegistry>,
    template: TemplateEngine,
}

/// Redirect policy is fixed at client build time, so a scenario keeps
/// two clients sharing the same TLS policy; stages pick by flag.
#[derive(Clone)]
struct Clients {
    follow: Client,
    no_follow: Client,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, FunctionRegistry::with_builtins())
    }

    pub fn with_registry(config: EngineConfig, registry: FunctionRegistry) -> Self {
        let template = TemplateEngine::new(config.max_comprehension_length);
        Self {
            config,
            registry: Arc::new(registry),
            template,
        }
    }

    fn fatal(scenario: &Scenario, err: Error) -> Error {
        Error::Scenario {
            scenario: scenario.name.clone(),
            source: Box::new(err),
        }
    }

    /// Evaluate a substitution list in authoring order; later entries
    /// may reference earlier ones.
    fn eval_substitutions(
        &self,
        substitutions: &[Substitution],
        base: &LayeredContext,
    ) -> Result<HashMap<String, Value>> {
        let mut view = base.snapshot();
        view.push_layer("substitutions");
        for substitution in substitutions {
            match substitution {
                Substitution::Vars(vars) => {
                    for (name, literal) in vars {
                        let walked = self.template.walk(literal, &view)?;
                        view.set(name.clone(), walked)?;
                    }
                }
                Substitution::Functions(functions) => {
                    for (name, reference) in functions {
                        let function = self.registry.resolve_substitution(reference)?;
                        let kwargs = self.walked_kwargs(reference, &view)?;
                        let value = function(&kwargs).map_err(|e| {
                            Error::validation(format!("substitution '{name}': {e}"))
                        })?;
                        view.set(name.clone(), value)?;
                    }
                }
            }
        }
        Ok(view.pop().unwrap_or_default())
    }

    fn walked_kwargs(
        &self,
        reference: &crate::model::UserFunctionRef,
        ctx: &LayeredContext,
    ) -> Result<crate::functions::Kwargs> {
        let mut out = crate::functions::Kwargs::new();
        if let Some(kwargs) = reference.kwargs() {
            for (key, value) in kwargs {
                out.insert(key.clone(), self.template.walk(value, ctx)?);
            }
        }
        Ok(out)
    }

    fn resolve_authenticator(
        &self,
        stage_auth: Option<&crate::model::UserFunctionRef>,
        scenario_auth: Option<&crate::model::UserFunctionRef>,
        ctx: &LayeredContext,
    ) -> Result<Option<Authenticator>> {
        // Stage override wins over the scenario default.
        let Some(reference) = stage_auth.or(scenario_auth) else {
            return Ok(None);
        };
        let factory = self.registry.resolve_auth(reference)?;
        let kwargs = self.walked_kwargs(reference, ctx)?;
        let authenticator = factory(&kwargs)
            .map_err(|e| Error::bind(reference.function(), format!("auth factory: {e}")))?;
        Ok(Some(authenticator))
    }

    /// One full stage iteration: context, render, send, process.
    async fn run_iteration(
        &self,
        stage: &Stage,
        scenario: &Scenario,
        mut ctx: LayeredContext,
        stage_fixtures: HashMap<String, Value>,
        row: &ParamRow,
        clients: &Clients,
    ) -> Result<IndexMap<String, Value>> {
        let mut state = StageState::BuildingCtx;
        debug!(stage = %stage.name, ?state, "stage iteration");

        ctx.push_frozen("stage fixtures", stage_fixtures);
        let substitutions = self.eval_substitutions(&stage.substitutions, &ctx)?;
        ctx.push_frozen("stage substitutions", substitutions);
        ctx.push_layer("stage saves");
        if !row.values.is_empty() {
            ctx.push_frozen(
                "iteration",
                row.values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
        }

        state = StageState::Rendering;
        debug!(stage = %stage.name, ?state, "stage iteration");
        let request = self.template.walk_record(&stage.request, &ctx)?;

        state = StageState::Sending;
        debug!(stage = %stage.name, ?state, "stage iteration");
        let auth =
            self.resolve_authenticator(request.auth.as_ref(), scenario.auth.as_ref(), &ctx)?;
        let client = if request.allow_redirects {
            &clients.follow
        } else {
            &clients.no_follow
        };
        let env = RequestEnv {
            base_url: self.config.base_url.as_deref(),
            scenario_dir: scenario.source_dir.as_deref(),
            root: self.config.root_path.as_deref().or(scenario.source_dir.as_deref()),
        };
        let builder = build_request(client, &request, &env, auth.as_ref()).await?;
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    seconds: request.timeout,
                    location: Default::default(),
                }
            } else {
                Error::transport(e.to_string())
            }
        })?;

        state = StageState::ProcessingResponse;
        debug!(stage = %stage.name, ?state, "stage iteration");
        let data = ResponseData::capture(response).await?;
        let process_env = ProcessEnv {
            scenario_dir: env.scenario_dir,
            root: env.root,
        };
        process_steps(
            &self.template,
            &self.registry,
            &stage.response,
            &data,
            &ctx,
            &process_env,
        )
    }

    /// Promote iteration saves into the global layer, refusing to
    /// shadow a fixture.
    fn promote_saves(
        ctx: &mut LayeredContext,
        saves: IndexMap<String, Value>,
        fixture_names: &[&String],
    ) -> Result<()> {
        for (name, value) in saves {
            if fixture_names.iter().any(|f| **f == name) {
                return Err(Error::save(format!(
                    "saved value '{name}' would overwrite a fixture"
                )));
            }
            ctx.set(name, value)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        stage: &Stage,
        scenario: &Scenario,
        ctx: &mut LayeredContext,
        host: &dyn Host,
        clients: &Clients,
    ) -> Result<Vec<StageReport>> {
        let mut stage_fixtures = HashMap::new();
        for name in &stage.fixtures {
            let value = host
                .fixture_value(name)
                .map_err(|e| e.in_stage(&stage.name, None))?;
            stage_fixtures.insert(name.clone(), value);
        }
        let fixture_names: Vec<&String> = scenario
            .fixtures
            .iter()
            .chain(stage.fixtures.iter())
            .collect();

        if let Some(parallel) = &stage.parallel {
            return self
                .run_parallel_stage(
                    stage,
                    scenario,
                    ctx,
                    host,
                    clients,
                    parallel,
                    stage_fixtures,
                    &fixture_names,
                )
                .await;
        }

        let rows = params::expand(&stage.parametrize)?;
        let parametrized = !stage.parametrize.is_empty();
        let mut reports = Vec::with_capacity(rows.len());

        for row in &rows {
            let key = parametrized.then(|| row.id.clone());
            if host.cancelled() {
                reports.push(StageReport {
                    name: stage.name.clone(),
                    iteration: key,
                    status: StageStatus::Skipped,
                    error: None,
                    duration_ms: 0,
                });
                continue;
            }

            let started = Instant::now();
            let outcome = self
                .run_iteration(
                    stage,
                    scenario,
                    ctx.snapshot(),
                    stage_fixtures.clone(),
                    row,
                    clients,
                )
                .await
                .and_then(|saves| Self::promote_saves(ctx, saves, &fixture_names));

            reports.push(self.settle(stage, key, outcome, started, host));
        }

        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel_stage(
        &self,
        stage: &Stage,
        scenario: &Scenario,
        ctx: &mut LayeredContext,
        host: &dyn Host,
        clients: &Clients,
        parallel: &ParallelConfig,
        stage_fixtures: HashMap<String, Value>,
        fixture_names: &[&String],
    ) -> Result<Vec<StageReport>> {
        let rows: Vec<ParamRow> = match parallel {
            ParallelConfig::Repeat { n, .. } => (0..*n)
                .map(|i| ParamRow {
                    id: format!("run-{i}"),
                    values: IndexMap::new(),
                })
                .collect(),
            ParallelConfig::Foreach { parameters, .. } => params::expand(parameters)?,
        };

        let gate = DispatchGate::new(parallel.max_concurrency(), parallel.calls_per_sec());
        let shared_stage = Arc::new(stage.clone());
        let shared_scenario = Arc::new(scenario.clone());
        let mut tasks: JoinSet<(String, Result<IndexMap<String, Value>>, u64)> = JoinSet::new();
        let mut reports = Vec::with_capacity(rows.len());

        for row in rows {
            if host.cancelled() {
                // Stop dispatching; in-flight invocations drain below,
                // bounded by their own timeouts.
                reports.push(StageReport {
                    name: stage.name.clone(),
                    iteration: Some(row.id),
                    status: StageStatus::Skipped,
                    error: None,
                    duration_ms: 0,
                });
                continue;
            }

            let permit = gate.admit().await;
            let engine = self.clone();
            let task_stage = shared_stage.clone();
            let task_scenario = shared_scenario.clone();
            let snapshot = ctx.snapshot();
            let fixtures = stage_fixtures.clone();
            let task_clients = clients.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let result = engine
                    .run_iteration(
                        &task_stage,
                        &task_scenario,
                        snapshot,
                        fixtures,
                        &row,
                        &task_clients,
                    )
                    .await;
                (row.id, result, started.elapsed().as_millis() as u64)
            });
        }

        // Joining in completion order makes the save merge
        // last-completion-wins, which is all the ordering that is
        // promised for parallel saves.
        while let Some(joined) = tasks.join_next().await {
            let (id, result, duration_ms) =
                joined.map_err(|e| Error::transport(format!("parallel worker died: {e}")))?;
            let outcome =
                result.and_then(|saves| Self::promote_saves(ctx, saves, fixture_names));
            let report = match outcome {
                Ok(()) => {
                    host.report_pass(&stage.name, Some(&id));
                    StageReport {
                        name: stage.name.clone(),
                        iteration: Some(id),
                        status: StageStatus::Passed,
                        error: None,
                        duration_ms,
                    }
                }
                Err(err) => {
                    let err = err.in_stage(&stage.name, Some(id.clone()));
                    warn!(stage = %stage.name, iteration = %id, "iteration failed: {err}");
                    host.report_fail(&stage.name, Some(&id), &err);
                    StageReport {
                        name: stage.name.clone(),
                        iteration: Some(id),
                        status: StageStatus::Failed,
                        error: Some(err.to_string()),
                        duration_ms,
                    }
                }
            };
            reports.push(report);
        }

        Ok(reports)
    }

    fn settle(
        &self,
        stage: &Stage,
        iteration: Option<String>,
        outcome: Result<()>,
        started: Instant,
        host: &dyn Host,
    ) -> StageReport {
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                host.report_pass(&stage.name, iteration.as_deref());
                StageReport {
                    name: stage.name.clone(),
                    iteration,
                    status: StageStatus::Passed,
                    error: None,
                    duration_ms,
                }
            }
            Err(err) => {
                let err = err.in_stage(&stage.name, iteration.clone());
                warn!(stage = %stage.name, "stage failed: {err}");
                host.report_fail(&stage.name, iteration.as_deref(), &err);
                StageReport {
                    name: stage.name.clone(),
                    iteration,
                    status: StageStatus::Failed,
                    error: Some(err.to_string()),
                    duration_ms,
                }
            }
        }
    }
}

#[async_trait]
impl ScenarioRunner for Engine {
    #[instrument(skip(self, scenario, host), fields(name = %scenario.name))]
    async fn run(&self, scenario: &Scenario, host: &dyn Host) -> Result<ScenarioReport> {
        let started = Instant::now();
        info!("starting scenario: {}", scenario.name);

        host.apply_markers(&scenario.name, &scenario.marks);

        // Fail before the first request: unresolvable function
        // references and missing fixtures are load-time errors.
        self.registry
            .check_scenario(scenario)
            .map_err(|e| Self::fatal(scenario, e))?;
        for stage in &scenario.stages {
            for fixture in scenario.fixtures.iter().chain(stage.fixtures.iter()) {
                host.fixture_value(fixture)
                    .map_err(|e| Self::fatal(scenario, e))?;
            }
        }

        let clients = build_clients(&scenario.ssl).map_err(|e| Self::fatal(scenario, e))?;

        let mut ctx = LayeredContext::new();
        let scenario_subs = self
            .eval_substitutions(&scenario.substitutions, &ctx)
            .map_err(|e| Self::fatal(scenario, e))?;
        ctx.push_frozen("scenario substitutions", scenario_subs);

        let mut scenario_fixtures = HashMap::new();
        for name in &scenario.fixtures {
            scenario_fixtures
                .insert(name.clone(), host.fixture_value(name).map_err(|e| Self::fatal(scenario, e))?);
        }
        ctx.push_frozen("scenario fixtures", scenario_fixtures);
        ctx.push_layer("global saves");

        let mut stage_reports = Vec::new();
        let mut failed = false;

        for stage in &scenario.stages {
            host.apply_markers(&stage.name, &stage.marks);

            if (failed && !stage.always_run) || host.cancelled() {
                debug!(stage = %stage.name, "skipping");
                stage_reports.push(StageReport {
                    name: stage.name.clone(),
                    iteration: None,
                    status: StageStatus::Skipped,
                    error: None,
                    duration_ms: 0,
                });
                continue;
            }

            info!("running stage: {}", stage.name);
            let reports = self
                .run_stage(stage, scenario, &mut ctx, host, &clients)
                .await?;
            if reports.iter().any(|r| r.status == StageStatus::Failed) {
                failed = true;
            }
            stage_reports.extend(reports);
        }

        let report = ScenarioReport {
            name: scenario.name.clone(),
            success: !failed,
            error: failed.then(|| "one or more stages failed".to_string()),
            stages: stage_reports,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "scenario finished: {} ({} ms) success: {}",
            report.name, report.duration_ms, report.success
        );
        Ok(report)
    }
}

/// Build the scenario's HTTP clients from its TLS policy.
fn build_clients(ssl: &SslConfig) -> Result<Clients> {
    Ok(Clients {
        follow: client_builder(ssl)?.build().map_err(client_error)?,
        no_follow: client_builder(ssl)?
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(client_error)?,
    })
}

fn client_error(e: reqwest::Error) -> Error {
    Error::transport(format!("cannot build HTTP client: {e}"))
}

fn client_builder(ssl: &SslConfig) -> Result<reqwest::ClientBuilder> {
    let mut builder = Client::builder();

    match &ssl.verify {
        SslVerify::Flag(true) => {}
        SslVerify::Flag(false) => {
            builder = builder.danger_accept_invalid_certs(true);
        }
        SslVerify::CaBundle(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                Error::path(format!("cannot read CA bundle '{}': {e}", path.display()))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::validation(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }
    }

    if let Some(cert) = &ssl.cert {
        let pem = match cert {
            ClientCert::Combined(path) => std::fs::read(path).map_err(|e| {
                Error::path(format!("cannot read client cert '{}': {e}", path.display()))
            })?,
            ClientCert::Pair(cert_path, key_path) => {
                let mut pem = std::fs::read(cert_path).map_err(|e| {
                    Error::path(format!(
                        "cannot read client cert '{}': {e}",
                        cert_path.display()
                    ))
                })?;
                pem.extend(std::fs::read(key_path).map_err(|e| {
                    Error::path(format!(
                        "cannot read client key '{}': {e}",
                        key_path.display()
                    ))
                })?);
                pem
            }
        };
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::validation(format!("invalid client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutions_later_entries_see_earlier() {
        let engine = Engine::new(EngineConfig::default());
        let substitutions: Vec<Substitution> = serde_json::from_value(json!([
            {"vars": {"base": "v1"}},
            {"vars": {"path": "{{ base }}/users"}}
        ]))
        .unwrap();

        let values = engine
            .eval_substitutions(&substitutions, &LayeredContext::new())
            .unwrap();
        assert_eq!(values["path"], json!("v1/users"));
    }

    #[test]
    fn promote_refuses_fixture_shadowing() {
        let mut ctx = LayeredContext::new();
        ctx.push_layer("global saves");
        let fixture = "api_key".to_string();
        let mut saves = IndexMap::new();
        saves.insert("api_key".to_string(), json!("stolen"));

        let err = Engine::promote_saves(&mut ctx, saves, &[&fixture]).unwrap_err();
        assert!(matches!(err, Error::Save { .. }));
    }

    #[test]
    fn promote_writes_to_global_layer() {
        let mut ctx = LayeredContext::new();
        ctx.push_layer("global saves");
        let mut saves = IndexMap::new();
        saves.insert("token".to_string(), json!("T"));
        Engine::promote_saves(&mut ctx, saves, &[]).unwrap();
        assert_eq!(ctx.get("token"), Some(&json!("T")));
    }

    #[test]
    fn clients_build_with_default_ssl() {
        assert!(build_clients(&SslConfig::default()).is_ok());
    }
}
