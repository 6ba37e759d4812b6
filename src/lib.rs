//! stagehand: declarative HTTP API scenario testing engine.
//!
//! A scenario is a JSON document describing an ordered chain of HTTP
//! stages: each stage renders a request through the template engine,
//! sends it, verifies the response, and saves extracted values for the
//! stages that follow.

pub mod context;
pub mod error;
pub mod executor;
pub mod functions;
pub mod host;
pub mod loader;
pub mod model;
pub mod params;
pub mod report;
pub mod request;
pub mod resolver;
pub mod response;
pub mod template;

pub use context::LayeredContext;
pub use error::{Error, Location, Result};
pub use executor::{Engine, ScenarioRunner};
pub use functions::{FunctionRegistry, UserFunction};
pub use host::{Host, StaticHost};
pub use loader::{EngineConfig, ScenarioLoader};
pub use model::Scenario;
pub use report::{RunReport, ScenarioReport, StageReport, StageStatus};
pub use template::TemplateEngine;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
