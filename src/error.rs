//! Error kinds for scenario loading and execution.
//!
//! Every variant carries a [`Location`] so failures can be traced back
//! to a file, JSON pointer, stage, and iteration.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Where an error occurred: file, JSON pointer, stage, iteration key.
///
/// All fields are optional; whatever is known at the failure site gets
/// filled in as the error propagates outward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub file: Option<PathBuf>,
    pub pointer: Option<String>,
    pub stage: Option<String>,
    pub iteration: Option<String>,
}

impl Location {
    pub fn in_file(file: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::default()
        }
    }

    pub fn at_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.pointer = Some(pointer.into());
        self
    }

    pub fn in_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn in_iteration(mut self, key: impl Into<String>) -> Self {
        self.iteration = Some(key.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.file.is_none()
            && self.pointer.is_none()
            && self.stage.is_none()
            && self.iteration.is_none()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::new();
        if let Some(file) = &self.file {
            parts.push(format!("file {}", file.display()));
        }
        if let Some(pointer) = &self.pointer {
            parts.push(format!("pointer {pointer}"));
        }
        if let Some(stage) = &self.stage {
            parts.push(format!("stage {stage}"));
        }
        if let Some(iteration) = &self.iteration {
            parts.push(format!("iteration {iteration}"));
        }
        write!(f, " [{}]", parts.join(", "))
    }
}

/// All failure modes of the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The document does not match the scenario model.
    #[error("validation error{location}: {message}")]
    Validation { message: String, location: Location },

    /// A `$ref` escaped the allowed filesystem area.
    #[error("path error{location}: {message}")]
    Path { message: String, location: Location },

    /// A JSON pointer did not resolve.
    #[error("pointer error{location}: '{pointer}' not found")]
    Pointer { pointer: String, location: Location },

    /// Deep merge of a reference with its siblings hit a type mismatch.
    #[error("merge error{location}: cannot merge {found} into {expected}")]
    Merge {
        expected: &'static str,
        found: &'static str,
        location: Location,
    },

    /// A `$ref` chain re-entered an active frame.
    #[error("reference cycle{location}: {chain}")]
    Cycle { chain: String, location: Location },

    /// Expression evaluation failed.
    #[error("template error in '{expression}'{location}: {message}")]
    Template {
        expression: String,
        message: String,
        location: Location,
    },

    /// A comprehension generated more elements than allowed.
    #[error("comprehension exceeds limit of {limit} elements{location}")]
    ComprehensionLimit { limit: usize, location: Location },

    /// A user function reference could not be resolved.
    #[error("cannot bind user function '{reference}'{location}: {message}")]
    Bind {
        reference: String,
        message: String,
        location: Location,
    },

    /// The HTTP exchange exceeded its deadline.
    #[error("request timed out after {seconds}s{location}")]
    Timeout { seconds: f64, location: Location },

    /// The HTTP exchange failed below the protocol level.
    #[error("transport error{location}: {message}")]
    Transport { message: String, location: Location },

    /// A verify step did not hold.
    #[error("verify failed{location}: {check}")]
    Verify { check: String, location: Location },

    /// A save step could not produce its values.
    #[error("save failed{location}: {message}")]
    Save { message: String, location: Location },

    /// Per-stage wrapper surfaced to the host.
    #[error("stage '{stage}' failed{}: {source}", .iteration.as_deref().map(|k| format!(" (iteration {k})")).unwrap_or_default())]
    Stage {
        stage: String,
        iteration: Option<String>,
        #[source]
        source: Box<Error>,
    },

    /// Fatal at scenario load: the scenario cannot execute.
    #[error("scenario '{scenario}' failed to load: {source}")]
    Scenario {
        scenario: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            location: Location::default(),
        }
    }

    pub fn path(message: impl Into<String>) -> Self {
        Self::Path {
            message: message.into(),
            location: Location::default(),
        }
    }

    pub fn pointer(pointer: impl Into<String>) -> Self {
        Self::Pointer {
            pointer: pointer.into(),
            location: Location::default(),
        }
    }

    pub fn template(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            expression: expression.into(),
            message: message.into(),
            location: Location::default(),
        }
    }

    pub fn bind(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bind {
            reference: reference.into(),
            message: message.into(),
            location: Location::default(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            location: Location::default(),
        }
    }

    pub fn verify(check: impl Into<String>) -> Self {
        Self::Verify {
            check: check.into(),
            location: Location::default(),
        }
    }

    pub fn save(message: impl Into<String>) -> Self {
        Self::Save {
            message: message.into(),
            location: Location::default(),
        }
    }

    pub fn in_stage(self, stage: impl Into<String>, iteration: Option<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            iteration,
            source: Box::new(self),
        }
    }

    /// Attach location details to the innermost error that carries one.
    pub fn with_location(mut self, loc: Location) -> Self {
        if let Some(slot) = self.location_mut() {
            if slot.is_empty() {
                *slot = loc;
            }
        }
        self
    }

    fn location_mut(&mut self) -> Option<&mut Location> {
        match self {
            Self::Validation { location, .. }
            | Self::Path { location, .. }
            | Self::Pointer { location, .. }
            | Self::Merge { location, .. }
            | Self::Cycle { location, .. }
            | Self::Template { location, .. }
            | Self::ComprehensionLimit { location, .. }
            | Self::Bind { location, .. }
            | Self::Timeout { location, .. }
            | Self::Transport { location, .. }
            | Self::Verify { location, .. }
            | Self::Save { location, .. } => Some(location),
            Self::Stage { source, .. } | Self::Scenario { source, .. } => {
                source.location_mut()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
