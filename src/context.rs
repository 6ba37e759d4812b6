//! Layered name resolution environment.
//!
//! A scenario run threads values through a stack of frames: scenario
//! substitutions at the bottom, then fixtures, accumulated saves, stage
//! layers, and iteration parameters on top. Lookup walks the stack from
//! the top; writes land in the topmost writable frame. Frames are shared
//! between snapshots via `Arc`, so branching into a parallel iteration
//! is cheap and copy-on-write.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Frame {
    label: &'static str,
    read_only: bool,
    values: HashMap<String, Value>,
}

/// Stacked name→value map with defined precedence.
#[derive(Debug, Clone, Default)]
pub struct LayeredContext {
    frames: Vec<Arc<Frame>>,
}

impl LayeredContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a read-only frame (fixtures, parameters, substitutions).
    pub fn push_frozen(&mut self, label: &'static str, values: HashMap<String, Value>) {
        self.frames.push(Arc::new(Frame {
            label,
            read_only: true,
            values,
        }));
    }

    /// Push a writable frame; `set` targets the topmost of these.
    pub fn push_layer(&mut self, label: &'static str) {
        self.frames.push(Arc::new(Frame {
            label,
            read_only: false,
            values: HashMap::new(),
        }));
    }

    /// Pop the top frame, returning its values.
    pub fn pop(&mut self) -> Option<HashMap<String, Value>> {
        self.frames
            .pop()
            .map(|frame| Arc::try_unwrap(frame).map_or_else(|a| a.values.clone(), |f| f.values))
    }

    /// Look `name` up, highest-priority (topmost) frame first.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.values.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Write `name` into the topmost writable frame.
    ///
    /// Shared frames are cloned on first write after a snapshot, so
    /// sibling snapshots never observe each other's mutations.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Result<()> {
        let frame = self
            .frames
            .iter_mut()
            .rev()
            .find(|frame| !frame.read_only)
            .ok_or_else(|| Error::save("no writable context layer"))?;
        Arc::make_mut(frame).values.insert(name.into(), value);
        Ok(())
    }

    /// O(1) branch point for parallel iterations: frames are shared
    /// until either side writes.
    pub fn snapshot(&self) -> Self {
        Self {
            frames: self.frames.clone(),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Collapse the stack into a single map honoring precedence.
    ///
    /// Used to seed the expression evaluator, which needs a flat
    /// variable table.
    pub fn flatten(&self) -> HashMap<String, Value> {
        let mut flat = HashMap::new();
        for frame in &self.frames {
            for (k, v) in &frame.values {
                flat.insert(k.clone(), v.clone());
            }
        }
        flat
    }

    /// Labels of the frames, bottom to top. Used in trace output.
    pub fn layer_labels(&self) -> Vec<&'static str> {
        self.frames.iter().map(|f| f.label).collect()
    }
}
