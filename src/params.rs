//! Parameter expansion and parallel dispatch primitives.
//!
//! `parametrize` blocks expand to rows composed by Cartesian product in
//! lexicographic (nested-loop) order. Parallel stages dispatch through
//! a semaphore-bounded worker set, optionally gated by a token bucket
//! so the average call rate stays under `calls_per_sec`.

use crate::error::{Error, Result};
use crate::model::Parameter;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// One expanded iteration: its display key and parameter bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRow {
    pub id: String,
    pub values: IndexMap<String, Value>,
}

impl ParamRow {
    fn empty() -> Self {
        Self {
            id: String::new(),
            values: IndexMap::new(),
        }
    }

    fn join(&self, other: &ParamRow) -> ParamRow {
        let mut values = self.values.clone();
        for (k, v) in &other.values {
            values.insert(k.clone(), v.clone());
        }
        let id = match (self.id.is_empty(), other.id.is_empty()) {
            (true, _) => other.id.clone(),
            (_, true) => self.id.clone(),
            _ => format!("{}-{}", self.id, other.id),
        };
        ParamRow { id, values }
    }
}

/// Expand parameter blocks into the full cross-product.
pub fn expand(blocks: &[Parameter]) -> Result<Vec<ParamRow>> {
    let mut rows = vec![ParamRow::empty()];
    for block in blocks {
        let block_rows = expand_block(block)?;
        let mut next = Vec::with_capacity(rows.len() * block_rows.len());
        for left in &rows {
            for right in &block_rows {
                next.push(left.join(right));
            }
        }
        rows = next;
    }
    Ok(rows)
}

fn expand_block(block: &Parameter) -> Result<Vec<ParamRow>> {
    match block {
        Parameter::Individual(individual) => {
            let (key, values) = individual
                .values
                .iter()
                .next()
                .ok_or_else(|| Error::validation("individual block has no parameter key"))?;
            Ok(values
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    let id = individual
                        .ids
                        .as_ref()
                        .map(|ids| ids[i].clone())
                        .unwrap_or_else(|| scalar_id(value));
                    let mut row = IndexMap::new();
                    row.insert(key.clone(), value.clone());
                    ParamRow { id, values: row }
                })
                .collect())
        }
        Parameter::Combinations(combinations) => Ok(combinations
            .rows
            .iter()
            .enumerate()
            .map(|(i, mapping)| {
                let id = combinations
                    .ids
                    .as_ref()
                    .map(|ids| ids[i].clone())
                    .unwrap_or_else(|| {
                        mapping.values().map(scalar_id).collect::<Vec<_>>().join("-")
                    });
                ParamRow {
                    id,
                    values: mapping.clone(),
                }
            })
            .collect()),
    }
}

fn scalar_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Token bucket with capacity `calls_per_sec`, refilled continuously
/// over one second. The bucket starts empty, so `n` acquisitions take
/// at least `(n-1)/rate` seconds and an idle bucket can never burst
/// more than one second's quota.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(calls_per_sec: f64) -> Self {
        Self {
            rate: calls_per_sec,
            capacity: calls_per_sec,
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the refill makes one available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                (1.0 - state.tokens) / self.rate
            };
            debug!("rate limit: sleeping {wait:.3}s");
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

/// Shared gate for a parallel block: concurrency bound plus optional
/// rate limit.
#[derive(Debug, Clone)]
pub struct DispatchGate {
    semaphore: Arc<tokio::sync::Semaphore>,
    bucket: Option<Arc<TokenBucket>>,
}

impl DispatchGate {
    pub fn new(max_concurrency: usize, calls_per_sec: Option<f64>) -> Self {
        Self {
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrency)),
            bucket: calls_per_sec.map(|rate| Arc::new(TokenBucket::new(rate))),
        }
    }

    /// Wait for a concurrency slot and a rate token. The returned
    /// permit is held for the duration of the invocation.
    pub async fn admit(&self) -> tokio::sync::OwnedSemaphorePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("dispatch semaphore closed");
        if let Some(bucket) = &self.bucket {
            bucket.acquire().await;
        }
        permit
    }
}
