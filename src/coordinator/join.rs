//! Join synchronization table.
//!
//! A transition with `synchronization.waitFor` fires exactly once per
//! `(transition, joinKey)` pair, after every awaited upstream ref has all
//! of its expected arrivals under that key. The coordinator supplies the
//! expected count per ref (it knows the fan-out width when it creates
//! tokens); the table only counts. Arrivals after firing are discarded
//! (the caller logs the warning).

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Result of registering one arrival.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// Still waiting on at least one upstream arrival.
    Pending,
    /// All upstreams arrived: the aggregated input, keyed by upstream ref.
    /// Multi-arrival refs expose their outputs as an index-ordered array.
    Fired(Map<String, Value>),
    /// This key already fired; the arrival is dropped.
    AlreadyFired,
}

type JoinSlot = HashMap<String, Vec<(usize, Value)>>;

#[derive(Debug, Default)]
pub struct JoinTable {
    /// Arrivals per (transition index, join key), then per upstream ref.
    arrivals: HashMap<(usize, String), JoinSlot>,
    fired: HashSet<(usize, String)>,
}

impl JoinTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completed token at a synchronized transition.
    ///
    /// `expected` maps each awaited ref to the number of arrivals required
    /// before the join fires; absent refs default to one.
    #[allow(clippy::too_many_arguments)]
    pub fn arrive(
        &mut self,
        transition_idx: usize,
        join_key: &str,
        wait_for: &[String],
        expected: &HashMap<String, usize>,
        node_ref: &str,
        spawn_index: Option<usize>,
        output: Value,
    ) -> JoinOutcome {
        let slot_key = (transition_idx, join_key.to_string());
        if self.fired.contains(&slot_key) {
            return JoinOutcome::AlreadyFired;
        }

        let slot = self.arrivals.entry(slot_key.clone()).or_default();
        slot.entry(node_ref.to_string())
            .or_default()
            .push((spawn_index.unwrap_or(0), output));

        let complete = wait_for.iter().all(|r| {
            let need = expected.get(r).copied().unwrap_or(1).max(1);
            slot.get(r).map(Vec::len).unwrap_or(0) >= need
        });
        if !complete {
            return JoinOutcome::Pending;
        }

        self.fired.insert(slot_key.clone());
        let slot = self.arrivals.remove(&slot_key).unwrap_or_default();

        let mut aggregated = Map::new();
        for r in wait_for {
            let mut outputs = slot.get(r).cloned().unwrap_or_default();
            outputs.sort_by_key(|(idx, _)| *idx);
            let values: Vec<Value> = outputs.into_iter().map(|(_, v)| v).collect();
            let value = if values.len() == 1 {
                values.into_iter().next().expect("length checked")
            } else {
                Value::Array(values)
            };
            aggregated.insert(r.clone(), value);
        }
        JoinOutcome::Fired(aggregated)
    }
}
