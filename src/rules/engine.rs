//! The rule evaluation engine
//!
//! Owns the registered rule set, the reverse dependency index, and the
//! cached state view. Runs as one task: absorbs deltas from the state
//! core, schedules debounced evaluation of the affected rules, and emits
//! action batches to the alert service.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debounce::Debounce;
use super::view::StateView;
use super::{Rule, RuleContext, RulePriority};
use crate::config::defaults::{
    MAX_RULES, MAX_RULE_DEPENDENCIES, RULE_DEBOUNCE_INTERVAL_MS, RULE_DEBOUNCE_MAX_WAIT_MS,
};
use crate::state::StateDelta;
use crate::types::ActionRecord;

/// Capacity of the action batch channel to the alert service.
const ACTION_CHANNEL_BOUND: usize = 64;

/// Capacity of the evaluation event broadcast.
const EVALUATION_CHANNEL_CAPACITY: usize = 64;

/// Per-cycle observability event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationEvent {
    /// "leading" or "trailing".
    pub edge: &'static str,
    /// Delta source tag that scheduled the cycle.
    pub source: String,
    pub candidates: usize,
    pub triggered: usize,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Running statistics, exposed for operational visibility.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub evaluations: u64,
    pub rules_triggered: u64,
    /// Rolling average cycle duration (ms).
    pub avg_duration_ms: f64,
    pub last_evaluation: Option<DateTime<Utc>>,
}

struct RuleEntry {
    rule: Box<dyn Rule>,
    priority: RulePriority,
}

/// Dependency-indexed, debounced rule evaluator.
pub struct RuleEngine {
    rules: Vec<RuleEntry>,
    /// Reverse index: dependency path -> rule indices.
    index: HashMap<String, Vec<usize>>,
    /// Rules with no dependencies, evaluated on every delta.
    global: Vec<usize>,
    view: StateView,
    pending: BTreeSet<usize>,
    pending_source: String,
    debounce: Debounce,
    stats: EngineStats,
    actions_tx: mpsc::Sender<Vec<ActionRecord>>,
    events_tx: broadcast::Sender<EvaluationEvent>,
}

impl RuleEngine {
    /// Build an engine primed with an initial document snapshot. Returns
    /// the receiving end of the action batch channel for the alert
    /// service.
    pub fn new(initial: Value) -> (Self, mpsc::Receiver<Vec<ActionRecord>>) {
        let (actions_tx, actions_rx) = mpsc::channel(ACTION_CHANNEL_BOUND);
        let (events_tx, _) = broadcast::channel(EVALUATION_CHANNEL_CAPACITY);
        let engine = Self {
            rules: Vec::new(),
            index: HashMap::new(),
            global: Vec::new(),
            view: StateView::new(initial),
            pending: BTreeSet::new(),
            pending_source: "state".to_string(),
            debounce: Debounce::new(
                Duration::from_millis(RULE_DEBOUNCE_INTERVAL_MS),
                Duration::from_millis(RULE_DEBOUNCE_MAX_WAIT_MS),
            ),
            stats: EngineStats::default(),
            actions_tx,
            events_tx,
        };
        (engine, actions_rx)
    }

    /// Register a rule and index its dependencies. Rules are immutable
    /// after registration.
    pub fn register(&mut self, rule: Box<dyn Rule>) {
        let idx = self.rules.len();
        if idx >= MAX_RULES {
            warn!(
                rule = rule.name(),
                count = idx + 1,
                "Rule count exceeds the soft cap"
            );
        }
        let deps = rule.depends_on();
        if deps.len() > MAX_RULE_DEPENDENCIES {
            warn!(
                rule = rule.name(),
                deps = deps.len(),
                "Rule dependency count exceeds the soft cap"
            );
        }
        if deps.is_empty() {
            self.global.push(idx);
        } else {
            for dep in deps {
                self.index
                    .entry((*dep).to_string())
                    .or_default()
                    .push(idx);
            }
        }
        debug!(rule = rule.name(), deps = ?deps, "Rule registered");
        self.rules.push(RuleEntry {
            priority: rule.priority(),
            rule,
        });
    }

    /// Subscribe to per-cycle evaluation events.
    pub fn subscribe_evaluations(&self) -> broadcast::Receiver<EvaluationEvent> {
        self.events_tx.subscribe()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Absorb a delta into the cache and return the candidate rule set.
    /// Exposed for direct-drive tests; the task loop calls it per delta.
    pub fn update_state(&mut self, delta: &StateDelta) -> BTreeSet<usize> {
        let changed = self.view.absorb(delta);
        let mut candidates = BTreeSet::new();
        if changed.is_empty() {
            return candidates;
        }
        for path in &changed {
            if path.is_empty() {
                // Root swap touches everything.
                candidates.extend(0..self.rules.len());
                break;
            }
            for (dep, rule_ids) in &self.index {
                if paths_overlap(path, dep) {
                    candidates.extend(rule_ids.iter().copied());
                }
            }
        }
        candidates.extend(self.global.iter().copied());
        candidates
    }

    /// Run until cancellation or the delta stream closes.
    pub async fn run(
        mut self,
        mut delta_rx: mpsc::UnboundedReceiver<StateDelta>,
        cancel: CancellationToken,
    ) {
        info!(rules = self.rules.len(), "Rule engine started");
        loop {
            let deadline = self.debounce.deadline();
            tokio::select! {
                () = cancel.cancelled() => {
                    self.debounce.cancel();
                    info!("Rule engine shutting down");
                    break;
                }
                delta = delta_rx.recv() => {
                    let Some(delta) = delta else { break };
                    let candidates = self.update_state(&delta);
                    if candidates.is_empty() {
                        continue;
                    }
                    self.pending.extend(candidates);
                    self.pending_source = delta.source;
                    if self.debounce.note_input(Instant::now()) {
                        self.evaluate("leading").await;
                    }
                }
                () = sleep_until_option(deadline), if deadline.is_some() => {
                    self.debounce.close_window();
                    if !self.pending.is_empty() {
                        self.evaluate("trailing").await;
                    }
                }
            }
        }
    }

    /// Evaluate the accumulated candidate set, priority order.
    async fn evaluate(&mut self, edge: &'static str) {
        let started = Instant::now();
        let now = Utc::now();
        let candidates = std::mem::take(&mut self.pending);
        let candidate_count = candidates.len();

        let mut ordered: Vec<usize> = candidates.into_iter().collect();
        ordered.sort_by_key(|&idx| (self.rules[idx].priority.rank(), idx));

        let mut actions: Vec<ActionRecord> = Vec::new();
        let view = &self.view;
        let source = self.pending_source.clone();
        for idx in ordered {
            let entry = &mut self.rules[idx];
            let ctx = RuleContext {
                state: view,
                source: &source,
                now,
            };
            let fired = match entry.rule.condition(&ctx) {
                Ok(fired) => fired,
                Err(e) => {
                    warn!(rule = entry.rule.name(), error = %e, "Rule condition failed");
                    continue;
                }
            };
            if !fired {
                continue;
            }
            match entry.rule.action(&ctx) {
                Ok(Some(action)) => {
                    self.stats.rules_triggered += 1;
                    actions.push(ActionRecord {
                        action,
                        rule_id: entry.rule.name().to_string(),
                        timestamp: now,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(rule = entry.rule.name(), error = %e, "Rule action failed");
                }
            }
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.evaluations += 1;
        self.stats.last_evaluation = Some(now);
        // Rolling average over all cycles so far.
        let n = self.stats.evaluations as f64;
        self.stats.avg_duration_ms += (duration_ms - self.stats.avg_duration_ms) / n;

        let triggered = actions.len();
        let _ = self.events_tx.send(EvaluationEvent {
            edge,
            source,
            candidates: candidate_count,
            triggered,
            duration_ms,
            timestamp: now,
        });
        debug!(
            edge,
            candidates = candidate_count,
            triggered,
            duration_ms,
            "Rule evaluation cycle"
        );

        if !actions.is_empty() && self.actions_tx.send(actions).await.is_err() {
            warn!("Alert service gone - rule actions dropped");
        }
    }
}

/// Whether a changed path schedules a dependency path. True when either
/// is a prefix of the other at a `.` boundary.
fn paths_overlap(changed: &str, dep: &str) -> bool {
    if changed == dep {
        return true;
    }
    if let Some(rest) = changed.strip_prefix(dep) {
        if rest.starts_with('.') {
            return true;
        }
    }
    if let Some(rest) = dep.strip_prefix(changed) {
        if rest.starts_with('.') {
            return true;
        }
    }
    false
}

async fn sleep_until_option(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
