//! Rule engine: event-driven evaluation of domain rules over the document
//!
//! Rules are registered once at startup and evaluated whenever the paths
//! they depend on change. The engine keeps its own cached view of the
//! document (fed by state-core deltas), so evaluation never touches the
//! writer task.

pub mod ais;
pub mod anchor;
pub mod debounce;
pub mod engine;
pub mod geo;
pub mod view;

pub use engine::{EngineStats, EvaluationEvent, RuleEngine};
pub use view::StateView;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::RuleAction;

/// Evaluation priority; higher evaluates first within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RulePriority {
    High,
    #[default]
    Normal,
    Low,
}

impl RulePriority {
    /// Sort key: high < normal < low.
    pub fn rank(self) -> u8 {
        match self {
            RulePriority::High => 0,
            RulePriority::Normal => 1,
            RulePriority::Low => 2,
        }
    }
}

/// Error raised by a rule's condition or action. Caught per-rule by the
/// engine: logged with the rule id, never aborts the cycle.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RuleError(pub String);

impl RuleError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Everything a rule may read during evaluation.
pub struct RuleContext<'a> {
    /// Consistent snapshot view for this cycle.
    pub state: &'a StateView,
    /// Tag of the delta batch that scheduled the cycle.
    pub source: &'a str,
    /// Cycle wall-clock time; injected so latching rules are testable.
    pub now: DateTime<Utc>,
}

/// A registered domain rule.
///
/// `condition` and `action` take `&mut self` so a rule can keep its own
/// debounce scratch state (e.g. the critical-range candidate timestamp);
/// they must not have any other side effects.
pub trait Rule: Send {
    /// Stable rule id, stamped onto emitted actions.
    fn name(&self) -> &'static str;

    fn priority(&self) -> RulePriority {
        RulePriority::Normal
    }

    /// Dot-notation paths this rule watches. Empty means global: the rule
    /// runs on every delta.
    fn depends_on(&self) -> &[&'static str];

    fn condition(&mut self, ctx: &RuleContext<'_>) -> Result<bool, RuleError>;

    /// Invoked only when `condition` returned true in the same cycle.
    fn action(&mut self, ctx: &RuleContext<'_>) -> Result<Option<RuleAction>, RuleError>;
}
