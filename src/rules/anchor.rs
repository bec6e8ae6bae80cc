//! Anchor watch rules
//!
//! Two alarm rules (critical range, anchor dragging) with a 10-second
//! latch, plus their resolution companions. The latch lives in the rule:
//! a candidate timestamp is set the first time the breach is observed and
//! cleared the moment the breach condition reads false, so a single bad
//! GPS fix never wakes the crew.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::geo::haversine_distance;
use super::{Rule, RuleContext, RuleError, RulePriority};
use crate::config::defaults::{ANCHOR_ALARM_HOLD_SECS, ANCHOR_DRAG_DRIFT_METERS};
use crate::types::{format_distance, AlertLevel, AlertSpec, Position, RuleAction};

const ANCHOR_DEPS: &[&str] = &["anchor", "navigation.position"];

/// Shared reads for the anchor rule family.
struct AnchorReading {
    drop: Position,
    critical_range: f64,
    distance: f64,
}

fn read_anchor(ctx: &RuleContext<'_>) -> Option<AnchorReading> {
    if ctx.state.get_bool("anchor.anchorDeployed") != Some(true) {
        return None;
    }
    let boat = ctx.state.position("navigation.position")?;
    let drop = ctx.state.position("anchor.anchorDropLocation")?;
    let critical_range = ctx.state.get_f64("anchor.criticalRange.r")?;
    Some(AnchorReading {
        drop,
        critical_range,
        distance: haversine_distance(boat, drop),
    })
}

// ============================================================================
// Critical Range
// ============================================================================

/// Fires when the boat has been outside the critical range for the full
/// hold window and no unacknowledged alert is already up.
#[derive(Default)]
pub struct CriticalRangeRule {
    candidate_since: Option<DateTime<Utc>>,
}

impl CriticalRangeRule {
    pub const TRIGGER: &'static str = "critical_range";
}

impl Rule for CriticalRangeRule {
    fn name(&self) -> &'static str {
        "critical-range"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::High
    }

    fn depends_on(&self) -> &[&'static str] {
        ANCHOR_DEPS
    }

    fn condition(&mut self, ctx: &RuleContext<'_>) -> Result<bool, RuleError> {
        let breached = match read_anchor(ctx) {
            Some(r) => r.distance > r.critical_range,
            None => false,
        };
        if !breached {
            self.candidate_since = None;
            return Ok(false);
        }
        let since = *self.candidate_since.get_or_insert(ctx.now);
        let held = (ctx.now - since).num_seconds();
        Ok(held >= ANCHOR_ALARM_HOLD_SECS && !ctx.state.has_open_alert(Self::TRIGGER))
    }

    fn action(&mut self, ctx: &RuleContext<'_>) -> Result<Option<RuleAction>, RuleError> {
        let Some(r) = read_anchor(ctx) else {
            return Ok(None);
        };
        let unit = ctx.state.distance_unit();
        let distance = format_distance(r.distance, unit);
        let range = format_distance(r.critical_range, unit);
        Ok(Some(RuleAction::CreateAlert {
            data: AlertSpec {
                alert_type: Some("anchor".to_string()),
                category: Some("safety".to_string()),
                level: Some(AlertLevel::Critical),
                label: Some("Anchor Alarm".to_string()),
                message: Some(format!(
                    "Boat is {distance} from the anchor drop point, outside the {range} critical range"
                )),
                trigger: Some(Self::TRIGGER.to_string()),
                data: json!({
                    "distance": r.distance,
                    "range": r.critical_range,
                    "units": unit.suffix(),
                }),
                phone_notification: Some(true),
                sticky: Some(true),
                auto_resolvable: Some(true),
                ..Default::default()
            },
        }))
    }
}

/// Resolves the critical-range alert once the boat is back inside the
/// radius (or the anchor is weighed).
#[derive(Default)]
pub struct CriticalRangeClearRule;

impl Rule for CriticalRangeClearRule {
    fn name(&self) -> &'static str {
        "critical-range-clear"
    }

    fn depends_on(&self) -> &[&'static str] {
        ANCHOR_DEPS
    }

    fn condition(&mut self, ctx: &RuleContext<'_>) -> Result<bool, RuleError> {
        if !ctx.state.has_auto_resolvable_alert(CriticalRangeRule::TRIGGER) {
            return Ok(false);
        }
        if ctx.state.get_bool("anchor.anchorDeployed") != Some(true) {
            return Ok(true);
        }
        // A lost fix is not a recovery; resolve only on measured return.
        Ok(matches!(read_anchor(ctx), Some(r) if r.distance <= r.critical_range))
    }

    fn action(&mut self, ctx: &RuleContext<'_>) -> Result<Option<RuleAction>, RuleError> {
        let unit = ctx.state.distance_unit();
        let data = read_anchor(ctx).map(|r| {
            json!({
                "distance": r.distance,
                "range": r.critical_range,
                "formattedRange": format_distance(r.critical_range, unit),
            })
        });
        Ok(Some(RuleAction::ResolveAlerts {
            trigger: CriticalRangeRule::TRIGGER.to_string(),
            data,
        }))
    }
}

// ============================================================================
// Anchor Dragging
// ============================================================================

/// Fires when the boat is outside the critical range *and* the anchor
/// position estimate has drifted from the drop point - the anchor is
/// moving, not just the boat swinging on its rode.
#[derive(Default)]
pub struct AnchorDraggingRule {
    candidate_since: Option<DateTime<Utc>>,
}

impl AnchorDraggingRule {
    pub const TRIGGER: &'static str = "anchor_dragging";

    fn breach(ctx: &RuleContext<'_>) -> Option<(AnchorReading, f64)> {
        let reading = read_anchor(ctx)?;
        let anchor = ctx.state.position("anchor.anchorLocation")?;
        let drift = haversine_distance(reading.drop, anchor);
        (reading.distance > reading.critical_range && drift > ANCHOR_DRAG_DRIFT_METERS)
            .then_some((reading, drift))
    }
}

impl Rule for AnchorDraggingRule {
    fn name(&self) -> &'static str {
        "anchor-dragging"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::High
    }

    fn depends_on(&self) -> &[&'static str] {
        ANCHOR_DEPS
    }

    fn condition(&mut self, ctx: &RuleContext<'_>) -> Result<bool, RuleError> {
        if Self::breach(ctx).is_none() {
            self.candidate_since = None;
            return Ok(false);
        }
        let since = *self.candidate_since.get_or_insert(ctx.now);
        let held = (ctx.now - since).num_seconds();
        Ok(held >= ANCHOR_ALARM_HOLD_SECS && !ctx.state.has_open_alert(Self::TRIGGER))
    }

    fn action(&mut self, ctx: &RuleContext<'_>) -> Result<Option<RuleAction>, RuleError> {
        let Some((r, drift)) = Self::breach(ctx) else {
            return Ok(None);
        };
        let unit = ctx.state.distance_unit();
        Ok(Some(RuleAction::CreateAlert {
            data: AlertSpec {
                alert_type: Some("anchor".to_string()),
                category: Some("safety".to_string()),
                level: Some(AlertLevel::Emergency),
                label: Some("Anchor Dragging".to_string()),
                message: Some(format!(
                    "Anchor has dragged {} from the drop point; boat is {} out",
                    format_distance(drift, unit),
                    format_distance(r.distance, unit),
                )),
                trigger: Some(Self::TRIGGER.to_string()),
                data: json!({
                    "distance": r.distance,
                    "drift": drift,
                    "range": r.critical_range,
                    "units": unit.suffix(),
                }),
                phone_notification: Some(true),
                sticky: Some(true),
                auto_resolvable: Some(true),
                ..Default::default()
            },
        }))
    }
}

/// Resolution companion for [`AnchorDraggingRule`].
#[derive(Default)]
pub struct AnchorDraggingClearRule;

impl Rule for AnchorDraggingClearRule {
    fn name(&self) -> &'static str {
        "anchor-dragging-clear"
    }

    fn depends_on(&self) -> &[&'static str] {
        ANCHOR_DEPS
    }

    fn condition(&mut self, ctx: &RuleContext<'_>) -> Result<bool, RuleError> {
        if !ctx.state.has_auto_resolvable_alert(AnchorDraggingRule::TRIGGER) {
            return Ok(false);
        }
        if ctx.state.get_bool("anchor.anchorDeployed") != Some(true) {
            return Ok(true);
        }
        match read_anchor(ctx) {
            Some(_) => Ok(AnchorDraggingRule::breach(ctx).is_none()),
            None => Ok(false),
        }
    }

    fn action(&mut self, _ctx: &RuleContext<'_>) -> Result<Option<RuleAction>, RuleError> {
        Ok(Some(RuleAction::ResolveAlerts {
            trigger: AnchorDraggingRule::TRIGGER.to_string(),
            data: None,
        }))
    }
}
