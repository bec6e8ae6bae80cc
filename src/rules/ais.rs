//! AIS proximity rules
//!
//! While anchored, any AIS target inside the warning radius raises a
//! proximity alert; when the last target leaves the radius the companion
//! rule resolves it. No hold window here - a vessel bearing down on an
//! anchored boat is news immediately.

use serde_json::json;

use super::geo::haversine_distance;
use super::{Rule, RuleContext, RuleError, RulePriority};
use crate::types::{format_distance, AlertLevel, AlertSpec, RuleAction};

const AIS_DEPS: &[&str] = &["anchor", "aisTargets", "navigation.position"];

/// Count of AIS targets within the warning radius, with the radius.
fn targets_in_range(ctx: &RuleContext<'_>) -> Option<(usize, f64)> {
    if ctx.state.get_bool("anchor.anchorDeployed") != Some(true) {
        return None;
    }
    let boat = ctx.state.position("navigation.position")?;
    let range = ctx.state.get_f64("anchor.warningRange.r")?;
    let count = ctx
        .state
        .ais_targets()
        .iter()
        .filter(|(_, pos)| haversine_distance(boat, *pos) <= range)
        .count();
    Some((count, range))
}

pub struct AisProximityRule;

impl AisProximityRule {
    pub const TRIGGER: &'static str = "ais_proximity";
}

impl Rule for AisProximityRule {
    fn name(&self) -> &'static str {
        "ais-proximity"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Normal
    }

    fn depends_on(&self) -> &[&'static str] {
        AIS_DEPS
    }

    fn condition(&mut self, ctx: &RuleContext<'_>) -> Result<bool, RuleError> {
        match targets_in_range(ctx) {
            Some((count, _)) => Ok(count >= 1 && !ctx.state.has_open_alert(Self::TRIGGER)),
            None => Ok(false),
        }
    }

    fn action(&mut self, ctx: &RuleContext<'_>) -> Result<Option<RuleAction>, RuleError> {
        let Some((count, range)) = targets_in_range(ctx) else {
            return Ok(None);
        };
        let unit = ctx.state.distance_unit();
        let formatted_range = format_distance(range, unit);
        Ok(Some(RuleAction::CreateAlert {
            data: AlertSpec {
                alert_type: Some("ais".to_string()),
                category: Some("safety".to_string()),
                level: Some(AlertLevel::Warning),
                label: Some("Vessel Proximity".to_string()),
                message: Some(format!(
                    "{count} vessel(s) detected within warning radius of {formatted_range}"
                )),
                trigger: Some(Self::TRIGGER.to_string()),
                data: json!({
                    "count": count,
                    "range": range,
                    "formattedRange": formatted_range,
                }),
                phone_notification: Some(true),
                auto_resolvable: Some(true),
                ..Default::default()
            },
        }))
    }
}

/// Resolves the proximity alert when no targets remain in range.
pub struct AisClearRule;

impl Rule for AisClearRule {
    fn name(&self) -> &'static str {
        "ais-proximity-clear"
    }

    fn depends_on(&self) -> &[&'static str] {
        AIS_DEPS
    }

    fn condition(&mut self, ctx: &RuleContext<'_>) -> Result<bool, RuleError> {
        if !ctx.state.has_auto_resolvable_alert(AisProximityRule::TRIGGER) {
            return Ok(false);
        }
        if ctx.state.get_bool("anchor.anchorDeployed") != Some(true) {
            return Ok(true);
        }
        match targets_in_range(ctx) {
            Some((count, _)) => Ok(count == 0),
            // Radius or fix unavailable: zero *measured* targets is not
            // the same as all clear.
            None => Ok(false),
        }
    }

    fn action(&mut self, ctx: &RuleContext<'_>) -> Result<Option<RuleAction>, RuleError> {
        let unit = ctx.state.distance_unit();
        let data = targets_in_range(ctx).map(|(_, range)| {
            json!({
                "range": range,
                "formattedRange": format_distance(range, unit),
            })
        });
        Ok(Some(RuleAction::ResolveAlerts {
            trigger: AisProximityRule::TRIGGER.to_string(),
            data,
        }))
    }
}
