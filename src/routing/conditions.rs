//! Routing condition evaluation

use regex::RegexBuilder;
use serde_json::Value;

use super::RoutingError;
use crate::detection::{DeviceInfo, GeoInfo};
use crate::models::{ConditionKind, ConditionOperator, EdgeRequest, RoutingCondition};

/// Facts a routing rule can be conditioned on
pub struct RouteContext<'a> {
    pub geo: &'a GeoInfo,
    pub device: &'a DeviceInfo,
    pub request: &'a EdgeRequest,
    /// Current UTC hour, 0-23
    pub hour: u32,
}

impl RouteContext<'_> {
    fn subject(&self, condition: &RoutingCondition) -> Option<String> {
        let field = condition.field.as_deref().map(str::to_ascii_lowercase);
        match (condition.kind, field.as_deref()) {
            (ConditionKind::Geo, None | Some("country")) => self.geo.country.clone(),
            (ConditionKind::Geo, Some("region")) => self
                .geo
                .region_code
                .clone()
                .or_else(|| self.geo.region.clone()),
            (ConditionKind::Geo, Some("city")) => self.geo.city.clone(),
            (ConditionKind::Geo, Some("continent")) => self.geo.continent.clone(),
            (ConditionKind::Device, None | Some("type")) => {
                Some(self.device.device_type.to_string())
            }
            (ConditionKind::Device, Some("browser")) => self.device.browser.clone(),
            (ConditionKind::Device, Some("os")) => self.device.os.clone(),
            (ConditionKind::Isp, None | Some("org")) => self.geo.as_org.clone(),
            (ConditionKind::Isp, Some("asn")) => self.geo.asn.map(|asn| asn.to_string()),
            (ConditionKind::Connection, _) => Some(
                self.request
                    .header("ect")
                    .or_else(|| self.request.header("cf-connection-type"))
                    .filter(|v| !v.is_empty())
                    .unwrap_or("unknown")
                    .to_string(),
            ),
            (ConditionKind::Time, _) => Some(self.hour.to_string()),
            _ => None,
        }
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `in` / `not_in` accept either an array or a comma separated string
fn value_list(value: &Value) -> Result<Vec<String>, RoutingError> {
    match value {
        Value::Array(items) => Ok(items.iter().filter_map(value_text).collect()),
        Value::String(s) => Ok(s.split(',').map(|item| item.trim().to_string()).collect()),
        Value::Number(_) | Value::Bool(_) => Ok(value_text(value).into_iter().collect()),
        other => Err(RoutingError::InvalidValue(other.to_string())),
    }
}

fn number(operator: ConditionOperator, raw: &str) -> Result<f64, RoutingError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| RoutingError::NonNumeric {
            operator,
            value: raw.to_string(),
        })
}

pub fn evaluate(condition: &RoutingCondition, ctx: &RouteContext<'_>) -> Result<bool, RoutingError> {
    let subject = ctx.subject(condition);
    let subject = subject.as_deref();

    match condition.operator {
        ConditionOperator::Eq | ConditionOperator::Neq => {
            let expected = value_text(&condition.value)
                .ok_or_else(|| RoutingError::InvalidValue(condition.value.to_string()))?;
            let equal = subject.is_some_and(|s| s.eq_ignore_ascii_case(&expected));
            Ok(equal == (condition.operator == ConditionOperator::Eq))
        }
        ConditionOperator::In | ConditionOperator::NotIn => {
            let list = value_list(&condition.value)?;
            let member = subject.is_some_and(|s| list.iter().any(|item| item.eq_ignore_ascii_case(s)));
            Ok(member == (condition.operator == ConditionOperator::In))
        }
        ConditionOperator::Gt | ConditionOperator::Lt => {
            let bound_text = value_text(&condition.value)
                .ok_or_else(|| RoutingError::InvalidValue(condition.value.to_string()))?;
            let bound = number(condition.operator, &bound_text)?;
            let Some(subject) = subject else {
                return Ok(false);
            };
            let actual = number(condition.operator, subject)?;
            Ok(if condition.operator == ConditionOperator::Gt {
                actual > bound
            } else {
                actual < bound
            })
        }
        ConditionOperator::Regex => {
            let pattern = value_text(&condition.value)
                .ok_or_else(|| RoutingError::InvalidValue(condition.value.to_string()))?;
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .size_limit(1 << 20)
                .build()
                .map_err(|source| RoutingError::InvalidRegex {
                    pattern: pattern.clone(),
                    source,
                })?;
            Ok(subject.is_some_and(|s| regex.is_match(s)))
        }
    }
}

/// Every condition must hold; an empty list always matches
pub fn all_match(conditions: &[RoutingCondition], ctx: &RouteContext<'_>) -> Result<bool, RoutingError> {
    for condition in conditions {
        if !evaluate(condition, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}
