//! 配置校验模块
//!
//! 校验规则：
//! - 各字段数值范围 (由 `validator` derive 声明)
//! - schedule.capacity >= 2 * macrocycle.max_events
//! - clock_sync.high_spread_us < clock_sync.medium_spread_us
//! - min_lead_time_us <= default_lead_time_us <= max_lead_time_us
//! - link.max_payload 不小于一个满载宏周期

use std::borrow::Cow;

use contracts::{ContractError, NodeConfig, MACROCYCLE_MAX_EVENTS};
use ::validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Worst-case encoded size of one macrocycle event block
const MAX_EVENT_BLOCK_LEN: usize = 36;
/// Worst-case `MC:<seq>|<time>|<count>` header plus terminator
const MAX_HEADER_LEN: usize = 40;

/// 校验 NodeConfig 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(config: &NodeConfig) -> Result<(), ContractError> {
    validate_ranges(config)?;
    validate_schedule_capacity(config)?;
    validate_confidence_thresholds(config)?;
    validate_lead_times(config)?;
    validate_payload(config)?;
    Ok(())
}

/// 非致命问题，供 `validate` 命令提示
pub fn warnings(config: &NodeConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if !config.latency.enabled {
        warnings.push("latency instrumentation is disabled; no drift statistics will be reported".into());
    }
    if config.latency.alignment_bound_us > 30_000 {
        warnings.push(format!(
            "latency.alignment_bound_us = {} exceeds the 30 ms perceptual limit",
            config.latency.alignment_bound_us
        ));
    }
    let worst_one_way = config.link.latency_us + config.link.jitter_us;
    if worst_one_way >= config.clock_sync.min_lead_time_us {
        warnings.push(format!(
            "worst one-way link delay ({worst_one_way} us) reaches min_lead_time_us ({} us); \
             macrocycles may arrive after their deadline",
            config.clock_sync.min_lead_time_us
        ));
    }
    if config.link.loss_rate > 0.2 {
        warnings.push(format!(
            "link.loss_rate = {} will trigger keepalive misses frequently",
            config.link.loss_rate
        ));
    }
    warnings
}

/// 数值范围 (derive 规则)
fn validate_ranges(config: &NodeConfig) -> Result<(), ContractError> {
    match config.validate() {
        Ok(()) => Ok(()),
        Err(errors) => {
            let (field, message) = first_violation(&errors, "")
                .unwrap_or_else(|| ("config".to_string(), errors.to_string()));
            Err(ContractError::config_validation(field, message))
        }
    }
}

/// Depth-first, alphabetically first violation with its dotted path
fn first_violation(errors: &ValidationErrors, prefix: &str) -> Option<(String, String)> {
    let mut fields: Vec<(&Cow<'static, str>, &ValidationErrorsKind)> =
        errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    for (name, kind) in fields {
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                if let Some(err) = list.first() {
                    let message = match err.params.get("value") {
                        Some(value) => format!("failed '{}' check (got {value})", err.code),
                        None => format!("failed '{}' check", err.code),
                    };
                    return Some((path, message));
                }
            }
            ValidationErrorsKind::Struct(inner) => {
                if let Some(found) = first_violation(inner, &path) {
                    return Some(found);
                }
            }
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    if let Some(found) = first_violation(inner, &format!("{path}[{index}]")) {
                        return Some(found);
                    }
                }
            }
        }
    }
    None
}

/// 调度容量需容纳一个完整宏周期 (每个事件一开一关)
fn validate_schedule_capacity(config: &NodeConfig) -> Result<(), ContractError> {
    let needed = 2 * config.macrocycle.max_events;
    if config.schedule.capacity < needed {
        return Err(ContractError::config_validation(
            "schedule.capacity",
            format!(
                "capacity ({}) must be >= 2 * macrocycle.max_events ({needed})",
                config.schedule.capacity
            ),
        ));
    }
    Ok(())
}

/// 置信度阈值
fn validate_confidence_thresholds(config: &NodeConfig) -> Result<(), ContractError> {
    let sync = &config.clock_sync;
    if sync.high_spread_us >= sync.medium_spread_us {
        return Err(ContractError::config_validation(
            "clock_sync.high_spread_us / clock_sync.medium_spread_us",
            format!(
                "high_spread_us ({}) must be < medium_spread_us ({})",
                sync.high_spread_us, sync.medium_spread_us
            ),
        ));
    }
    Ok(())
}

/// 提前量范围
fn validate_lead_times(config: &NodeConfig) -> Result<(), ContractError> {
    let sync = &config.clock_sync;
    if !(sync.min_lead_time_us <= sync.default_lead_time_us
        && sync.default_lead_time_us <= sync.max_lead_time_us)
    {
        return Err(ContractError::config_validation(
            "clock_sync.default_lead_time_us",
            format!(
                "lead times must satisfy min ({}) <= default ({}) <= max ({})",
                sync.min_lead_time_us, sync.default_lead_time_us, sync.max_lead_time_us
            ),
        ));
    }
    Ok(())
}

/// 链路载荷需能承载满载宏周期
fn validate_payload(config: &NodeConfig) -> Result<(), ContractError> {
    let events = config.macrocycle.max_events.min(MACROCYCLE_MAX_EVENTS);
    let needed = MAX_HEADER_LEN + events * MAX_EVENT_BLOCK_LEN;
    if config.link.max_payload < needed {
        return Err(ContractError::config_validation(
            "link.max_payload",
            format!(
                "max_payload ({}) cannot carry {events} events (needs {needed} bytes)",
                config.link.max_payload
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        assert!(validate(&NodeConfig::default()).is_ok());
    }

    #[test]
    fn test_range_violation_reports_dotted_path() {
        let mut config = NodeConfig::default();
        config.macrocycle.max_events = 13;
        let err = validate(&config).unwrap_err();
        match err {
            ContractError::ConfigValidation { field, message } => {
                assert_eq!(field, "macrocycle.max_events");
                assert!(message.contains("range"), "got: {message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_loss_rate_must_be_below_one() {
        let mut config = NodeConfig::default();
        config.link.loss_rate = 1.0;
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("link.loss_rate"), "got: {err}");
    }

    #[test]
    fn test_schedule_too_small_for_macrocycle() {
        let mut config = NodeConfig::default();
        config.schedule.capacity = 20;
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("2 * macrocycle.max_events (24)"), "got: {err}");

        config.macrocycle.max_events = 10;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_confidence_thresholds_ordered() {
        let mut config = NodeConfig::default();
        config.clock_sync.high_spread_us = 20_000;
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("must be < medium_spread_us"), "got: {err}");
    }

    #[test]
    fn test_default_lead_outside_bounds() {
        let mut config = NodeConfig::default();
        config.clock_sync.default_lead_time_us = 120_000;
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("lead times"), "got: {err}");
    }

    #[test]
    fn test_payload_too_small() {
        let mut config = NodeConfig::default();
        config.link.max_payload = 200;
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("link.max_payload"), "got: {err}");
    }

    #[test]
    fn test_warnings() {
        let config = NodeConfig::default();
        let warnings = warnings(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("latency instrumentation"));

        let mut config = NodeConfig::default();
        config.latency.enabled = true;
        config.latency.alignment_bound_us = 40_000;
        config.link.latency_us = 20_000;
        assert_eq!(super::warnings(&config).len(), 2);
    }
}
