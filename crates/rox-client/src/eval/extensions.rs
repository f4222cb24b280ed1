use std::sync::Arc;

use crate::core::entities::FLAG_FALSE_VALUE;
use crate::core::properties::DynamicProperties;
use crate::core::repositories::{
    CustomPropertyRepository, ExperimentRepository, FlagRepository, TargetGroupRepository,
};
use crate::eval::parser::{EvalContext, Parser};
use crate::model::DynamicValue;

/// Deterministic `[0.0, 1.0)` value derived from an MD5 seed, used for
/// percentage rollouts. The first four digest bytes are read little-endian
/// and scaled by `2^32 - 1`; an exact `1.0` coerces to `0.0`.
pub fn bucket(seed: &str) -> f64 {
    let digest = md5::compute(seed.as_bytes());
    let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let bucket = hash as f64 / (2f64.powi(32) - 1.0);
    if bucket == 1.0 { 0.0 } else { bucket }
}

/// Registers the experiment-related operators. The captured repositories are
/// the live ones owned by the orchestrator.
pub fn add_experiment_extensions(
    parser: &mut Parser,
    target_group_repository: &Arc<TargetGroupRepository>,
    flag_repository: &Arc<FlagRepository>,
    experiment_repository: &Arc<ExperimentRepository>,
) {
    parser.add_operator("mergeSeed", |_, stack, _| {
        let first = stack.pop().string_value();
        let second = stack.pop().string_value();
        match (first, second) {
            (Some(a), Some(b)) => stack.push_string(format!("{a}.{b}")),
            _ => stack.push_undefined(),
        }
    });

    parser.add_operator("isInPercentage", |_, stack, _| {
        let percentage = stack.pop().number_value();
        let seed = stack.pop().string_value();
        let result = match (percentage, seed) {
            (Some(percentage), Some(seed)) => bucket(&seed) <= percentage,
            _ => false,
        };
        stack.push_boolean(result);
    });

    parser.add_operator("isInPercentageRange", |_, stack, _| {
        let low = stack.pop().number_value();
        let high = stack.pop().number_value();
        let seed = stack.pop().string_value();
        let result = match (low, high, seed) {
            (Some(low), Some(high), Some(seed)) => {
                let bucket = bucket(&seed);
                bucket >= low && bucket < high
            }
            _ => false,
        };
        stack.push_boolean(result);
    });

    let flags = flag_repository.clone();
    let experiments = experiment_repository.clone();
    parser.add_operator("flagValue", move |parser, stack, eval| {
        let Some(name) = stack.pop().string_value() else {
            stack.push_string(FLAG_FALSE_VALUE);
            return;
        };
        if let Some(variant) = flags.flag(&name) {
            let nested = EvalContext::new(Some(&variant), eval.context());
            stack.push_string(variant.get_string(None, &nested));
            return;
        }
        if let Some(experiment) = experiments.experiment_by_flag(&name) {
            if !experiment.condition.is_empty() {
                let result = parser.evaluate_expression(&experiment.condition, eval);
                if let Some(value) = result.string_value() {
                    if !value.is_empty() {
                        stack.push_string(value);
                        return;
                    }
                }
            }
        }
        stack.push_string(FLAG_FALSE_VALUE);
    });

    let target_groups = target_group_repository.clone();
    parser.add_operator("isInTargetGroup", move |parser, stack, eval| {
        let Some(identifier) = stack.pop().string_value() else {
            stack.push_boolean(false);
            return;
        };
        match target_groups.target_group(&identifier) {
            Some(group) => {
                let result = parser.evaluate_expression(&group.condition, eval);
                stack.push_boolean(result.boolean_value().unwrap_or(false));
            }
            None => stack.push_boolean(false),
        }
    });
}

/// Registers the `property` operator backed by the custom-property
/// repository and the dynamic-properties rule.
pub fn add_property_extensions(
    parser: &mut Parser,
    custom_property_repository: &Arc<CustomPropertyRepository>,
    dynamic_properties: &Arc<DynamicProperties>,
) {
    let properties = custom_property_repository.clone();
    let dynamics = dynamic_properties.clone();
    parser.add_operator("property", move |_, stack, eval| {
        let Some(name) = stack.pop().string_value() else {
            stack.push_undefined();
            return;
        };
        if let Some(property) = properties.custom_property(&name) {
            let value = property.value(eval.context());
            // A null property value reads as unknown, not as literal null.
            if value.is_null() {
                stack.push_undefined();
            } else {
                stack.push(value);
            }
            return;
        }
        if let Some(value) = dynamics.rule()(&name, eval.context()) {
            match value {
                DynamicValue::String(_) | DynamicValue::Bool(_) | DynamicValue::Double(_) => {
                    stack.push(value);
                    return;
                }
                DynamicValue::Int(int) => {
                    stack.push_int(int);
                    return;
                }
                _ => {}
            }
        }
        stack.push_undefined();
    });
}
