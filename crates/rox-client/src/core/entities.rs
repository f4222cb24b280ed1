use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::core::configuration::ExperimentModel;
use crate::core::impression::{ImpressionInvoker, ReportingValue};
use crate::core::repositories::{ExperimentRepository, FlagRepository};
use crate::eval::parser::{EvalContext, EvaluationResult, Parser};
use crate::model::dynamic_value::double_to_string;
use crate::model::{Context, DynamicValue};

pub const FLAG_TRUE_VALUE: &str = "true";
pub const FLAG_FALSE_VALUE: &str = "false";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    Bool,
    Int,
    Double,
    String,
}

/// Layered features (overrides, freeze) hook flag evaluation through this
/// seam. Returning a value short-circuits the condition evaluation; the
/// impression still fires with the intercepted value.
pub trait EvaluationInterceptor: Send + Sync {
    fn intercept(&self, variant: &Variant, eval: &EvalContext) -> Option<DynamicValue>;
}

struct Binding {
    parser: Weak<Parser>,
    condition: String,
    experiment: Option<Arc<ExperimentModel>>,
    impressions: Weak<ImpressionInvoker>,
}

impl Default for Binding {
    fn default() -> Binding {
        Binding {
            parser: Weak::new(),
            condition: String::new(),
            experiment: None,
            impressions: Weak::new(),
        }
    }
}

/// A typed flag: default value, allowed options, and the evaluation binding
/// the flag setter installs whenever experiments change.
pub struct Variant {
    kind: FlagKind,
    default_value: String,
    options: Vec<String>,
    name: RwLock<Option<String>>,
    binding: RwLock<Binding>,
    global_context: RwLock<Option<Context>>,
    interceptor: RwLock<Option<Arc<dyn EvaluationInterceptor>>>,
}

impl Variant {
    fn create(kind: FlagKind, default_value: String, mut options: Vec<String>) -> Variant {
        if !options.contains(&default_value) {
            options.push(default_value.clone());
        }
        Variant {
            kind,
            default_value,
            options,
            name: RwLock::new(None),
            binding: RwLock::new(Binding::default()),
            global_context: RwLock::new(None),
            interceptor: RwLock::new(None),
        }
    }

    pub fn flag(default_value: bool) -> Variant {
        Variant::create(
            FlagKind::Bool,
            default_value.to_string(),
            vec![FLAG_FALSE_VALUE.to_string(), FLAG_TRUE_VALUE.to_string()],
        )
    }

    pub fn string(default_value: &str, options: &[&str]) -> Variant {
        Variant::create(
            FlagKind::String,
            default_value.to_string(),
            options.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn int(default_value: i64, options: &[i64]) -> Variant {
        Variant::create(
            FlagKind::Int,
            default_value.to_string(),
            options.iter().map(|v| v.to_string()).collect(),
        )
    }

    pub fn double(default_value: f64, options: &[f64]) -> Variant {
        Variant::create(
            FlagKind::Double,
            double_to_string(default_value),
            options.iter().map(|v| double_to_string(*v)).collect(),
        )
    }

    pub fn kind(&self) -> FlagKind {
        self.kind
    }

    pub fn name(&self) -> Option<String> {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
    }

    pub fn default_value(&self) -> &str {
        &self.default_value
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn condition(&self) -> String {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .condition
            .clone()
    }

    pub fn experiment(&self) -> Option<Arc<ExperimentModel>> {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .experiment
            .clone()
    }

    pub(crate) fn set_for_evaluation(
        &self,
        parser: Weak<Parser>,
        experiment: Option<Arc<ExperimentModel>>,
        impressions: Weak<ImpressionInvoker>,
    ) {
        let condition = experiment
            .as_ref()
            .map(|experiment| experiment.condition.clone())
            .unwrap_or_default();
        *self.binding.write().unwrap_or_else(PoisonError::into_inner) = Binding {
            parser,
            condition,
            experiment,
            impressions,
        };
    }

    pub fn set_context(&self, context: Context) {
        *self
            .global_context
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(context);
    }

    pub fn global_context(&self) -> Option<Context> {
        self.global_context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_interceptor(&self, interceptor: Arc<dyn EvaluationInterceptor>) {
        *self
            .interceptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(interceptor);
    }

    /// Core evaluation: interceptor, then the bound condition, then the
    /// default; always followed by an impression when a sink is bound.
    fn value(
        &self,
        default_override: Option<String>,
        eval: &EvalContext,
        converter: &Converter,
    ) -> DynamicValue {
        let default_value = default_override.unwrap_or_else(|| self.default_value.clone());
        let (parser, condition, experiment, impressions) = {
            let binding = self.binding.read().unwrap_or_else(PoisonError::into_inner);
            (
                binding.parser.clone(),
                binding.condition.clone(),
                binding.experiment.clone(),
                binding.impressions.clone(),
            )
        };

        let mut used_context: Option<Context> = None;
        let mut value: Option<DynamicValue> = None;

        if eval.consult_interceptor() {
            let interceptor = self
                .interceptor
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(interceptor) = interceptor {
                value = interceptor.intercept(self, eval);
            }
        }

        if value.is_none() && !condition.is_empty() {
            if let Some(parser) = parser.upgrade() {
                let result = parser.evaluate_expression(&condition, eval);
                if let Some(evaluated) = (converter.from_result)(&result) {
                    used_context = result.used_context().cloned();
                    value = Some(evaluated);
                }
            }
        }

        let value = value.unwrap_or_else(|| {
            (converter.from_string)(&default_value).unwrap_or(DynamicValue::Undefined)
        });

        if let Some(invoker) = impressions.upgrade() {
            let reporting_value = ReportingValue {
                name: self.name().unwrap_or_default(),
                value: (converter.to_string)(&value).unwrap_or_default(),
                targeting: experiment.is_some(),
            };
            invoker.invoke(&reporting_value, experiment.as_deref(), used_context.as_ref());
        }

        value
    }

    pub fn get_string(&self, default_value: Option<&str>, eval: &EvalContext) -> String {
        self.value(default_value.map(str::to_string), eval, &STRING_CONVERTER)
            .as_str()
            .map(str::to_string)
            .unwrap_or_default()
    }

    pub fn get_int(&self, default_value: Option<i64>, eval: &EvalContext) -> i64 {
        self.value(default_value.map(|v| v.to_string()), eval, &INT_CONVERTER)
            .as_int()
            .unwrap_or_default()
    }

    pub fn get_double(&self, default_value: Option<f64>, eval: &EvalContext) -> f64 {
        self.value(default_value.map(double_to_string), eval, &DOUBLE_CONVERTER)
            .as_double()
            .unwrap_or_default()
    }

    pub fn get_bool(&self, default_value: Option<bool>, eval: &EvalContext) -> bool {
        self.value(default_value.map(|v| v.to_string()), eval, &BOOL_CONVERTER)
            .as_bool()
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, eval: &EvalContext) -> bool {
        self.get_bool(None, eval)
    }
}

/// Kind-specific conversion triple: default string → value, evaluation
/// result → value, value → reported string.
pub(crate) struct Converter {
    pub from_string: fn(&str) -> Option<DynamicValue>,
    pub from_result: fn(&EvaluationResult) -> Option<DynamicValue>,
    pub to_string: fn(&DynamicValue) -> Option<String>,
}

pub(crate) static STRING_CONVERTER: Converter = Converter {
    from_string: |s| Some(DynamicValue::String(s.to_string())),
    from_result: |result| result.string_value().map(DynamicValue::String),
    to_string: |value| value.as_str().map(str::to_string),
};

pub(crate) static INT_CONVERTER: Converter = Converter {
    from_string: |s| s.parse::<i64>().ok().map(DynamicValue::Int),
    from_result: |result| match result.value() {
        DynamicValue::Int(value) => Some(DynamicValue::Int(*value)),
        DynamicValue::String(s) => s.parse::<i64>().ok().map(DynamicValue::Int),
        _ => None,
    },
    to_string: |value| value.as_int().map(|v| v.to_string()),
};

pub(crate) static DOUBLE_CONVERTER: Converter = Converter {
    from_string: |s| s.parse::<f64>().ok().map(DynamicValue::Double),
    from_result: |result| match result.value() {
        DynamicValue::Double(value) => Some(DynamicValue::Double(*value)),
        DynamicValue::Int(value) => Some(DynamicValue::Double(*value as f64)),
        DynamicValue::String(s) => s.parse::<f64>().ok().map(DynamicValue::Double),
        _ => None,
    },
    to_string: |value| value.as_double().map(double_to_string),
};

pub(crate) static BOOL_CONVERTER: Converter = Converter {
    from_string: |s| Some(DynamicValue::Bool(s == FLAG_TRUE_VALUE)),
    from_result: |result| match result.value() {
        DynamicValue::Undefined => None,
        DynamicValue::Bool(value) => Some(DynamicValue::Bool(*value)),
        DynamicValue::String(s) => Some(DynamicValue::Bool(s == FLAG_TRUE_VALUE)),
        _ => None,
    },
    to_string: |value| value.as_bool().map(|v| v.to_string()),
};

/// Re-binds every flag to its governing experiment whenever the experiment
/// set changes, and binds late-registered flags as they appear.
pub struct FlagSetter {
    flag_repository: Arc<FlagRepository>,
    experiment_repository: Arc<ExperimentRepository>,
    parser: Weak<Parser>,
    impressions: Weak<ImpressionInvoker>,
}

impl FlagSetter {
    pub fn new(
        flag_repository: &Arc<FlagRepository>,
        parser: &Arc<Parser>,
        experiment_repository: &Arc<ExperimentRepository>,
        impressions: &Arc<ImpressionInvoker>,
    ) -> Arc<FlagSetter> {
        let setter = Arc::new(FlagSetter {
            flag_repository: flag_repository.clone(),
            experiment_repository: experiment_repository.clone(),
            parser: Arc::downgrade(parser),
            impressions: Arc::downgrade(impressions),
        });
        let weak = Arc::downgrade(&setter);
        flag_repository.add_flag_added_callback(Box::new(move |variant| {
            if let Some(setter) = weak.upgrade() {
                setter.bind_flag(variant);
            }
        }));
        setter
    }

    fn bind_flag(&self, variant: &Arc<Variant>) {
        let experiment = variant
            .name()
            .and_then(|name| self.experiment_repository.experiment_by_flag(&name));
        variant.set_for_evaluation(self.parser.clone(), experiment, self.impressions.clone());
    }

    pub fn set_experiments(&self) {
        let mut flags_with_condition = HashSet::new();
        for experiment in self.experiment_repository.all_experiments().iter() {
            for flag_name in &experiment.flags {
                if let Some(flag) = self.flag_repository.flag(flag_name) {
                    flag.set_for_evaluation(
                        self.parser.clone(),
                        Some(experiment.clone()),
                        self.impressions.clone(),
                    );
                    flags_with_condition.insert(flag_name.clone());
                }
            }
        }
        for flag in self.flag_repository.all_flags() {
            let bound = flag
                .name()
                .map(|name| flags_with_condition.contains(&name))
                .unwrap_or(false);
            if !bound {
                flag.set_for_evaluation(self.parser.clone(), None, self.impressions.clone());
            }
        }
    }
}
