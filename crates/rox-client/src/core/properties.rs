use std::sync::{Arc, PoisonError, RwLock};

use serde_json::json;

use crate::model::{Context, DynamicValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomPropertyType {
    String,
    Bool,
    Int,
    Double,
    Semver,
}

impl CustomPropertyType {
    pub fn type_name(&self) -> &'static str {
        match self {
            CustomPropertyType::String => "string",
            CustomPropertyType::Bool => "bool",
            CustomPropertyType::Int => "int",
            CustomPropertyType::Double => "double",
            CustomPropertyType::Semver => "semver",
        }
    }

    /// Type label the backend expects in the state payload.
    pub fn external_type(&self) -> &'static str {
        match self {
            CustomPropertyType::String => "String",
            CustomPropertyType::Bool => "Boolean",
            CustomPropertyType::Int | CustomPropertyType::Double => "Number",
            CustomPropertyType::Semver => "Semver",
        }
    }
}

type Generator = dyn Fn(Option<&Context>) -> DynamicValue + Send + Sync;

enum CustomPropertyValue {
    Static(DynamicValue),
    Generated(Box<Generator>),
}

/// A named value the `property` operator resolves during evaluation, either
/// constant or produced by a generator over the call context.
pub struct CustomProperty {
    name: String,
    property_type: CustomPropertyType,
    value: CustomPropertyValue,
}

impl CustomProperty {
    pub fn new(
        name: impl Into<String>,
        property_type: CustomPropertyType,
        value: DynamicValue,
    ) -> CustomProperty {
        CustomProperty {
            name: name.into(),
            property_type,
            value: CustomPropertyValue::Static(value),
        }
    }

    pub fn with_generator(
        name: impl Into<String>,
        property_type: CustomPropertyType,
        generator: impl Fn(Option<&Context>) -> DynamicValue + Send + Sync + 'static,
    ) -> CustomProperty {
        CustomProperty {
            name: name.into(),
            property_type,
            value: CustomPropertyValue::Generated(Box::new(generator)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property_type(&self) -> CustomPropertyType {
        self.property_type
    }

    pub fn value(&self, context: Option<&Context>) -> DynamicValue {
        match &self.value {
            CustomPropertyValue::Static(value) => value.clone(),
            CustomPropertyValue::Generated(generator) => generator(context),
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "type": self.property_type.type_name(),
            "externalType": self.property_type.external_type(),
        })
    }
}

pub type DynamicPropertiesRule = Arc<dyn Fn(&str, Option<&Context>) -> Option<DynamicValue> + Send + Sync>;

/// Fallback rule the `property` operator consults for names with no
/// registered custom property. The default rule reads the call context.
pub struct DynamicProperties {
    rule: RwLock<Option<DynamicPropertiesRule>>,
}

impl DynamicProperties {
    pub fn new() -> DynamicProperties {
        DynamicProperties {
            rule: RwLock::new(None),
        }
    }

    pub fn set_rule(&self, rule: DynamicPropertiesRule) {
        *self.rule.write().unwrap_or_else(PoisonError::into_inner) = Some(rule);
    }

    pub fn rule(&self) -> DynamicPropertiesRule {
        self.rule
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Arc::new(|name, context| context.and_then(|ctx| ctx.get(name))))
    }
}

impl Default for DynamicProperties {
    fn default() -> DynamicProperties {
        DynamicProperties::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rox_context;

    #[test]
    fn test_static_and_generated_values() {
        let constant = CustomProperty::new("plan", CustomPropertyType::String, DynamicValue::String("pro".into()));
        assert_eq!(constant.value(None), DynamicValue::String("pro".into()));

        let generated = CustomProperty::with_generator("tier", CustomPropertyType::Int, |ctx| {
            ctx.and_then(|c| c.get("tier")).unwrap_or(DynamicValue::Undefined)
        });
        let context = rox_context! { "tier" => DynamicValue::Int(3) };
        assert_eq!(generated.value(Some(&context)), DynamicValue::Int(3));
        assert_eq!(generated.value(None), DynamicValue::Undefined);
    }

    #[test]
    fn test_default_rule_reads_context() {
        let dynamics = DynamicProperties::new();
        let context = rox_context! { "region" => DynamicValue::String("eu".into()) };
        assert_eq!(
            dynamics.rule()("region", Some(&context)),
            Some(DynamicValue::String("eu".into()))
        );
        assert_eq!(dynamics.rule()("region", None), None);
    }
}
