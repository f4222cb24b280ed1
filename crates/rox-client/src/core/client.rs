use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::consts::{ROX_API_VERSION, ROX_LIB_VERSION, ROX_PLATFORM, property_type};
use crate::core::entities::{FLAG_TRUE_VALUE, Variant};
use crate::core::repositories::{ExperimentRepository, FlagRepository};
use crate::eval::parser::{EvalContext, Parser};
use crate::model::Context;

#[derive(Debug, Clone)]
pub struct SdkSettings {
    pub api_key: String,
    pub dev_mode_secret: String,
}

impl SdkSettings {
    pub fn new(api_key: impl Into<String>, dev_mode_secret: impl Into<String>) -> SdkSettings {
        SdkSettings {
            api_key: api_key.into(),
            dev_mode_secret: dev_mode_secret.into(),
        }
    }
}

/// Identity the device presents to the backend: platform, versions, keys and
/// a per-process distinct id.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    map: HashMap<String, String>,
    distinct_id: String,
}

impl DeviceProperties {
    pub fn new(sdk_settings: &SdkSettings, app_version: &str) -> DeviceProperties {
        let distinct_id = globally_unique_device_id(&sdk_settings.api_key);
        let mut map = HashMap::new();
        map.insert(property_type::LIB_VERSION.to_string(), ROX_LIB_VERSION.to_string());
        map.insert(property_type::API_VERSION.to_string(), ROX_API_VERSION.to_string());
        map.insert(property_type::APP_RELEASE.to_string(), app_version.to_string());
        map.insert(property_type::DISTINCT_ID.to_string(), distinct_id.clone());
        map.insert(property_type::APP_KEY.to_string(), sdk_settings.api_key.clone());
        map.insert(property_type::PLATFORM.to_string(), ROX_PLATFORM.to_string());
        map.insert(
            property_type::DEV_MODE_SECRET.to_string(),
            sdk_settings.dev_mode_secret.clone(),
        );
        DeviceProperties { map, distinct_id }
    }

    pub fn from_map(map: HashMap<String, String>) -> DeviceProperties {
        let distinct_id = map
            .get(property_type::DISTINCT_ID)
            .cloned()
            .unwrap_or_default();
        DeviceProperties { map, distinct_id }
    }

    pub fn all_properties(&self) -> &HashMap<String, String> {
        &self.map
    }

    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }

    pub fn rollout_key(&self) -> &str {
        self.map
            .get(property_type::APP_KEY)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Stable within a process; the platform machine id is not portable, so the
/// id is derived from the app key and process identity.
fn globally_unique_device_id(api_key: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let seed = format!("{api_key}|{}|{nanos}", std::process::id());
    format!("{:x}", md5::compute(seed.as_bytes()))
}

/// Joins the named property values with `|`, hashes them and upper-cases the
/// hex digest. Shared by the BUID and the state fingerprint.
pub(crate) fn generate_fingerprint(
    properties: &HashMap<String, String>,
    generators: &[&str],
) -> String {
    let values: Vec<&str> = generators
        .iter()
        .filter_map(|name| properties.get(*name).map(String::as_str))
        .collect();
    format!("{:x}", md5::compute(values.join("|").as_bytes())).to_uppercase()
}

/// "Build UID": MD5 fingerprint over platform, app key, lib and API version,
/// used as the CDN cache path segment.
#[derive(Debug, Clone)]
pub struct Buid {
    value: String,
}

impl Buid {
    pub fn from_device_properties(device_properties: &DeviceProperties) -> Buid {
        let value = generate_fingerprint(
            device_properties.all_properties(),
            &[
                property_type::PLATFORM,
                property_type::APP_KEY,
                property_type::LIB_VERSION,
                property_type::API_VERSION,
            ],
        );
        Buid { value }
    }

    pub fn dummy(value: impl Into<String>) -> Buid {
        Buid {
            value: value.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// `rox.internal.*` switches arrive as experiments with no registered flag;
/// they are evaluated straight off the experiment condition.
pub struct InternalFlags {
    experiment_repository: Arc<ExperimentRepository>,
    parser: Weak<Parser>,
}

impl InternalFlags {
    pub fn new(experiment_repository: Arc<ExperimentRepository>, parser: &Arc<Parser>) -> InternalFlags {
        InternalFlags {
            experiment_repository,
            parser: Arc::downgrade(parser),
        }
    }

    pub fn is_enabled(&self, flag_name: &str) -> bool {
        self.evaluate(flag_name)
            .and_then(|result| result.string_value())
            .map(|value| value == FLAG_TRUE_VALUE)
            .unwrap_or(false)
    }

    pub fn int_value(&self, flag_name: &str) -> Option<i64> {
        self.evaluate(flag_name)?.int_value()
    }

    fn evaluate(&self, flag_name: &str) -> Option<crate::eval::parser::EvaluationResult> {
        let experiment = self.experiment_repository.experiment_by_flag(flag_name)?;
        let parser = self.parser.upgrade()?;
        Some(parser.evaluate_expression(&experiment.condition, &EvalContext::ad_hoc(None)))
    }
}

/// Ad-hoc flag reads that lazily register the flag with the supplied
/// default, for code paths that cannot declare flags up front.
pub struct DynamicApi {
    flag_repository: Arc<FlagRepository>,
}

impl DynamicApi {
    pub fn new(flag_repository: Arc<FlagRepository>) -> DynamicApi {
        DynamicApi { flag_repository }
    }

    pub fn is_enabled(&self, name: &str, default_value: bool, context: Option<&Context>) -> bool {
        let flag = match self.flag_repository.flag(name) {
            Some(flag) => flag,
            None => match self.flag_repository.add_flag(Variant::flag(default_value), name) {
                Ok(flag) => flag,
                Err(_) => return default_value,
            },
        };
        flag.get_bool(Some(default_value), &EvalContext::new(Some(&flag), context))
    }

    pub fn value(
        &self,
        name: &str,
        default_value: &str,
        options: &[&str],
        context: Option<&Context>,
    ) -> String {
        let flag = match self.flag_repository.flag(name) {
            Some(flag) => flag,
            None => match self
                .flag_repository
                .add_flag(Variant::string(default_value, options), name)
            {
                Ok(flag) => flag,
                Err(_) => return default_value.to_string(),
            },
        };
        flag.get_string(Some(default_value), &EvalContext::new(Some(&flag), context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buid_fingerprint() {
        let mut map = HashMap::new();
        map.insert("app_key".to_string(), "123".to_string());
        map.insert("api_version".to_string(), "4.0.0".to_string());
        map.insert("platform".to_string(), "plat".to_string());
        map.insert("lib_version".to_string(), "1.5.0".to_string());
        let properties = DeviceProperties::from_map(map);
        let buid = Buid::from_device_properties(&properties);
        assert_eq!(buid.value(), "234A32BB4341EAFD91FC8D0395F4E66F");
    }

    #[test]
    fn test_fingerprint_skips_missing_properties() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), "1".to_string());
        map.insert("b".to_string(), "2".to_string());
        assert_eq!(
            generate_fingerprint(&map, &["a", "missing", "b"]),
            generate_fingerprint(&map, &["a", "b"]),
        );
    }

    #[test]
    fn test_distinct_id_is_process_stable() {
        let settings = SdkSettings::new("abc", "secret");
        let properties = DeviceProperties::new(&settings, "1.0");
        assert!(!properties.distinct_id().is_empty());
        assert_eq!(
            properties.all_properties().get("distinct_id"),
            Some(&properties.distinct_id().to_string())
        );
    }
}
