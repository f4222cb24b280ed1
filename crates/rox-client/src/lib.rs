//! # rox-client
//!
//! Core client for a remote feature-flag and experimentation service.
//!
//! The client maintains a registry of typed flags whose values are derived at
//! runtime from a remote configuration of experiments and target groups,
//! fetches and validates that configuration over a CDN → API fallback chain
//! (or a single Roxy side-car endpoint), evaluates experiment conditions
//! through a small stack-based expression language with pluggable operators,
//! and dispatches impression and device-state reporting events.
//!
//! ## Core features
//!
//! - **Typed flags** — boolean, string, int and double flags with defaults
//!   and option lists, bound to their governing experiment whenever a new
//!   configuration is applied.
//! - **Expression language** — prefix-notation conditions (`and`, `eq`,
//!   `ifThen`, `inArray`, `isInPercentage`, `property`, `flagValue`, …)
//!   reduced on an evaluation stack; faults degrade to the flag default.
//! - **Configuration pipeline** — signature and application-key verification,
//!   structural change detection, throttled refetches, periodic refresh and
//!   push-driven updates over server-sent events.
//! - **Reporting** — impressions fan out to registered handlers and the
//!   built-in analytics sink; a debounced state sender fingerprints the
//!   declared flags and custom properties.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rox_client::{Rox, RoxOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Rox::setup("5e579ecfc45c395c43b42893", RoxOptions::default())
//!         .await
//!         .unwrap();
//!     client.add_flag("new-dashboard", false).unwrap();
//!     if client.is_enabled("new-dashboard") {
//!         // roll out the new dashboard
//!     }
//! }
//! ```
//!
//! The base-URL set is selected by the `ROLLOUT_MODE` environment variable
//! (`LOCAL`, `QA`, unset for production) and can be overridden wholesale
//! through [`RoxOptions::with_environment`] for self-managed deployments.

pub mod core;
pub mod error;
pub mod eval;
pub mod model;
pub mod network;

use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::core::client::{DynamicApi, SdkSettings};
use crate::core::configuration::ConfigurationFetchedHandler;
use crate::core::consts::Environment;
use crate::core::entities::Variant;
use crate::core::impression::ImpressionHandler;
use crate::core::orchestrator::RoxCore;
use crate::core::properties::DynamicPropertiesRule;
use crate::core::security::SignatureVerifier;

pub use crate::core::configuration::{
    ConfigurationFetchedArgs, ConfigurationSource, ExperimentModel, FetchStatus, TargetGroupModel,
};
pub use crate::core::consts::Environment as RoxEnvironment;
pub use crate::core::entities::{EvaluationInterceptor, FlagKind};
pub use crate::core::impression::{Experiment, ReportingValue};
pub use crate::core::properties::{CustomProperty, CustomPropertyType};
pub use crate::error::{FetcherError, RoxError};
pub use crate::eval::{EvalContext, EvaluationResult, Parser};
pub use crate::model::{Context, DynamicValue};

/// Client lifecycle states; negative codes are setup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StateCode {
    ErrorSetupFailed = -2,
    ErrorInvalidApiKey = -1,
    Uninitialized = 0,
    SettingUp = 1,
    Initialized = 2,
    ShuttingDown = 3,
}

impl StateCode {
    pub(crate) fn from_code(code: i32) -> StateCode {
        match code {
            -2 => StateCode::ErrorSetupFailed,
            -1 => StateCode::ErrorInvalidApiKey,
            1 => StateCode::SettingUp,
            2 => StateCode::Initialized,
            3 => StateCode::ShuttingDown,
            _ => StateCode::Uninitialized,
        }
    }
}

/// Constructor options for the client, builder style. Defaults: version
/// `0.0`, a 60-second fetch interval (floored at 30, `0` disables the
/// periodic task), production endpoints per `ROLLOUT_MODE`.
pub struct RoxOptions {
    pub(crate) version: String,
    pub(crate) dev_mode_key: String,
    pub(crate) fetch_interval: u64,
    pub(crate) roxy_url: Option<String>,
    pub(crate) environment: Option<Environment>,
    pub(crate) impression_handler: Option<ImpressionHandler>,
    pub(crate) configuration_fetched_handler: Option<ConfigurationFetchedHandler>,
    pub(crate) dynamic_properties_rule: Option<DynamicPropertiesRule>,
}

impl Default for RoxOptions {
    fn default() -> RoxOptions {
        RoxOptions {
            version: "0.0".to_string(),
            dev_mode_key: "stam".to_string(),
            fetch_interval: 60,
            roxy_url: None,
            environment: None,
            impression_handler: None,
            configuration_fetched_handler: None,
            dynamic_properties_rule: None,
        }
    }
}

impl RoxOptions {
    pub fn with_version(mut self, version: impl Into<String>) -> RoxOptions {
        self.version = version.into();
        self
    }

    pub fn with_dev_mode_key(mut self, dev_mode_key: impl Into<String>) -> RoxOptions {
        self.dev_mode_key = dev_mode_key.into();
        self
    }

    /// Seconds between scheduled fetches; values below 30 are raised to 30,
    /// `0` disables the periodic task.
    pub fn with_fetch_interval(mut self, fetch_interval: u64) -> RoxOptions {
        self.fetch_interval = if fetch_interval == 0 {
            0
        } else {
            fetch_interval.max(30)
        };
        self
    }

    /// Routes all configuration fetches through a Roxy side-car.
    pub fn with_roxy_url(mut self, roxy_url: impl Into<String>) -> RoxOptions {
        self.roxy_url = Some(roxy_url.into());
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> RoxOptions {
        self.environment = Some(environment);
        self
    }

    pub fn with_impression_handler(mut self, handler: ImpressionHandler) -> RoxOptions {
        self.impression_handler = Some(handler);
        self
    }

    pub fn with_configuration_fetched_handler(
        mut self,
        handler: ConfigurationFetchedHandler,
    ) -> RoxOptions {
        self.configuration_fetched_handler = Some(handler);
        self
    }

    pub fn with_dynamic_properties_rule(mut self, rule: DynamicPropertiesRule) -> RoxOptions {
        self.dynamic_properties_rule = Some(rule);
        self
    }
}

/// Instance handle over the SDK core. The process-wide default instance in
/// [`global`] wraps one of these.
#[derive(Clone)]
pub struct Rox {
    core: Arc<RoxCore>,
}

impl Rox {
    pub async fn setup(api_key: &str, options: RoxOptions) -> Result<Rox, RoxError> {
        let sdk_settings = SdkSettings::new(api_key, options.dev_mode_key.clone());
        let core = RoxCore::setup(sdk_settings, options).await?;
        Ok(Rox { core })
    }

    /// Setup with a custom signature verifier, for deployments that pin
    /// their own configuration-signing key.
    pub async fn setup_with_signature_verifier(
        api_key: &str,
        options: RoxOptions,
        signature_verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Rox, RoxError> {
        let sdk_settings = SdkSettings::new(api_key, options.dev_mode_key.clone());
        let core = RoxCore::setup_with_verifier(sdk_settings, options, signature_verifier).await?;
        Ok(Rox { core })
    }

    pub fn state(&self) -> StateCode {
        self.core.state()
    }

    pub fn add_flag(&self, name: &str, default_value: bool) -> Result<(), RoxError> {
        self.core.add_flag(Variant::flag(default_value), name).map(|_| ())
    }

    pub fn add_string(
        &self,
        name: &str,
        default_value: &str,
        options: &[&str],
    ) -> Result<(), RoxError> {
        self.core
            .add_flag(Variant::string(default_value, options), name)
            .map(|_| ())
    }

    pub fn add_int(&self, name: &str, default_value: i64, options: &[i64]) -> Result<(), RoxError> {
        self.core
            .add_flag(Variant::int(default_value, options), name)
            .map(|_| ())
    }

    pub fn add_double(
        &self,
        name: &str,
        default_value: f64,
        options: &[f64],
    ) -> Result<(), RoxError> {
        self.core
            .add_flag(Variant::double(default_value, options), name)
            .map(|_| ())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.is_enabled_ctx(name, None)
    }

    pub fn is_enabled_ctx(&self, name: &str, context: Option<&Context>) -> bool {
        self.core
            .evaluate_flag(name, context, |flag, eval| flag.is_enabled(eval))
            .unwrap_or(false)
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get_string_ctx(name, None)
    }

    pub fn get_string_ctx(&self, name: &str, context: Option<&Context>) -> Option<String> {
        self.core
            .evaluate_flag(name, context, |flag, eval| flag.get_string(None, eval))
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get_int_ctx(name, None)
    }

    pub fn get_int_ctx(&self, name: &str, context: Option<&Context>) -> Option<i64> {
        self.core
            .evaluate_flag(name, context, |flag, eval| flag.get_int(None, eval))
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        self.get_double_ctx(name, None)
    }

    pub fn get_double_ctx(&self, name: &str, context: Option<&Context>) -> Option<f64> {
        self.core
            .evaluate_flag(name, context, |flag, eval| flag.get_double(None, eval))
    }

    pub fn set_custom_property(&self, property: CustomProperty) {
        self.core.add_custom_property(property);
    }

    pub fn set_custom_property_if_not_exists(&self, property: CustomProperty) {
        self.core.add_custom_property_if_not_exists(property);
    }

    pub async fn fetch(&self) {
        self.core.fetch(false).await;
    }

    pub fn set_context(&self, context: Context) {
        self.core.set_context(context);
    }

    pub fn dynamic_api(&self) -> DynamicApi {
        self.core.create_dynamic_api()
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }

    /// The underlying core, for advanced wiring and tests.
    pub fn core(&self) -> &Arc<RoxCore> {
        &self.core
    }
}

static DEFAULT_CLIENT: Lazy<RwLock<Option<Rox>>> = Lazy::new(|| RwLock::new(None));

/// Process-wide default instance with an explicit setup/shutdown lifecycle.
/// All calls before `setup` (or after `shutdown`) fall back to defaults.
pub mod global {
    use super::*;

    pub async fn setup(api_key: &str, options: RoxOptions) -> StateCode {
        match Rox::setup(api_key, options).await {
            Ok(client) => {
                let state = client.state();
                *DEFAULT_CLIENT
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(client);
                state
            }
            Err(RoxError::InvalidApiKey(_)) => StateCode::ErrorInvalidApiKey,
            Err(_) => StateCode::ErrorSetupFailed,
        }
    }

    pub async fn shutdown() {
        let client = DEFAULT_CLIENT
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = client {
            client.shutdown().await;
        }
    }

    fn client() -> Option<Rox> {
        DEFAULT_CLIENT
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state() -> StateCode {
        client()
            .map(|client| client.state())
            .unwrap_or(StateCode::Uninitialized)
    }

    pub fn add_flag(name: &str, default_value: bool) -> Result<(), RoxError> {
        match client() {
            Some(client) => client.add_flag(name, default_value),
            None => Err(RoxError::Setup("client is not set up".into())),
        }
    }

    pub fn is_enabled(name: &str) -> bool {
        client().map(|client| client.is_enabled(name)).unwrap_or(false)
    }

    pub fn get_string(name: &str) -> Option<String> {
        client().and_then(|client| client.get_string(name))
    }

    pub async fn fetch() {
        if let Some(client) = client() {
            client.fetch().await;
        }
    }
}
