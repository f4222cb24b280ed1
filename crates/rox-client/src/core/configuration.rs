use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

use crate::core::security::{ApiKeyVerifier, SignatureVerifier};
use crate::error::FetcherError;

/// A named condition plus metadata bound to one or more flags. Immutable
/// after creation; installed copies are what the repositories hand out.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentModel {
    pub identifier: String,
    pub name: String,
    pub condition: String,
    pub archived: bool,
    pub flags: Vec<String>,
    pub labels: BTreeSet<String>,
    pub stickiness_property: Option<String>,
}

impl ExperimentModel {
    pub fn new(
        identifier: impl Into<String>,
        name: impl Into<String>,
        condition: impl Into<String>,
        archived: bool,
        flags: Vec<String>,
        labels: BTreeSet<String>,
        stickiness_property: Option<String>,
    ) -> ExperimentModel {
        ExperimentModel {
            identifier: identifier.into(),
            name: name.into(),
            condition: condition.into(),
            archived,
            flags,
            labels,
            stickiness_property,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroupModel {
    pub identifier: String,
    pub condition: String,
}

impl TargetGroupModel {
    pub fn new(identifier: impl Into<String>, condition: impl Into<String>) -> TargetGroupModel {
        TargetGroupModel {
            identifier: identifier.into(),
            condition: condition.into(),
        }
    }
}

/// Decoded remote configuration. Equality is structural over all three
/// fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub experiments: Vec<ExperimentModel>,
    pub target_groups: Vec<TargetGroupModel>,
    pub signature_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationSource {
    Cdn,
    Api,
    Roxy,
    Url,
}

impl fmt::Display for ConfigurationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConfigurationSource::Cdn => "CDN",
            ConfigurationSource::Api => "API",
            ConfigurationSource::Roxy => "ROXY",
            ConfigurationSource::Url => "URL",
        };
        f.write_str(label)
    }
}

/// A successfully retrieved configuration envelope plus where it came from.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub data: serde_json::Value,
    pub source: ConfigurationSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    AppliedFromNetwork,
    ErrorFetchedFailed,
}

#[derive(Debug, Clone)]
pub struct ConfigurationFetchedArgs {
    pub fetcher_status: FetchStatus,
    pub creation_date: Option<String>,
    pub has_changes: bool,
    pub error_details: FetcherError,
}

impl ConfigurationFetchedArgs {
    pub fn applied(creation_date: impl Into<String>, has_changes: bool) -> ConfigurationFetchedArgs {
        ConfigurationFetchedArgs {
            fetcher_status: FetchStatus::AppliedFromNetwork,
            creation_date: Some(creation_date.into()),
            has_changes,
            error_details: FetcherError::NoError,
        }
    }

    pub fn error(error_details: FetcherError) -> ConfigurationFetchedArgs {
        ConfigurationFetchedArgs {
            fetcher_status: FetchStatus::ErrorFetchedFailed,
            creation_date: None,
            has_changes: false,
            error_details,
        }
    }
}

pub type ConfigurationFetchedHandler = Box<dyn Fn(&ConfigurationFetchedArgs) + Send + Sync>;

/// Fans configuration-fetched events to registered handlers in registration
/// order.
pub struct ConfigurationFetchedInvoker {
    handlers: RwLock<Vec<ConfigurationFetchedHandler>>,
}

impl ConfigurationFetchedInvoker {
    pub fn new() -> ConfigurationFetchedInvoker {
        ConfigurationFetchedInvoker {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register_handler(&self, handler: ConfigurationFetchedHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn invoke(&self, args: ConfigurationFetchedArgs) {
        for handler in self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handler(&args);
        }
    }

    pub fn invoke_error(&self, error_details: FetcherError) {
        self.invoke(ConfigurationFetchedArgs::error(error_details));
    }
}

impl Default for ConfigurationFetchedInvoker {
    fn default() -> ConfigurationFetchedInvoker {
        ConfigurationFetchedInvoker::new()
    }
}

/// Validates and decodes a fetched envelope into a `Configuration`,
/// reporting failures through the configuration-fetched invoker.
pub struct ConfigurationParser {
    signature_verifier: Arc<dyn SignatureVerifier>,
    api_key_verifier: ApiKeyVerifier,
    invoker: Arc<ConfigurationFetchedInvoker>,
}

impl ConfigurationParser {
    pub fn new(
        signature_verifier: Arc<dyn SignatureVerifier>,
        api_key_verifier: ApiKeyVerifier,
        invoker: Arc<ConfigurationFetchedInvoker>,
    ) -> ConfigurationParser {
        ConfigurationParser {
            signature_verifier,
            api_key_verifier,
            invoker,
        }
    }

    pub fn parse(&self, fetch_result: &FetchResult) -> Option<Configuration> {
        let envelope = &fetch_result.data;
        let data = envelope.get("data").and_then(|v| v.as_str()).unwrap_or("");
        let signed_date = envelope
            .get("signed_date")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if data.is_empty() || signed_date.is_empty() {
            error!("failed to parse configuration: \"data\" or \"signed_date\" is empty");
            self.invoker.invoke_error(FetcherError::UnknownError);
            return None;
        }

        let signature = envelope
            .get("signature_v0")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if signature.is_empty() || !self.signature_verifier.verify(data, signature) {
            error!("failed to validate configuration signature");
            self.invoker
                .invoke_error(FetcherError::SignatureVerificationError);
            return None;
        }

        let inner: serde_json::Value = match serde_json::from_str(data) {
            Ok(inner) => inner,
            Err(parse_error) => {
                error!(%parse_error, "configuration data is not valid JSON");
                self.invoker.invoke_error(FetcherError::CorruptedJson);
                return None;
            }
        };

        let application = inner
            .get("application")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if application.is_empty() || !self.api_key_verifier.verify(application) {
            error!(
                application,
                "configuration \"application\" does not match the configured API key"
            );
            self.invoker.invoke_error(FetcherError::MismatchAppKey);
            return None;
        }

        let experiments = self.parse_experiments(&inner);
        let target_groups = self.parse_target_groups(&inner);
        match (experiments, target_groups) {
            (Some(experiments), Some(target_groups)) => Some(Configuration {
                experiments,
                target_groups,
                signature_date: signed_date.to_string(),
            }),
            _ => {
                error!("failed to parse configuration models");
                self.invoker.invoke_error(FetcherError::UnknownError);
                None
            }
        }
    }

    fn parse_experiments(&self, inner: &serde_json::Value) -> Option<Vec<ExperimentModel>> {
        let experiments = inner.get("experiments")?.as_array()?;
        let mut models = Vec::with_capacity(experiments.len());
        for experiment in experiments {
            let identifier = experiment.get("_id").and_then(|v| v.as_str()).unwrap_or("");
            let name = experiment.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let condition = experiment
                .get("deploymentConfiguration")
                .and_then(|dc| dc.get("condition"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if identifier.is_empty() || name.is_empty() || condition.is_empty() {
                error!(
                    "failed to parse configuration: one of \"_id\", \"name\", or \
                     \"deploymentConfiguration\".\"condition\" is empty"
                );
                return None;
            }

            let archived = experiment
                .get("archived")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let labels = experiment
                .get("labels")
                .and_then(|v| v.as_array())
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(|label| label.as_str())
                        .filter(|label| !label.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let flags = experiment
                .get("featureFlags")
                .and_then(|v| v.as_array())
                .map(|flags| {
                    flags
                        .iter()
                        .filter_map(|flag| flag.get("name").and_then(|n| n.as_str()))
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let stickiness_property = experiment
                .get("stickinessProperty")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            models.push(ExperimentModel::new(
                identifier,
                name,
                condition,
                archived,
                flags,
                labels,
                stickiness_property,
            ));
        }
        Some(models)
    }

    fn parse_target_groups(&self, inner: &serde_json::Value) -> Option<Vec<TargetGroupModel>> {
        let target_groups = inner.get("targetGroups")?.as_array()?;
        let mut models = Vec::with_capacity(target_groups.len());
        for group in target_groups {
            let identifier = group.get("_id").and_then(|v| v.as_str()).unwrap_or("");
            let condition = group.get("condition").and_then(|v| v.as_str()).unwrap_or("");
            if identifier.is_empty() || condition.is_empty() {
                error!("failed to parse target group: no id or condition");
                return None;
            }
            models.push(TargetGroupModel::new(identifier, condition));
        }
        Some(models)
    }
}
