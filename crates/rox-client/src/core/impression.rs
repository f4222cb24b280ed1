use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use crate::core::configuration::ExperimentModel;
use crate::model::Context;

/// The flag-name / stringified-value pair reported on every flag read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportingValue {
    pub name: String,
    pub value: String,
    /// Whether an experiment governed the evaluation.
    pub targeting: bool,
}

/// Public snapshot of the experiment that governed an impression.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub identifier: String,
    pub archived: bool,
    pub labels: BTreeSet<String>,
    pub stickiness_property: Option<String>,
}

impl From<&ExperimentModel> for Experiment {
    fn from(model: &ExperimentModel) -> Experiment {
        Experiment {
            name: model.name.clone(),
            identifier: model.identifier.clone(),
            archived: model.archived,
            labels: model.labels.clone(),
            stickiness_property: model.stickiness_property.clone(),
        }
    }
}

pub type ImpressionHandler =
    Box<dyn Fn(&ReportingValue, Option<&Experiment>, Option<&Context>) + Send + Sync>;

/// Fans impressions to the optional delegate (the built-in analytics sink)
/// and then to each handler in registration order, on the evaluating thread.
/// Handlers that need async work must hand off internally.
pub struct ImpressionInvoker {
    delegate: RwLock<Option<ImpressionHandler>>,
    handlers: RwLock<Vec<ImpressionHandler>>,
}

impl ImpressionInvoker {
    pub fn new() -> ImpressionInvoker {
        ImpressionInvoker {
            delegate: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn set_delegate(&self, delegate: ImpressionHandler) {
        *self.delegate.write().unwrap_or_else(PoisonError::into_inner) = Some(delegate);
    }

    pub fn register_handler(&self, handler: ImpressionHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn invoke(
        &self,
        reporting_value: &ReportingValue,
        experiment: Option<&ExperimentModel>,
        context: Option<&Context>,
    ) {
        let snapshot = experiment.map(Experiment::from);
        if let Some(delegate) = self
            .delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            delegate(reporting_value, snapshot.as_ref(), context);
        }
        for handler in self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handler(reporting_value, snapshot.as_ref(), context);
        }
    }
}

impl Default for ImpressionInvoker {
    fn default() -> ImpressionInvoker {
        ImpressionInvoker::new()
    }
}
