use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::configuration::{ExperimentModel, TargetGroupModel};
use crate::core::entities::Variant;
use crate::core::properties::CustomProperty;
use crate::error::RoxError;

pub type FlagAddedCallback = Box<dyn Fn(&Arc<Variant>) + Send + Sync>;

/// Registry of flags keyed by name. Observers are notified on every add so
/// the flag setter and the state sender can react to late registrations.
pub struct FlagRepository {
    flags: RwLock<HashMap<String, Arc<Variant>>>,
    callbacks: RwLock<Vec<FlagAddedCallback>>,
}

impl FlagRepository {
    pub fn new() -> FlagRepository {
        FlagRepository {
            flags: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_flag(&self, variant: Variant, name: &str) -> Result<Arc<Variant>, RoxError> {
        variant.set_name(name);
        let variant = Arc::new(variant);
        {
            let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
            if flags.contains_key(name) {
                return Err(RoxError::FlagAlreadyRegistered(name.to_string()));
            }
            flags.insert(name.to_string(), variant.clone());
        }
        for callback in self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(&variant);
        }
        Ok(variant)
    }

    pub fn flag(&self, name: &str) -> Option<Arc<Variant>> {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn all_flags(&self) -> Vec<Arc<Variant>> {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn add_flag_added_callback(&self, callback: FlagAddedCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

impl Default for FlagRepository {
    fn default() -> FlagRepository {
        FlagRepository::new()
    }
}

/// Experiments are replaced atomically on configuration apply; readers hold
/// the previous snapshot until they drop it.
pub struct ExperimentRepository {
    experiments: RwLock<Arc<Vec<Arc<ExperimentModel>>>>,
}

impl ExperimentRepository {
    pub fn new() -> ExperimentRepository {
        ExperimentRepository {
            experiments: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn set_experiments(&self, experiments: Vec<ExperimentModel>) {
        let snapshot = Arc::new(experiments.into_iter().map(Arc::new).collect::<Vec<_>>());
        *self
            .experiments
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn all_experiments(&self) -> Arc<Vec<Arc<ExperimentModel>>> {
        self.experiments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First experiment whose flag list contains the given name.
    pub fn experiment_by_flag(&self, flag_name: &str) -> Option<Arc<ExperimentModel>> {
        self.all_experiments()
            .iter()
            .find(|experiment| experiment.flags.iter().any(|name| name == flag_name))
            .cloned()
    }
}

impl Default for ExperimentRepository {
    fn default() -> ExperimentRepository {
        ExperimentRepository::new()
    }
}

pub struct TargetGroupRepository {
    target_groups: RwLock<Arc<Vec<Arc<TargetGroupModel>>>>,
}

impl TargetGroupRepository {
    pub fn new() -> TargetGroupRepository {
        TargetGroupRepository {
            target_groups: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn set_target_groups(&self, target_groups: Vec<TargetGroupModel>) {
        let snapshot = Arc::new(target_groups.into_iter().map(Arc::new).collect::<Vec<_>>());
        *self
            .target_groups
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn target_group(&self, identifier: &str) -> Option<Arc<TargetGroupModel>> {
        self.target_groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|group| group.identifier == identifier)
            .cloned()
    }
}

impl Default for TargetGroupRepository {
    fn default() -> TargetGroupRepository {
        TargetGroupRepository::new()
    }
}

pub type CustomPropertyHandler = Box<dyn Fn(&Arc<CustomProperty>) + Send + Sync>;

pub struct CustomPropertyRepository {
    properties: RwLock<HashMap<String, Arc<CustomProperty>>>,
    handler: RwLock<Option<CustomPropertyHandler>>,
}

impl CustomPropertyRepository {
    pub fn new() -> CustomPropertyRepository {
        CustomPropertyRepository {
            properties: RwLock::new(HashMap::new()),
            handler: RwLock::new(None),
        }
    }

    pub fn add_custom_property(&self, property: CustomProperty) {
        let property = Arc::new(property);
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(property.name().to_string(), property.clone());
        self.notify(&property);
    }

    /// Preserves the first-added property under a given name.
    pub fn add_custom_property_if_not_exists(&self, property: CustomProperty) {
        let property = Arc::new(property);
        let added = {
            let mut properties = self
                .properties
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if properties.contains_key(property.name()) {
                false
            } else {
                properties.insert(property.name().to_string(), property.clone());
                true
            }
        };
        if added {
            self.notify(&property);
        }
    }

    pub fn custom_property(&self, name: &str) -> Option<Arc<CustomProperty>> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn all_custom_properties(&self) -> Vec<Arc<CustomProperty>> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn set_handler(&self, handler: CustomPropertyHandler) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn notify(&self, property: &Arc<CustomProperty>) {
        if let Some(handler) = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            handler(property);
        }
    }
}

impl Default for CustomPropertyRepository {
    fn default() -> CustomPropertyRepository {
        CustomPropertyRepository::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::properties::CustomPropertyType;
    use crate::model::DynamicValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_add_flag_twice_is_an_error() {
        let repository = FlagRepository::new();
        repository.add_flag(Variant::flag(false), "f1").unwrap();
        let result = repository.add_flag(Variant::flag(true), "f1");
        assert!(matches!(result, Err(RoxError::FlagAlreadyRegistered(_))));
    }

    #[test]
    fn test_flag_added_callback_fires() {
        let repository = FlagRepository::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        repository.add_flag_added_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        repository.add_flag(Variant::flag(false), "f1").unwrap();
        repository.add_flag(Variant::flag(false), "f2").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_experiment_lookup_by_flag_is_first_match() {
        let repository = ExperimentRepository::new();
        repository.set_experiments(vec![
            ExperimentModel::new("1", "first", "true", false, vec!["f1".into()], Default::default(), None),
            ExperimentModel::new("2", "second", "false", false, vec!["f1".into(), "f2".into()], Default::default(), None),
        ]);
        assert_eq!(repository.experiment_by_flag("f1").unwrap().name, "first");
        assert_eq!(repository.experiment_by_flag("f2").unwrap().name, "second");
        assert!(repository.experiment_by_flag("f3").is_none());
    }

    #[test]
    fn test_set_experiments_replaces_atomically() {
        let repository = ExperimentRepository::new();
        repository.set_experiments(vec![ExperimentModel::new(
            "1",
            "one",
            "true",
            false,
            vec!["f1".into()],
            Default::default(),
            None,
        )]);
        let snapshot = repository.all_experiments();
        repository.set_experiments(vec![]);
        // The pre-replacement snapshot stays intact for its holder.
        assert_eq!(snapshot.len(), 1);
        assert!(repository.all_experiments().is_empty());
    }

    #[test]
    fn test_add_if_not_exists_preserves_first() {
        let repository = CustomPropertyRepository::new();
        repository.add_custom_property_if_not_exists(CustomProperty::new(
            "p",
            CustomPropertyType::String,
            DynamicValue::String("first".into()),
        ));
        repository.add_custom_property_if_not_exists(CustomProperty::new(
            "p",
            CustomPropertyType::String,
            DynamicValue::String("second".into()),
        ));
        let property = repository.custom_property("p").unwrap();
        assert_eq!(property.value(None), DynamicValue::String("first".into()));
    }
}
