use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::Client;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, instrument};

use crate::core::client::{DeviceProperties, generate_fingerprint};
use crate::core::consts::{Environment, property_type};
use crate::core::repositories::{CustomPropertyRepository, FlagRepository};

/// Collapses bursts of invocations into one delayed action. The first
/// invocation opens a window; further invocations inside it are absorbed; an
/// invocation after the window fires a new delayed action. Shutdown wakes
/// the worker and joins it.
pub struct Debouncer {
    signal: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new<F, Fut>(interval: Duration, action: F) -> Debouncer
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (signal, mut receiver) = mpsc::channel::<()>(1);
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = receiver.recv() => {
                        if received.is_none() {
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {
                                // Invocations that landed inside the window
                                // collapse into this run.
                                while receiver.try_recv().is_ok() {}
                                action().await;
                            }
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        Debouncer {
            signal,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn invoke(&self) {
        let _ = self.signal.try_send(());
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// Submits the device state fingerprint (declared flags plus custom
/// properties) to the state CDN, falling back to the state API on a cache
/// miss. Sends are debounced over flag and custom-property additions; a
/// failed send is not retried, the next change covers it.
pub struct StateSender {
    http: Client,
    environment: Environment,
    device_properties: Arc<DeviceProperties>,
    flag_repository: Arc<FlagRepository>,
    custom_property_repository: Arc<CustomPropertyRepository>,
    debouncer: Debouncer,
}

const STATE_GENERATORS: &[&str] = &[
    property_type::PLATFORM,
    property_type::APP_KEY,
    property_type::CUSTOM_PROPERTIES,
    property_type::FEATURE_FLAGS,
    property_type::REMOTE_VARIABLES,
    property_type::DEV_MODE_SECRET,
];

const RELEVANT_API_CALL_PARAMS: &[&str] = &[
    property_type::PLATFORM,
    property_type::CUSTOM_PROPERTIES,
    property_type::FEATURE_FLAGS,
    property_type::REMOTE_VARIABLES,
    property_type::DEV_MODE_SECRET,
];

impl StateSender {
    pub fn new(
        http: Client,
        environment: Environment,
        device_properties: Arc<DeviceProperties>,
        flag_repository: Arc<FlagRepository>,
        custom_property_repository: Arc<CustomPropertyRepository>,
    ) -> Arc<StateSender> {
        let sender = Arc::new_cyclic(|weak: &std::sync::Weak<StateSender>| {
            let debounced = weak.clone();
            StateSender {
                http,
                environment,
                device_properties,
                flag_repository: flag_repository.clone(),
                custom_property_repository: custom_property_repository.clone(),
                debouncer: Debouncer::new(Duration::from_secs(3), move || {
                    let debounced = debounced.clone();
                    async move {
                        if let Some(sender) = debounced.upgrade() {
                            sender.send().await;
                        }
                    }
                }),
            }
        });

        let on_flag_added = Arc::downgrade(&sender);
        flag_repository.add_flag_added_callback(Box::new(move |_variant| {
            if let Some(sender) = on_flag_added.upgrade() {
                sender.schedule_send();
            }
        }));
        let on_property_added = Arc::downgrade(&sender);
        custom_property_repository.set_handler(Box::new(move |_property| {
            if let Some(sender) = on_property_added.upgrade() {
                sender.schedule_send();
            }
        }));

        sender
    }

    pub fn schedule_send(&self) {
        self.debouncer.invoke();
    }

    pub async fn shutdown(&self) {
        self.debouncer.shutdown().await;
    }

    /// Flags sorted by name so the fingerprint is independent of
    /// registration order.
    fn serialize_feature_flags(&self) -> String {
        let mut flags = self.flag_repository.all_flags();
        flags.sort_by_key(|flag| flag.name().unwrap_or_default());
        let entries: Vec<serde_json::Value> = flags
            .iter()
            .map(|flag| {
                json!({
                    "name": flag.name().unwrap_or_default(),
                    "defaultValue": flag.default_value(),
                    "options": flag.options(),
                })
            })
            .collect();
        serde_json::Value::Array(entries).to_string()
    }

    fn serialize_custom_properties(&self) -> String {
        let mut properties = self.custom_property_repository.all_custom_properties();
        properties.sort_by(|a, b| a.name().cmp(b.name()));
        let entries: Vec<serde_json::Value> =
            properties.iter().map(|property| property.to_json()).collect();
        serde_json::Value::Array(entries).to_string()
    }

    fn state_properties(&self) -> HashMap<String, String> {
        let mut properties = self.device_properties.all_properties().clone();
        properties.insert(
            property_type::FEATURE_FLAGS.to_string(),
            self.serialize_feature_flags(),
        );
        properties.insert(
            property_type::REMOTE_VARIABLES.to_string(),
            "[]".to_string(),
        );
        properties.insert(
            property_type::CUSTOM_PROPERTIES.to_string(),
            self.serialize_custom_properties(),
        );
        let state_md5 = generate_fingerprint(&properties, STATE_GENERATORS);
        properties.insert(property_type::STATE_MD5.to_string(), state_md5);
        properties
    }

    #[instrument(skip(self))]
    pub async fn send(&self) {
        let properties = self.state_properties();
        let app_key = self.device_properties.rollout_key();
        let state_md5 = properties
            .get(property_type::STATE_MD5)
            .cloned()
            .unwrap_or_default();

        let cdn_url = format!("{}/{}/{}", self.environment.state_cdn, app_key, state_md5);
        let response = match self.http.get(&cdn_url).send().await {
            Ok(response) => response,
            Err(transport_error) => {
                error!(%transport_error, "failed to send state to CDN");
                return;
            }
        };

        let status = response.status();
        let mut cache_miss = false;
        if status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&body) {
                if parsed.get("result").and_then(|v| v.as_i64()) == Some(404) {
                    cache_miss = true;
                }
            }
            if !cache_miss {
                debug!("state submitted via CDN");
                return;
            }
        }

        if cache_miss || status.as_u16() == 403 || status.as_u16() == 404 {
            debug!(status = status.as_u16(), "state not on CDN, posting to API");
            let api_url = format!("{}/{}/{}", self.environment.state_api, app_key, state_md5);
            let mut form = HashMap::new();
            for name in RELEVANT_API_CALL_PARAMS {
                if let Some(value) = properties.get(*name) {
                    form.insert(*name, value.clone());
                }
            }
            match self.http.post(&api_url).form(&form).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("state submitted via API");
                }
                Ok(response) => {
                    error!(status = response.status().as_u16(), "failed to send state to API");
                }
                Err(transport_error) => {
                    error!(%transport_error, "failed to send state to API");
                }
            }
            return;
        }

        error!(status = status.as_u16(), "failed to send state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::SdkSettings;
    use crate::core::entities::Variant;
    use crate::core::properties::{CustomProperty, CustomPropertyType};
    use crate::model::DynamicValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sender_with(
        flag_names: &[&str],
        property_names: &[&str],
    ) -> Arc<StateSender> {
        let flags = Arc::new(FlagRepository::new());
        let properties = Arc::new(CustomPropertyRepository::new());
        for name in flag_names {
            flags.add_flag(Variant::flag(false), name).unwrap();
        }
        for name in property_names {
            properties.add_custom_property(CustomProperty::new(
                *name,
                CustomPropertyType::String,
                DynamicValue::String("v".into()),
            ));
        }
        let settings = SdkSettings::new("5e579ecfc45c395c43b42893", "stam");
        StateSender::new(
            Client::new(),
            Environment::production(),
            Arc::new(DeviceProperties::new(&settings, "1.0")),
            flags,
            properties,
        )
    }

    #[tokio::test]
    async fn test_state_fingerprint_is_insertion_order_independent() {
        let first = sender_with(&["a", "b", "c"], &["p1", "p2"]);
        let second = sender_with(&["c", "a", "b"], &["p2", "p1"]);
        let md5_of = |sender: &Arc<StateSender>| {
            sender
                .state_properties()
                .get(property_type::STATE_MD5)
                .cloned()
                .unwrap()
        };
        assert_eq!(md5_of(&first), md5_of(&second));
    }

    #[tokio::test]
    async fn test_state_fingerprint_changes_with_flags() {
        let first = sender_with(&["a"], &[]);
        let second = sender_with(&["a", "b"], &[]);
        assert_ne!(
            first.state_properties().get(property_type::STATE_MD5),
            second.state_properties().get(property_type::STATE_MD5),
        );
    }

    #[tokio::test]
    async fn test_debouncer_collapses_burst_into_one_action() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let debouncer = Debouncer::new(Duration::from_millis(100), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        for _ in 0..5 {
            debouncer.invoke();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A late invocation after the window fires a new delayed action.
        debouncer.invoke();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        debouncer.shutdown().await;
    }

    #[tokio::test]
    async fn test_debouncer_shutdown_wakes_worker() {
        let debouncer = Debouncer::new(Duration::from_secs(3600), || async {});
        debouncer.invoke();
        // Returns promptly even though the window is an hour long.
        debouncer.shutdown().await;
    }
}
