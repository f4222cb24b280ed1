use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, warn};

use crate::core::client::{Buid, DeviceProperties, DynamicApi, InternalFlags, SdkSettings};
use crate::core::configuration::{
    ConfigurationFetchedArgs, ConfigurationFetchedInvoker, ConfigurationParser,
};
use crate::core::consts::{Environment, ROX_PLATFORM};
use crate::core::entities::{FlagSetter, Variant};
use crate::core::impression::ImpressionInvoker;
use crate::core::properties::{CustomProperty, CustomPropertyType, DynamicProperties};
use crate::core::repositories::{
    CustomPropertyRepository, ExperimentRepository, FlagRepository, TargetGroupRepository,
};
use crate::core::security::{AcceptingSignatureVerifier, ApiKeyVerifier, SignatureVerifier};
use crate::error::RoxError;
use crate::eval::extensions;
use crate::eval::parser::{EvalContext, Parser};
use crate::model::{Context, DynamicValue};
use crate::network::analytics::{AnalyticsClient, AnalyticsEvent};
use crate::network::fetcher::ConfigurationFetcher;
use crate::network::notifications::NotificationListener;
use crate::network::state_sender::StateSender;
use crate::RoxOptions;
use crate::StateCode;

const THROTTLE_FETCH_FLAG: &str = "rox.internal.throttleFetchInSeconds";
const CONSIDER_THROTTLE_IN_PUSH_FLAG: &str = "rox.internal.considerThrottleInPush";
const PUSH_UPDATES_FLAG: &str = "rox.internal.pushUpdates";
const ANALYTICS_FLAG: &str = "rox.internal.analytics";

/// Fixed-interval timer driving the fetcher. Cancellation is cooperative:
/// stop signals the worker and joins it.
pub(crate) struct PeriodicTask {
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub(crate) fn spawn<F, Fut>(period: Duration, task: F) -> PeriodicTask
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(period) => task().await,
                }
            }
        });
        PeriodicTask {
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(crate) async fn stop(&self) {
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

/// Owns every subsystem, wires the callbacks between them, and exposes the
/// operations the public client surface delegates to.
pub struct RoxCore {
    sdk_settings: SdkSettings,
    device_properties: Arc<DeviceProperties>,
    buid: Buid,
    environment: Environment,

    flag_repository: Arc<FlagRepository>,
    custom_property_repository: Arc<CustomPropertyRepository>,
    experiment_repository: Arc<ExperimentRepository>,
    target_group_repository: Arc<TargetGroupRepository>,
    parser: Arc<Parser>,
    dynamic_properties: Arc<DynamicProperties>,
    impression_invoker: Arc<ImpressionInvoker>,
    configuration_fetched_invoker: Arc<ConfigurationFetchedInvoker>,
    internal_flags: Arc<InternalFlags>,
    flag_setter: Arc<FlagSetter>,
    configuration_parser: ConfigurationParser,
    configuration_fetcher: ConfigurationFetcher,
    state_sender: Option<Arc<StateSender>>,
    push_listener: tokio::sync::Mutex<Option<NotificationListener>>,
    periodic_task: Mutex<Option<PeriodicTask>>,

    fetch_lock: tokio::sync::Mutex<()>,
    last_fetch_millis: Mutex<f64>,
    last_envelope: Mutex<Option<serde_json::Value>>,
    stopped: AtomicBool,
    state: AtomicI32,
}

fn current_time_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as f64)
        .unwrap_or_default()
}

fn is_valid_api_key(api_key: &str) -> bool {
    Regex::new(r"^[a-f0-9]{24}$")
        .map(|pattern| pattern.is_match(api_key))
        .unwrap_or(false)
}

impl RoxCore {
    pub async fn setup(
        sdk_settings: SdkSettings,
        options: RoxOptions,
    ) -> Result<Arc<RoxCore>, RoxError> {
        RoxCore::setup_with_verifier(sdk_settings, options, Arc::new(AcceptingSignatureVerifier)).await
    }

    pub async fn setup_with_verifier(
        sdk_settings: SdkSettings,
        options: RoxOptions,
        signature_verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Arc<RoxCore>, RoxError> {
        if options.roxy_url.is_none() {
            if sdk_settings.api_key.is_empty() {
                error!("invalid API key - must be specified");
                return Err(RoxError::InvalidApiKey("must not be empty".into()));
            }
            if !is_valid_api_key(&sdk_settings.api_key) {
                error!(api_key = %sdk_settings.api_key, "illegal API key");
                return Err(RoxError::InvalidApiKey(sdk_settings.api_key.clone()));
            }
        }

        let environment = options
            .environment
            .clone()
            .unwrap_or_else(Environment::from_env);

        let flag_repository = Arc::new(FlagRepository::new());
        let custom_property_repository = Arc::new(CustomPropertyRepository::new());
        let experiment_repository = Arc::new(ExperimentRepository::new());
        let target_group_repository = Arc::new(TargetGroupRepository::new());
        let dynamic_properties = Arc::new(DynamicProperties::new());

        let mut parser = Parser::new();
        extensions::add_property_extensions(
            &mut parser,
            &custom_property_repository,
            &dynamic_properties,
        );
        extensions::add_experiment_extensions(
            &mut parser,
            &target_group_repository,
            &flag_repository,
            &experiment_repository,
        );
        let parser = Arc::new(parser);

        let impression_invoker = Arc::new(ImpressionInvoker::new());
        let configuration_fetched_invoker = Arc::new(ConfigurationFetchedInvoker::new());
        let internal_flags = Arc::new(InternalFlags::new(experiment_repository.clone(), &parser));
        let flag_setter = FlagSetter::new(
            &flag_repository,
            &parser,
            &experiment_repository,
            &impression_invoker,
        );

        let device_properties = Arc::new(DeviceProperties::new(&sdk_settings, &options.version));
        let buid = Buid::from_device_properties(&device_properties);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|build_error| RoxError::Setup(build_error.to_string()))?;

        let configuration_parser = ConfigurationParser::new(
            signature_verifier,
            ApiKeyVerifier::new(sdk_settings.clone()),
            configuration_fetched_invoker.clone(),
        );

        let (configuration_fetcher, state_sender) = match &options.roxy_url {
            Some(roxy_url) => (
                ConfigurationFetcher::new_roxy(
                    http.clone(),
                    environment.clone(),
                    device_properties.clone(),
                    buid.clone(),
                    configuration_fetched_invoker.clone(),
                    roxy_url.clone(),
                ),
                None,
            ),
            None => (
                ConfigurationFetcher::new(
                    http.clone(),
                    environment.clone(),
                    device_properties.clone(),
                    buid.clone(),
                    configuration_fetched_invoker.clone(),
                ),
                Some(StateSender::new(
                    http.clone(),
                    environment.clone(),
                    device_properties.clone(),
                    flag_repository.clone(),
                    custom_property_repository.clone(),
                )),
            ),
        };

        if options.roxy_url.is_none() {
            let analytics = Arc::new(AnalyticsClient::new(
                http.clone(),
                environment.analytics.clone(),
            ));
            let gate = internal_flags.clone();
            let properties = custom_property_repository.clone();
            impression_invoker.set_delegate(Box::new(move |value, experiment, context| {
                if !gate.is_enabled(ANALYTICS_FLAG) {
                    return;
                }
                let Some(experiment) = experiment else {
                    return;
                };
                let property = experiment
                    .stickiness_property
                    .as_deref()
                    .and_then(|name| properties.custom_property(name))
                    .or_else(|| properties.custom_property("rox.distinct_id"));
                let distinct_id = property
                    .map(|property| property.value(context))
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_else(|| "(null_distinct_id)".to_string());
                analytics.track(AnalyticsEvent::impression(
                    &value.name,
                    &value.value,
                    &distinct_id,
                    &experiment.identifier,
                ));
            }));
        }

        custom_property_repository.add_custom_property(CustomProperty::new(
            "rox.platform",
            CustomPropertyType::String,
            DynamicValue::String(ROX_PLATFORM.to_string()),
        ));
        custom_property_repository.add_custom_property(CustomProperty::new(
            "rox.app_release",
            CustomPropertyType::Semver,
            DynamicValue::String(options.version.clone()),
        ));
        custom_property_repository.add_custom_property(CustomProperty::new(
            "rox.distinct_id",
            CustomPropertyType::String,
            DynamicValue::String(device_properties.distinct_id().to_string()),
        ));

        if let Some(handler) = options.impression_handler {
            impression_invoker.register_handler(handler);
        }
        if let Some(handler) = options.configuration_fetched_handler {
            configuration_fetched_invoker.register_handler(handler);
        }
        if let Some(rule) = options.dynamic_properties_rule {
            dynamic_properties.set_rule(rule);
        }

        let core = Arc::new(RoxCore {
            sdk_settings,
            device_properties,
            buid,
            environment,
            flag_repository,
            custom_property_repository,
            experiment_repository,
            target_group_repository,
            parser,
            dynamic_properties,
            impression_invoker,
            configuration_fetched_invoker,
            internal_flags,
            flag_setter,
            configuration_parser,
            configuration_fetcher,
            state_sender,
            push_listener: tokio::sync::Mutex::new(None),
            periodic_task: Mutex::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
            last_fetch_millis: Mutex::new(0.0),
            last_envelope: Mutex::new(None),
            stopped: AtomicBool::new(false),
            state: AtomicI32::new(StateCode::SettingUp as i32),
        });

        core.fetch(false).await;

        if options.fetch_interval > 0 {
            let weak = Arc::downgrade(&core);
            let task = PeriodicTask::spawn(Duration::from_secs(options.fetch_interval), move || {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        core.fetch(true).await;
                    }
                }
            });
            *core
                .periodic_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(task);
        }

        if let Some(state_sender) = &core.state_sender {
            state_sender.schedule_send();
        }

        core.state
            .store(StateCode::Initialized as i32, Ordering::SeqCst);
        Ok(core)
    }

    pub fn state(&self) -> StateCode {
        StateCode::from_code(self.state.load(Ordering::SeqCst))
    }

    fn check_throttle_interval(&self, is_source_pushing: bool) -> bool {
        let Some(interval) = self.internal_flags.int_value(THROTTLE_FETCH_FLAG) else {
            return true;
        };
        if interval > 0
            && (!is_source_pushing || self.internal_flags.is_enabled(CONSIDER_THROTTLE_IN_PUSH_FLAG))
        {
            let mut last_fetch = self
                .last_fetch_millis
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = current_time_millis();
            if now < *last_fetch + (interval as f64) * 1000.0 {
                return false;
            }
            *last_fetch = now;
        }
        true
    }

    /// Serialized fetch: throttle, retrieve, diff, parse, apply.
    ///
    /// Repository writes and the flag-setter pass happen before the
    /// configuration-fetched event is dispatched.
    // Returns a boxed future (instead of `async fn`) because `fetch` can
    // re-enter itself indirectly through `sync_push_listener`'s spawned
    // push-event callback; rustc cannot prove the opaque recursive future
    // is `Send` without erasing the type here.
    pub fn fetch(self: &Arc<Self>, is_source_pushing: bool) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.fetch_lock.lock().await;

            if self.stopped.load(Ordering::SeqCst) {
                debug!("client is stopped, cancelling fetch");
                return;
            }

            if !self.check_throttle_interval(is_source_pushing) {
                warn!("skipping fetch - throttled");
                return;
            }

            let Some(result) = self.configuration_fetcher.fetch().await else {
                return;
            };

            let has_changes = {
                let mut last_envelope = self
                    .last_envelope
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let changed = last_envelope
                    .as_ref()
                    .map(|previous| previous != &result.data)
                    .unwrap_or(true);
                *last_envelope = Some(result.data.clone());
                changed
            };

            let Some(configuration) = self.configuration_parser.parse(&result) else {
                return;
            };

            self.experiment_repository
                .set_experiments(configuration.experiments.clone());
            self.target_group_repository
                .set_target_groups(configuration.target_groups.clone());
            self.flag_setter.set_experiments();
            self.configuration_fetched_invoker
                .invoke(ConfigurationFetchedArgs::applied(
                    configuration.signature_date.clone(),
                    has_changes,
                ));
            drop(_guard);

            self.sync_push_listener().await;
        })
    }

    /// Starts or stops the SSE listener according to the push-updates
    /// internal flag; runs after every applied configuration.
    async fn sync_push_listener(self: &Arc<Self>) {
        if self.state_sender.is_none() {
            // Roxy mode has no push channel.
            return;
        }
        let should_listen = self.internal_flags.is_enabled(PUSH_UPDATES_FLAG);
        let mut listener = self.push_listener.lock().await;
        if should_listen && listener.is_none() {
            debug!("starting push-updates listener");
            let created = NotificationListener::new(
                self.environment.notifications.clone(),
                self.sdk_settings.api_key.clone(),
                reqwest::Client::new(),
            );
            let weak = Arc::downgrade(self);
            created.on(
                "changed",
                Box::new(move |_event| {
                    if let Some(core) = weak.upgrade() {
                        tokio::spawn(async move {
                            core.fetch(true).await;
                        });
                    }
                }),
            );
            created.start();
            *listener = Some(created);
        } else if !should_listen {
            if let Some(active) = listener.take() {
                debug!("stopping push-updates listener");
                active.stop().await;
            }
        }
    }

    pub fn add_flag(&self, variant: Variant, name: &str) -> Result<Arc<Variant>, RoxError> {
        if self.stopped.load(Ordering::SeqCst) {
            warn!(flag = name, "client is shut down, ignoring flag registration");
            return Err(RoxError::ShutDown);
        }
        self.flag_repository.add_flag(variant, name)
    }

    pub fn flag(&self, name: &str) -> Option<Arc<Variant>> {
        self.flag_repository.flag(name)
    }

    pub fn add_custom_property(&self, property: CustomProperty) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("client is shut down, ignoring custom property");
            return;
        }
        self.custom_property_repository.add_custom_property(property);
    }

    pub fn add_custom_property_if_not_exists(&self, property: CustomProperty) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("client is shut down, ignoring custom property");
            return;
        }
        self.custom_property_repository
            .add_custom_property_if_not_exists(property);
    }

    /// Installs the context every flag evaluation merges under its local one.
    pub fn set_context(&self, context: Context) {
        for flag in self.flag_repository.all_flags() {
            flag.set_context(context.clone());
        }
    }

    pub fn create_dynamic_api(&self) -> DynamicApi {
        DynamicApi::new(self.flag_repository.clone())
    }

    pub fn evaluate_flag<T>(
        &self,
        name: &str,
        context: Option<&Context>,
        read: impl FnOnce(&Arc<Variant>, &EvalContext) -> T,
    ) -> Option<T> {
        let flag = self.flag_repository.flag(name)?;
        let eval = EvalContext::new(Some(&flag), context);
        Some(read(&flag, &eval))
    }

    pub fn flag_repository(&self) -> &Arc<FlagRepository> {
        &self.flag_repository
    }

    pub fn experiment_repository(&self) -> &Arc<ExperimentRepository> {
        &self.experiment_repository
    }

    pub fn target_group_repository(&self) -> &Arc<TargetGroupRepository> {
        &self.target_group_repository
    }

    pub fn custom_property_repository(&self) -> &Arc<CustomPropertyRepository> {
        &self.custom_property_repository
    }

    pub fn impression_invoker(&self) -> &Arc<ImpressionInvoker> {
        &self.impression_invoker
    }

    pub fn configuration_fetched_invoker(&self) -> &Arc<ConfigurationFetchedInvoker> {
        &self.configuration_fetched_invoker
    }

    pub fn internal_flags(&self) -> &Arc<InternalFlags> {
        &self.internal_flags
    }

    pub fn parser(&self) -> &Arc<Parser> {
        &self.parser
    }

    pub fn dynamic_properties(&self) -> &Arc<DynamicProperties> {
        &self.dynamic_properties
    }

    /// Signals every worker, joins them, and marks the client stopped;
    /// subsequent public operations are logging no-ops.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state
            .store(StateCode::ShuttingDown as i32, Ordering::SeqCst);

        let periodic = self
            .periodic_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(periodic) = periodic {
            periodic.stop().await;
        }

        let listener = self.push_listener.lock().await.take();
        if let Some(listener) = listener {
            listener.stop().await;
        }

        if let Some(state_sender) = &self.state_sender {
            state_sender.shutdown().await;
        }
    }
}
