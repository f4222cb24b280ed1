use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use tracing::{debug, error, instrument};

use crate::core::client::{Buid, DeviceProperties};
use crate::core::configuration::{
    ConfigurationFetchedInvoker, ConfigurationSource, FetchResult,
};
use crate::core::consts::{Environment, ROXY_INTERNAL_PATH, property_type};
use crate::error::FetcherError;

/// Retrieves the configuration envelope: CDN with an API fallback in SDK
/// mode, or a single side-car endpoint in Roxy mode. Failures are reported
/// through the configuration-fetched invoker and yield `None`.
pub struct ConfigurationFetcher {
    http: Client,
    environment: Environment,
    device_properties: Arc<DeviceProperties>,
    buid: Buid,
    invoker: Arc<ConfigurationFetchedInvoker>,
    roxy_url: Option<String>,
}

impl ConfigurationFetcher {
    pub fn new(
        http: Client,
        environment: Environment,
        device_properties: Arc<DeviceProperties>,
        buid: Buid,
        invoker: Arc<ConfigurationFetchedInvoker>,
    ) -> ConfigurationFetcher {
        ConfigurationFetcher {
            http,
            environment,
            device_properties,
            buid,
            invoker,
            roxy_url: None,
        }
    }

    pub fn new_roxy(
        http: Client,
        environment: Environment,
        device_properties: Arc<DeviceProperties>,
        buid: Buid,
        invoker: Arc<ConfigurationFetchedInvoker>,
        roxy_url: impl Into<String>,
    ) -> ConfigurationFetcher {
        ConfigurationFetcher {
            http,
            environment,
            device_properties,
            buid,
            invoker,
            roxy_url: Some(roxy_url.into()),
        }
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self) -> Option<FetchResult> {
        match self.roxy_url.clone() {
            Some(roxy_url) => self.fetch_from_roxy(&roxy_url).await,
            None => self.fetch_from_cdn().await,
        }
    }

    async fn fetch_from_cdn(&self) -> Option<FetchResult> {
        let app_key = self.device_properties.rollout_key();
        let url = format!("{}/{}/{}", self.environment.cdn, app_key, self.buid.value());
        let response = match self
            .http
            .get(&url)
            .query(&[(property_type::DISTINCT_ID, self.device_properties.distinct_id())])
            .send()
            .await
        {
            Ok(response) => response,
            Err(transport_error) => {
                error!(%transport_error, "failed to reach configuration CDN");
                self.invoker.invoke_error(FetcherError::NetworkError);
                return None;
            }
        };

        let status = response.status();
        if status.is_success() {
            let envelope = self.read_envelope(response).await?;
            if !has_result_404(&envelope) {
                debug!(source = %ConfigurationSource::Cdn, "configuration retrieved");
                return Some(FetchResult {
                    data: envelope,
                    source: ConfigurationSource::Cdn,
                });
            }
            debug!("configuration not on CDN, falling back to API");
            return self.fetch_from_api().await;
        }

        if status.as_u16() == 403 || status.as_u16() == 404 {
            debug!(status = status.as_u16(), "CDN refused, falling back to API");
            return self.fetch_from_api().await;
        }

        error!(status = status.as_u16(), "unexpected CDN response");
        self.invoker.invoke_error(FetcherError::NetworkError);
        None
    }

    async fn fetch_from_api(&self) -> Option<FetchResult> {
        let properties = self.device_properties.all_properties();
        let app_key = self.device_properties.rollout_key().to_string();
        let buid = self.buid.value().to_string();
        let url = format!("{}/{}/{}", self.environment.api, app_key, buid);

        let mut form = HashMap::new();
        form.insert(property_type::APP_KEY, app_key.clone());
        form.insert(
            property_type::API_VERSION,
            properties
                .get(property_type::API_VERSION)
                .cloned()
                .unwrap_or_default(),
        );
        form.insert(
            property_type::DISTINCT_ID,
            self.device_properties.distinct_id().to_string(),
        );
        form.insert(property_type::BUID, buid.clone());
        form.insert(
            property_type::CACHE_MISS_RELATIVE_URL,
            format!("{app_key}/{buid}"),
        );

        let response = match self.http.post(&url).form(&form).send().await {
            Ok(response) => response,
            Err(transport_error) => {
                error!(%transport_error, "failed to reach configuration API");
                self.invoker.invoke_error(FetcherError::NetworkError);
                return None;
            }
        };

        let status = response.status();
        if status.is_success() {
            let envelope = self.read_envelope(response).await?;
            debug!(source = %ConfigurationSource::Api, "configuration retrieved");
            return Some(FetchResult {
                data: envelope,
                source: ConfigurationSource::Api,
            });
        }

        error!(status = status.as_u16(), "failed to fetch configuration from API");
        self.invoker.invoke_error(FetcherError::NetworkError);
        None
    }

    async fn fetch_from_roxy(&self, roxy_url: &str) -> Option<FetchResult> {
        let url = format!("{}/{}", roxy_url.trim_end_matches('/'), ROXY_INTERNAL_PATH);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(transport_error) => {
                error!(%transport_error, "failed to reach Roxy");
                self.invoker.invoke_error(FetcherError::NetworkError);
                return None;
            }
        };

        let status = response.status();
        if status.is_success() {
            let envelope = self.read_envelope(response).await?;
            debug!(source = %ConfigurationSource::Roxy, "configuration retrieved");
            return Some(FetchResult {
                data: envelope,
                source: ConfigurationSource::Roxy,
            });
        }

        error!(status = status.as_u16(), "failed to fetch configuration from Roxy");
        self.invoker.invoke_error(FetcherError::NetworkError);
        None
    }

    async fn read_envelope(&self, response: reqwest::Response) -> Option<serde_json::Value> {
        let body = match response.text().await {
            Ok(body) => body,
            Err(transport_error) => {
                error!(%transport_error, "failed to read configuration response");
                self.invoker.invoke_error(FetcherError::NetworkError);
                return None;
            }
        };
        if body.is_empty() {
            error!("configuration response is empty");
            self.invoker.invoke_error(FetcherError::EmptyJson);
            return None;
        }
        match serde_json::from_str(&body) {
            Ok(envelope) => Some(envelope),
            Err(parse_error) => {
                error!(%parse_error, "configuration response is not valid JSON");
                self.invoker.invoke_error(FetcherError::CorruptedJson);
                None
            }
        }
    }
}

/// The CDN answers a cache miss with HTTP 200 and a `result: 404` body.
fn has_result_404(envelope: &serde_json::Value) -> bool {
    match envelope.get("result") {
        Some(serde_json::Value::Number(number)) => number.as_i64() == Some(404),
        Some(serde_json::Value::String(text)) => text == "404",
        _ => false,
    }
}
