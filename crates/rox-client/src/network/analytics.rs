use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error};

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub distinct_id: String,
    pub experiment_id: String,
    pub experiment_version: String,
    pub flag: String,
    pub value: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: f64,
}

impl AnalyticsEvent {
    pub fn impression(
        flag: &str,
        value: &str,
        distinct_id: &str,
        experiment_id: &str,
    ) -> AnalyticsEvent {
        AnalyticsEvent {
            distinct_id: distinct_id.to_string(),
            experiment_id: experiment_id.to_string(),
            experiment_version: "0".to_string(),
            flag: flag.to_string(),
            value: value.to_string(),
            event_type: "IMPRESSION".to_string(),
            time: Utc::now().timestamp_millis() as f64,
        }
    }
}

/// Posts impression events to the analytics endpoint. Tracking hands the
/// request off to the runtime so it never blocks the evaluating thread.
pub struct AnalyticsClient {
    http: Client,
    analytics_url: String,
    runtime: tokio::runtime::Handle,
}

impl AnalyticsClient {
    pub fn new(http: Client, analytics_url: impl Into<String>) -> AnalyticsClient {
        AnalyticsClient {
            http,
            analytics_url: analytics_url.into(),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn track(&self, event: AnalyticsEvent) {
        let http = self.http.clone();
        let url = self.analytics_url.clone();
        self.runtime.spawn(async move {
            match http.post(&url).json(&event).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(flag = %event.flag, "impression event delivered");
                }
                Ok(response) => {
                    error!(
                        status = response.status().as_u16(),
                        "analytics endpoint rejected impression event"
                    );
                }
                Err(transport_error) => {
                    error!(%transport_error, "failed to deliver impression event");
                }
            }
        });
    }
}
