use std::env;

pub(crate) const ROX_PLATFORM: &str = "Rust";
pub(crate) const ROX_API_VERSION: &str = "1.8.0";
pub(crate) const ROX_LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relative path a Roxy side-car serves the configuration from.
pub(crate) const ROXY_INTERNAL_PATH: &str = "device/request_configuration";

/// Device-property and form-field names used across fetching, state
/// submission and fingerprinting.
pub(crate) mod property_type {
    pub const CACHE_MISS_RELATIVE_URL: &str = "cache_miss_relative_url";
    pub const LIB_VERSION: &str = "lib_version";
    pub const API_VERSION: &str = "api_version";
    pub const BUID: &str = "buid";
    pub const APP_RELEASE: &str = "app_release";
    pub const DISTINCT_ID: &str = "distinct_id";
    pub const APP_KEY: &str = "app_key";
    pub const FEATURE_FLAGS: &str = "feature_flags";
    pub const REMOTE_VARIABLES: &str = "remote_variables";
    pub const CUSTOM_PROPERTIES: &str = "custom_properties";
    pub const PLATFORM: &str = "platform";
    pub const DEV_MODE_SECRET: &str = "devModeSecret";
    pub const STATE_MD5: &str = "state_md5";
}

const ROX_ENV_MODE_KEY: &str = "ROLLOUT_MODE";

/// Base-URL set for every remote endpoint, selected once from
/// `ROLLOUT_MODE` (`LOCAL`, `QA`, anything else is production). Tests and
/// self-managed deployments construct the struct directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub cdn: String,
    pub api: String,
    pub state_cdn: String,
    pub state_api: String,
    pub analytics: String,
    pub notifications: String,
}

impl Environment {
    pub fn from_env() -> Environment {
        match env::var(ROX_ENV_MODE_KEY).as_deref() {
            Ok("LOCAL") => Environment::local(),
            Ok("QA") => Environment::qa(),
            _ => Environment::production(),
        }
    }

    pub fn production() -> Environment {
        Environment {
            cdn: "https://conf.rollout.io".into(),
            api: "https://x-api.rollout.io/device/get_configuration".into(),
            state_cdn: "https://statestore.rollout.io".into(),
            state_api: "https://x-api.rollout.io/device/update_state_store".into(),
            analytics: "https://analytic.rollout.io".into(),
            notifications: "https://push.rollout.io/sse".into(),
        }
    }

    pub fn qa() -> Environment {
        Environment {
            cdn: "https://qa-conf.rollout.io".into(),
            api: "https://qax.rollout.io/device/get_configuration".into(),
            state_cdn: "https://qa-statestore.rollout.io".into(),
            state_api: "https://qax.rollout.io/device/update_state_store".into(),
            analytics: "https://qaanalytic.rollout.io".into(),
            notifications: "https://qax-push.rollout.io/sse".into(),
        }
    }

    pub fn local() -> Environment {
        Environment {
            cdn: "https://development-conf.rollout.io".into(),
            api: "http://127.0.0.1:8557/device/get_configuration".into(),
            state_cdn: "https://development-statestore.rollout.io".into(),
            state_api: "http://127.0.0.1:8557/device/update_state_store".into(),
            analytics: "http://127.0.0.1:8787".into(),
            notifications: "http://127.0.0.1:8887/sse".into(),
        }
    }
}
