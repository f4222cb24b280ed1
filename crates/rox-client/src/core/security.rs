use crate::core::client::SdkSettings;

/// Verifies the RSA signature of the configuration payload.
///
/// The cryptographic check is a pluggable seam; the stock verifier accepts,
/// matching the reference SDK build. Tests install rejecting verifiers to
/// exercise the failure path.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, data: &str, signature_base64: &str) -> bool;
}

pub struct AcceptingSignatureVerifier;

impl SignatureVerifier for AcceptingSignatureVerifier {
    fn verify(&self, _data: &str, _signature_base64: &str) -> bool {
        true
    }
}

/// Checks that the `application` field of a configuration matches the key
/// this client was set up with.
pub struct ApiKeyVerifier {
    sdk_settings: SdkSettings,
}

impl ApiKeyVerifier {
    pub fn new(sdk_settings: SdkSettings) -> ApiKeyVerifier {
        ApiKeyVerifier { sdk_settings }
    }

    pub fn verify(&self, api_key: &str) -> bool {
        api_key == self.sdk_settings.api_key
    }

    pub fn sdk_settings(&self) -> &SdkSettings {
        &self.sdk_settings
    }
}
