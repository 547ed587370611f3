use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DEFAULT_RECAPTCHA_URL;

/// Human verification of relay requests.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> bool;
}

/// Accepts every token. Used while CAPTCHA verification is turned off.
pub struct AlwaysAllow;

#[async_trait]
impl CaptchaVerifier for AlwaysAllow {
    async fn verify(&self, _token: &str, _remote_ip: Option<&str>) -> bool {
        tracing::debug!("CAPTCHA verification disabled, accepting token");
        true
    }
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Google reCAPTCHA siteverify client.
pub struct RecaptchaVerifier {
    client: reqwest::Client,
    secret: String,
    verify_url: String,
}

impl RecaptchaVerifier {
    pub fn new(secret: String) -> Self {
        Self::with_url(secret, DEFAULT_RECAPTCHA_URL.to_string())
    }

    pub fn with_url(secret: String, verify_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret,
            verify_url,
        }
    }
}

#[async_trait]
impl CaptchaVerifier for RecaptchaVerifier {
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> bool {
        if token.is_empty() {
            return false;
        }

        let mut form = vec![("secret", self.secret.as_str()), ("response", token)];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }

        let response = match self.client.post(&self.verify_url).form(&form).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("reCAPTCHA verification request failed: {}", e);
                return false;
            }
        };

        match response.json::<SiteVerifyResponse>().await {
            Ok(body) if body.success => true,
            Ok(body) => {
                tracing::warn!("reCAPTCHA rejected token: {:?}", body.error_codes);
                false
            }
            Err(e) => {
                tracing::error!("Failed to parse reCAPTCHA response: {}", e);
                false
            }
        }
    }
}
