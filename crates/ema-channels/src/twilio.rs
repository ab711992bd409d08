//! Twilio SMS transport.
//!
//! Thin client over the Twilio Messages REST API. Numbers are normalized
//! to E.164 before sending: non-digits stripped, country code prefixed
//! when a 10-digit local number is supplied.

use async_trait::async_trait;
use ema_core::config::TransportConfig;
use ema_core::error::{EmaError, Result};
use ema_core::traits::SmsTransport;

/// Twilio-backed SMS transport.
pub struct TwilioTransport {
    config: TransportConfig,
    client: reqwest::Client,
}

impl TwilioTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Normalize a raw phone value to E.164 using the configured country
    /// code. A 10-digit number gets the country code prefixed; an
    /// 11+-digit number is assumed to already carry one.
    pub fn normalize_number(raw: &str, country_code: &str) -> Result<String> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < 10 {
            return Err(EmaError::Transport(format!(
                "phone number '{raw}' has too few digits"
            )));
        }
        if digits.len() == 10 {
            Ok(format!("+{country_code}{digits}"))
        } else {
            Ok(format!("+{digits}"))
        }
    }
}

#[async_trait]
impl SmsTransport for TwilioTransport {
    async fn send(&self, to: &str, body: &str) -> Result<String> {
        if self.config.account_sid.is_empty() || self.config.auth_token.is_empty() {
            return Err(EmaError::Transport("Twilio credentials not configured".into()));
        }

        let to = Self::normalize_number(to, &self.config.country_code)?;
        let from = Self::normalize_number(&self.config.from_number, &self.config.country_code)?;

        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("To", to.as_str()), ("From", from.as_str()), ("Body", body)])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| EmaError::Transport(format!("Twilio request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EmaError::Transport(format!("Twilio API error {status}: {text}")));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmaError::Transport(format!("invalid Twilio response: {e}")))?;

        let sid = result["sid"].as_str().unwrap_or("unknown").to_string();
        tracing::debug!("SMS sent: {} → {}", sid, to);
        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_local_number() {
        assert_eq!(
            TwilioTransport::normalize_number("(650) 555-1212", "1").unwrap(),
            "+16505551212"
        );
    }

    #[test]
    fn test_normalize_already_prefixed() {
        assert_eq!(
            TwilioTransport::normalize_number("+1 650 555 1212", "1").unwrap(),
            "+16505551212"
        );
    }

    #[test]
    fn test_normalize_too_short() {
        assert!(TwilioTransport::normalize_number("555-1212", "1").is_err());
    }

    #[tokio::test]
    async fn test_send_without_credentials_fails() {
        let transport = TwilioTransport::new(TransportConfig::default());
        assert!(transport.send("6505551212", "hi").await.is_err());
    }
}
