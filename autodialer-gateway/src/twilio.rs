use async_trait::async_trait;
use serde::Deserialize;

use autodialer_config::TwilioConfig;
use autodialer_types::PhoneNumber;

use crate::{twiml, CallGateway, GatewayError, PlacedCall};

#[derive(Deserialize)]
struct CreatedCall {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct RestError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// Twilio REST `Calls.json` gateway.
pub struct TwilioGateway {
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    from: String,
    voice: String,
    language: String,
}

impl TwilioGateway {
    pub fn new(cfg: &TwilioConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| GatewayError::new(format!("client build: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            account_sid: cfg.account_sid.clone(),
            auth_token: cfg.auth_token.clone(),
            from: cfg.from_number.clone(),
            voice: cfg.voice.clone(),
            language: cfg.language.clone(),
        })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.base_url, self.account_sid
        )
    }
}

/// Interpret a `Calls.json` response body.
fn decode_response(status: u16, body: &str) -> Result<PlacedCall, GatewayError> {
    if (200..300).contains(&status) {
        let call: CreatedCall = serde_json::from_str(body)
            .map_err(|e| GatewayError::new(format!("unreadable provider response: {e}")))?;
        return Ok(PlacedCall {
            reference_id: call.sid,
            provider_status: call.status.unwrap_or_else(|| "queued".into()),
        });
    }
    let message = match serde_json::from_str::<RestError>(body) {
        Ok(RestError {
            message: Some(m),
            code,
        }) => match code {
            Some(code) => format!("{m} (code {code})"),
            None => m,
        },
        _ => format!("provider returned HTTP {status}"),
    };
    Err(GatewayError { message })
}

#[async_trait]
impl CallGateway for TwilioGateway {
    async fn place_call(
        &self,
        destination: &PhoneNumber,
        message: &str,
    ) -> Result<PlacedCall, GatewayError> {
        let doc = twiml::say(message, &self.voice, &self.language);
        let form = [
            ("From", self.from.as_str()),
            ("To", destination.as_str()),
            ("Twiml", doc.as_str()),
        ];

        let resp = self
            .client
            .post(self.calls_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::new(format!("provider unreachable: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::new(format!("provider response: {e}")))?;

        let result = decode_response(status, &body);
        match &result {
            Ok(call) => tracing::info!(to = %destination, sid = %call.reference_id, "call created"),
            Err(e) => tracing::warn!(to = %destination, error = %e, "call rejected"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_call_yields_sid_and_status() {
        let placed = decode_response(201, r#"{"sid":"CA42","status":"queued","to":"+919876543210"}"#)
            .unwrap();
        assert_eq!(placed.reference_id, "CA42");
        assert_eq!(placed.provider_status, "queued");
    }

    #[test]
    fn provider_message_is_passed_through() {
        let err = decode_response(
            400,
            r#"{"code":21211,"message":"The 'To' number +91 is not a valid phone number.","status":400}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.message,
            "The 'To' number +91 is not a valid phone number. (code 21211)"
        );
    }

    #[test]
    fn opaque_failures_name_the_status() {
        let err = decode_response(503, "<html>down</html>").unwrap_err();
        assert_eq!(err.message, "provider returned HTTP 503");
    }

    #[test]
    fn url_targets_account() {
        let cfg = TwilioConfig {
            account_sid: "AC1".into(),
            auth_token: "t".into(),
            from_number: "+15550000000".into(),
            base_url: "https://api.twilio.com/".into(),
            ..TwilioConfig::default()
        };
        let gw = TwilioGateway::new(&cfg).unwrap();
        assert_eq!(
            gw.calls_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC1/Calls.json"
        );
    }
}
