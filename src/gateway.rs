//! Delivery gateway — outbound messaging transport.
//!
//! Two delivery modes: `reply` is correlated to one inbound event via its
//! short-lived reply token; `push` is an unsolicited send used only by the
//! fire loop.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::DeliveryError;
use crate::router::QuickChoice;

/// LINE Messaging API base URL.
const LINE_API_BASE: &str = "https://api.line.me";

/// Outbound transport for replies and pushes.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Send a reply tied to an inbound event. Quick choices are attached
    /// opaquely; an empty slice attaches nothing.
    async fn reply(
        &self,
        reply_token: &str,
        text: &str,
        quick_choices: &[QuickChoice],
    ) -> Result<(), DeliveryError>;

    /// Send an unsolicited push to a user.
    async fn push(&self, user_id: &str, text: &str) -> Result<(), DeliveryError>;
}

/// LINE Messaging API gateway.
pub struct LineGateway {
    access_token: SecretString,
    client: reqwest::Client,
}

impl LineGateway {
    pub fn new(access_token: SecretString) -> Self {
        Self {
            access_token,
            client: reqwest::Client::new(),
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(format!("{LINE_API_BASE}{path}"))
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Build a text message object, attaching quick-reply items if any.
    fn text_message(text: &str, quick_choices: &[QuickChoice]) -> serde_json::Value {
        let mut message = serde_json::json!({ "type": "text", "text": text });
        if !quick_choices.is_empty() {
            let items: Vec<serde_json::Value> = quick_choices
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "type": "action",
                        "action": { "type": "message", "label": c.label, "text": c.text }
                    })
                })
                .collect();
            message["quickReply"] = serde_json::json!({ "items": items });
        }
        message
    }
}

#[async_trait]
impl DeliveryGateway for LineGateway {
    async fn reply(
        &self,
        reply_token: &str,
        text: &str,
        quick_choices: &[QuickChoice],
    ) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "replyToken": reply_token,
            "messages": [Self::text_message(text, quick_choices)],
        });
        self.post_json("/v2/bot/message/reply", body).await
    }

    async fn push(&self, user_id: &str, text: &str) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "to": user_id,
            "messages": [Self::text_message(text, &[])],
        });
        self.post_json("/v2/bot/message/push", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_without_choices_has_no_quick_reply() {
        let msg = LineGateway::text_message("hi", &[]);
        assert_eq!(msg["type"], "text");
        assert_eq!(msg["text"], "hi");
        assert!(msg.get("quickReply").is_none());
    }

    #[test]
    fn text_message_attaches_quick_reply_items() {
        let choices = vec![QuickChoice {
            label: "🎁 Gift".to_string(),
            text: "receive gift".to_string(),
        }];
        let msg = LineGateway::text_message("hi", &choices);
        let items = msg["quickReply"]["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["action"]["text"], "receive gift");
        assert_eq!(items[0]["action"]["label"], "🎁 Gift");
    }
}
