//! Rich menu provisioning — one-shot startup glue.
//!
//! Replaces any existing rich menus with the funnel menu and sets it as the
//! default. Best effort: a failure here is logged by the caller and never
//! blocks startup.

use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::info;

const LINE_API_BASE: &str = "https://api.line.me";
const LINE_DATA_API_BASE: &str = "https://api-data.line.me";

/// Provision the default rich menu, optionally uploading its image.
pub async fn provision_rich_menu(
    access_token: &SecretString,
    image_path: Option<&Path>,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let token = access_token.expose_secret();

    // Clear out previous menus so the new one is the only candidate.
    let list: serde_json::Value = client
        .get(format!("{LINE_API_BASE}/v2/bot/richmenu/list"))
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if let Some(menus) = list["richmenus"].as_array() {
        for menu in menus {
            if let Some(id) = menu["richMenuId"].as_str() {
                client
                    .delete(format!("{LINE_API_BASE}/v2/bot/richmenu/{id}"))
                    .bearer_auth(token)
                    .send()
                    .await?
                    .error_for_status()?;
            }
        }
    }

    let created: serde_json::Value = client
        .post(format!("{LINE_API_BASE}/v2/bot/richmenu"))
        .bearer_auth(token)
        .json(&menu_request())
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let menu_id = created["richMenuId"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("richMenuId missing from create response"))?
        .to_string();

    if let Some(path) = image_path {
        let bytes = tokio::fs::read(path).await?;
        client
            .post(format!(
                "{LINE_DATA_API_BASE}/v2/bot/richmenu/{menu_id}/content"
            ))
            .bearer_auth(token)
            .header("Content-Type", "image/png")
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
    }

    client
        .post(format!("{LINE_API_BASE}/v2/bot/user/all/richmenu/{menu_id}"))
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?;

    info!(menu_id = %menu_id, "Rich menu provisioned");
    Ok(())
}

/// The five-area funnel menu. The gift area feeds the router's gift
/// trigger; the shop area is an external link.
fn menu_request() -> serde_json::Value {
    json!({
        "size": { "width": 2500, "height": 843 },
        "selected": true,
        "name": "Funnel Menu",
        "chatBarText": "🌸 Menu",
        "areas": [
            {
                "bounds": { "x": 0, "y": 0, "width": 833, "height": 843 },
                "action": { "type": "message", "label": "📜 Archetype", "text": "archetype" }
            },
            {
                "bounds": { "x": 834, "y": 0, "width": 833, "height": 843 },
                "action": { "type": "message", "label": "🎁 Gift", "text": "receive gift" }
            },
            {
                "bounds": { "x": 1667, "y": 0, "width": 416, "height": 421 },
                "action": { "type": "message", "label": "🕊️ Journey", "text": "journey" }
            },
            {
                "bounds": { "x": 1667, "y": 422, "width": 416, "height": 421 },
                "action": { "type": "uri", "label": "🛍️ Shop", "uri": "https://example.com/shop" }
            },
            {
                "bounds": { "x": 2084, "y": 0, "width": 416, "height": 843 },
                "action": { "type": "message", "label": "💬 Oracle", "text": "oracle" }
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn menu_request_gift_area_matches_router_trigger() {
        let menu = menu_request();
        let areas = menu["areas"].as_array().unwrap();
        assert_eq!(areas.len(), 5);
        let gift = &areas[1]["action"];
        assert_eq!(gift["text"], "receive gift");
    }
}
