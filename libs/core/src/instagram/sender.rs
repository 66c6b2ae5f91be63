use async_trait::async_trait;
use serde_json::{json, Value};

use crate::automation::ReplyTemplate;
use crate::error::{CoreError, CoreResult};

use super::{CommentPage, FetchedComment, InstagramApi, InstagramCredentials, SendReceipt};

const DEFAULT_API_BASE: &str = "https://graph.instagram.com/v21.0";

/// Reqwest-backed Graph API client. An `api_base` starting with `mock://`
/// short-circuits every call, which keeps tests off the network.
pub struct GraphClient {
    http: reqwest::Client,
    api_base: String,
}

impl GraphClient {
    pub fn new(http: reqwest::Client, api_base: Option<String>) -> Self {
        let base = api_base.unwrap_or_else(|| DEFAULT_API_BASE.into());
        Self {
            http,
            api_base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_env(http: reqwest::Client) -> Self {
        Self::new(http, std::env::var("IG_API_BASE").ok())
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn is_mock(&self) -> bool {
        self.api_base.starts_with("mock://")
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn post_json(
        &self,
        url: String,
        token: &str,
        payload: &Value,
    ) -> CoreResult<Value> {
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(CoreError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(CoreError::new(
                "ig_send_failed",
                format!("status={} body={}", status.as_u16(), body_text),
            ));
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }

    async fn get_json(&self, url: String) -> CoreResult<Value> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(CoreError::transport)?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(CoreError::new(
                "ig_fetch_failed",
                format!("status={} body={}", status.as_u16(), body_text),
            ));
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }
}

/// Renders a template to the `message` object of a Send API payload.
pub(crate) fn render_message(template: &ReplyTemplate) -> Value {
    match template {
        ReplyTemplate::Text { text } => json!({ "text": text }),
        ReplyTemplate::Buttons { text, buttons } => json!({
            "attachment": {
                "type": "template",
                "payload": {
                    "template_type": "button",
                    "text": text,
                    "buttons": render_buttons(buttons),
                }
            }
        }),
        ReplyTemplate::Image {
            image_url,
            text,
            buttons,
        } => json!({
            "attachment": {
                "type": "template",
                "payload": {
                    "template_type": "generic",
                    "elements": [{
                        "title": text,
                        "image_url": image_url,
                        "buttons": render_buttons(buttons),
                    }]
                }
            }
        }),
    }
}

fn render_buttons(buttons: &[crate::automation::LinkButton]) -> Value {
    Value::Array(
        buttons
            .iter()
            .map(|b| {
                json!({
                    "type": "web_url",
                    "url": b.url,
                    "title": b.label,
                })
            })
            .collect(),
    )
}

fn receipt_from_send_response(raw: Value) -> SendReceipt {
    let message_id = raw
        .get("message_id")
        .or_else(|| raw.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    SendReceipt {
        message_id,
        raw: Some(raw),
    }
}

#[async_trait]
impl InstagramApi for GraphClient {
    async fn reply_to_comment(
        &self,
        creds: &InstagramCredentials,
        comment_id: &str,
        text: &str,
    ) -> CoreResult<SendReceipt> {
        let payload = json!({ "message": text });
        if self.is_mock() {
            return Ok(SendReceipt {
                message_id: Some(format!("mock-reply:{comment_id}")),
                raw: Some(payload),
            });
        }
        let raw = self
            .post_json(self.url(&format!("{comment_id}/replies")), &creds.access_token, &payload)
            .await?;
        Ok(receipt_from_send_response(raw))
    }

    async fn send_private_reply(
        &self,
        creds: &InstagramCredentials,
        comment_id: &str,
        template: &ReplyTemplate,
    ) -> CoreResult<SendReceipt> {
        let payload = json!({
            "recipient": { "comment_id": comment_id },
            "message": render_message(template),
        });
        if self.is_mock() {
            return Ok(SendReceipt {
                message_id: Some(format!("mock-dm:{comment_id}")),
                raw: Some(payload),
            });
        }
        let raw = self
            .post_json(
                self.url(&format!("{}/messages", creds.ig_user_id)),
                &creds.access_token,
                &payload,
            )
            .await?;
        Ok(receipt_from_send_response(raw))
    }

    async fn send_direct_message(
        &self,
        creds: &InstagramCredentials,
        recipient_id: &str,
        template: &ReplyTemplate,
    ) -> CoreResult<SendReceipt> {
        let payload = json!({
            "recipient": { "id": recipient_id },
            "message": render_message(template),
        });
        if self.is_mock() {
            return Ok(SendReceipt {
                message_id: Some(format!("mock-dm:{recipient_id}")),
                raw: Some(payload),
            });
        }
        let raw = self
            .post_json(
                self.url(&format!("{}/messages", creds.ig_user_id)),
                &creds.access_token,
                &payload,
            )
            .await?;
        Ok(receipt_from_send_response(raw))
    }

    async fn is_follower(
        &self,
        creds: &InstagramCredentials,
        user_id: &str,
    ) -> CoreResult<bool> {
        if self.is_mock() {
            return Ok(true);
        }
        let url = format!(
            "{}?fields=is_user_follow_business&access_token={}",
            self.url(user_id),
            urlencoding::encode(&creds.access_token),
        );
        let raw = self.get_json(url).await?;
        Ok(raw
            .get("is_user_follow_business")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn list_comments(
        &self,
        creds: &InstagramCredentials,
        media_id: &str,
        after: Option<&str>,
    ) -> CoreResult<CommentPage> {
        if self.is_mock() {
            return Ok(CommentPage::default());
        }
        let mut url = format!(
            "{}/comments?fields=id,text,username,from,timestamp&access_token={}",
            self.url(media_id),
            urlencoding::encode(&creds.access_token),
        );
        if let Some(cursor) = after {
            url.push_str("&after=");
            url.push_str(&urlencoding::encode(cursor));
        }
        let raw = self.get_json(url).await?;
        Ok(parse_comment_page(&raw))
    }
}

fn parse_comment_page(raw: &Value) -> CommentPage {
    let comments = raw
        .get("data")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_str()?.to_string();
                    Some(FetchedComment {
                        id,
                        text: item.get("text").and_then(|v| v.as_str()).map(String::from),
                        from_id: item
                            .get("from")
                            .and_then(|f| f.get("id"))
                            .and_then(|v| v.as_str())
                            .map(String::from),
                        username: item
                            .get("username")
                            .and_then(|v| v.as_str())
                            .map(String::from)
                            .or_else(|| {
                                item.get("from")
                                    .and_then(|f| f.get("username"))
                                    .and_then(|v| v.as_str())
                                    .map(String::from)
                            }),
                        timestamp: item
                            .get("timestamp")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    // The `next` link is only present when another page exists; the cursor is
    // what the API actually takes back.
    let has_next = raw
        .get("paging")
        .and_then(|p| p.get("next"))
        .and_then(|v| v.as_str())
        .is_some();
    let after = if has_next {
        raw.get("paging")
            .and_then(|p| p.get("cursors"))
            .and_then(|c| c.get("after"))
            .and_then(|v| v.as_str())
            .map(String::from)
    } else {
        None
    };

    CommentPage { comments, after }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::LinkButton;

    fn creds() -> InstagramCredentials {
        InstagramCredentials::new("17841400000000000", "token")
    }

    #[test]
    fn render_text_message() {
        let message = render_message(&ReplyTemplate::text("hello"));
        assert_eq!(message["text"], "hello");
    }

    #[test]
    fn render_button_template() {
        let message = render_message(&ReplyTemplate::Buttons {
            text: "pick".into(),
            buttons: vec![LinkButton {
                label: "Shop".into(),
                url: "https://shop.example".into(),
            }],
        });
        let payload = &message["attachment"]["payload"];
        assert_eq!(payload["template_type"], "button");
        assert_eq!(payload["buttons"][0]["type"], "web_url");
        assert_eq!(payload["buttons"][0]["title"], "Shop");
    }

    #[test]
    fn render_image_template_uses_generic_element() {
        let message = render_message(&ReplyTemplate::Image {
            image_url: "https://cdn.example/a.png".into(),
            text: "look".into(),
            buttons: vec![],
        });
        let element = &message["attachment"]["payload"]["elements"][0];
        assert_eq!(element["image_url"], "https://cdn.example/a.png");
        assert_eq!(element["title"], "look");
    }

    #[test]
    fn parse_comment_page_extracts_cursor_only_with_next() {
        let raw = serde_json::json!({
            "data": [
                {"id": "c1", "text": "price?", "from": {"id": "u1", "username": "fan"},
                 "timestamp": "2025-01-01T00:00:00+0000"},
            ],
            "paging": {"cursors": {"after": "AAA"}, "next": "https://..."}
        });
        let page = parse_comment_page(&raw);
        assert_eq!(page.comments.len(), 1);
        assert_eq!(page.comments[0].from_id.as_deref(), Some("u1"));
        assert_eq!(page.after.as_deref(), Some("AAA"));

        let last = serde_json::json!({
            "data": [],
            "paging": {"cursors": {"after": "AAA"}}
        });
        assert!(parse_comment_page(&last).after.is_none());
    }

    #[tokio::test]
    async fn mock_base_short_circuits_sends() {
        let client = GraphClient::new(reqwest::Client::new(), Some("mock://ig".into()));
        let receipt = client
            .send_private_reply(&creds(), "c9", &ReplyTemplate::text("hi"))
            .await
            .unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("mock-dm:c9"));
        assert!(client.is_follower(&creds(), "u1").await.unwrap());
    }

    #[test]
    fn url_building_trims_slashes() {
        let client = GraphClient::new(
            reqwest::Client::new(),
            Some("https://graph.instagram.com/v21.0/".into()),
        );
        assert_eq!(
            client.url("123/replies"),
            "https://graph.instagram.com/v21.0/123/replies"
        );
    }
}
