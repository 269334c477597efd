//! REST and server-sent events client for the conversation backend

use reqwest_eventsource::EventSource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    event::normalize_message,
    types::{Message, Role},
};

/// One page of persisted history, oldest first
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub messages: Vec<Message>,
    /// Whether older messages exist beyond this page
    pub has_more: bool,
}

/// Result of a summarization call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    #[serde(alias = "summary", alias = "summary_text")]
    pub summary_text: String,
    #[serde(default, alias = "token_count_before", alias = "tokensBefore")]
    pub token_count_before: u32,
    #[serde(default, alias = "token_count_after", alias = "tokensAfter")]
    pub token_count_after: u32,
}

/// Agent or tool metadata from the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "avatar", alias = "avatar_url")]
    pub avatar_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendRequest<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RollbackRequest<'a> {
    message_id: &'a str,
}

#[derive(Serialize)]
struct WireTurn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummarizeRequest<'a> {
    model_id: &'a str,
    messages: Vec<WireTurn<'a>>,
}

/// HTTP client for the conversation backend
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a client for the given server base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "server url must be http(s): '{}'",
                base_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token: None,
        })
    }

    /// Authenticate requests with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(Error::api(status.as_u16(), text))
    }

    /// Open a server-sent events source for a conversation.
    ///
    /// The returned source has reconnection disabled; callers own backoff.
    pub fn event_source(&self, conversation_id: &str) -> Result<EventSource> {
        let url = self.url(&format!("/api/conversations/{}/events", conversation_id));
        tracing::debug!("Event stream URL: {}", url);

        let request_builder = self
            .authorize(self.client.get(&url))
            .header("accept", "text/event-stream");

        let mut event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
        event_source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));
        Ok(event_source)
    }

    /// Fetch a page of messages older than `before` (or the newest page)
    pub async fn fetch_page(
        &self,
        conversation_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Page> {
        let url = self.url(&format!("/api/conversations/{}/messages", conversation_id));
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(cursor) = before {
            query.push(("before", cursor.to_string()));
        }

        let response = self
            .authorize(self.client.get(&url))
            .query(&query)
            .send()
            .await?;
        let body: Value = Self::check(response).await?.json().await?;
        Ok(parse_page(&body, limit))
    }

    /// Persist a new message; returns the server-assigned id
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        client_id: Option<&str>,
    ) -> Result<String> {
        let url = self.url(&format!("/api/conversations/{}/messages", conversation_id));
        let request = AppendRequest {
            role: role.as_str(),
            content,
            client_id,
        };

        let response = self
            .authorize(self.client.post(&url))
            .json(&request)
            .send()
            .await?;
        let body: Value = Self::check(response).await?.json().await?;
        assigned_id(&body)
            .ok_or_else(|| Error::UnexpectedResponse("append response without id".into()))
    }

    /// Delete one message
    pub async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        let url = self.url(&format!(
            "/api/conversations/{}/messages/{}",
            conversation_id, message_id
        ));
        let response = self.authorize(self.client.delete(&url)).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Delete every message after `message_id`
    pub async fn rollback_to(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        let url = self.url(&format!("/api/conversations/{}/rollback", conversation_id));
        let response = self
            .authorize(self.client.post(&url))
            .json(&RollbackRequest { message_id })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Summarize a span of messages
    pub async fn summarize(&self, model_id: &str, messages: &[Message]) -> Result<SummaryResponse> {
        let url = self.url("/api/summarize");
        let request = SummarizeRequest {
            model_id,
            messages: messages
                .iter()
                .map(|m| WireTurn {
                    // summaries are injected as user content
                    role: if m.is_summary { "user" } else { m.role.as_str() },
                    content: &m.content,
                })
                .collect(),
        };

        let response = self
            .authorize(self.client.post(&url))
            .json(&request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Look up an agent's profile
    pub async fn fetch_agent(&self, agent_id: &str) -> Result<AgentProfile> {
        let url = self.url(&format!("/api/agents/{}", agent_id));
        let response = self.authorize(self.client.get(&url)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

/// Accepts either a bare array or `{ messages, hasMore }`
fn parse_page(body: &Value, limit: usize) -> Page {
    let (items, has_more) = match body {
        Value::Array(items) => (items.as_slice(), None),
        Value::Object(map) => (
            map.get("messages")
                .and_then(|v| v.as_array())
                .map(|v| v.as_slice())
                .unwrap_or(&[]),
            map.get("hasMore")
                .or_else(|| map.get("has_more"))
                .and_then(|v| v.as_bool()),
        ),
        _ => (&[][..], None),
    };

    let messages: Vec<Message> = items
        .iter()
        .filter_map(|item| match normalize_message(item) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!("Skipping malformed history message: {}", e);
                None
            }
        })
        .collect();

    Page {
        has_more: has_more.unwrap_or(items.len() >= limit),
        messages,
    }
}

fn assigned_id(body: &Value) -> Option<String> {
    body.get("id")
        .or_else(|| body.pointer("/message/id"))
        .or_else(|| body.get("messageId"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_rejects_non_http_url() {
        assert!(matches!(
            ApiClient::new("ftp://example.com"),
            Err(Error::InvalidConfig(_))
        ));
        let client = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[test]
    fn test_parse_page_object_shape() {
        let body = json!({
            "messages": [
                {"id": "m1", "role": "user", "content": "hi"},
                {"role": "assistant", "content": "no id"},
                {"id": "m2", "role": "assistant", "content": "hello"}
            ],
            "hasMore": false
        });
        let page = parse_page(&body, 50);
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[1].id, "m2");
        assert!(!page.has_more);
    }

    #[test]
    fn test_parse_page_array_infers_has_more() {
        let body = json!([
            {"id": "m1", "role": "user", "content": "a"},
            {"id": "m2", "role": "user", "content": "b"}
        ]);
        assert!(parse_page(&body, 2).has_more);
        assert!(!parse_page(&body, 3).has_more);
    }

    #[test]
    fn test_assigned_id_shapes() {
        assert_eq!(assigned_id(&json!({"id": "s1"})).as_deref(), Some("s1"));
        assert_eq!(assigned_id(&json!({"message": {"id": 42}})).as_deref(), Some("42"));
        assert_eq!(assigned_id(&json!({"ok": true})), None);
    }

    #[test]
    fn test_summary_response_aliases() {
        let parsed: SummaryResponse = serde_json::from_value(json!({
            "summary": "short", "token_count_before": 3000, "tokensAfter": 120
        }))
        .unwrap();
        assert_eq!(parsed.summary_text, "short");
        assert_eq!(parsed.token_count_before, 3000);
        assert_eq!(parsed.token_count_after, 120);
    }
}
