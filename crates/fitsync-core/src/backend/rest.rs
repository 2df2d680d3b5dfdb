//! HTTP implementation of [`Backend`] against a PostgREST-style API
//! (`/rest/v1/<table>` for rows, `/rest/v1/rpc/<fn>` for procedures).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::Backend;
use crate::constants::{columns, tables, EVALUATE_ACHIEVEMENTS_RPC};
use crate::error::{Result, SyncError};
use crate::models::{AchievementGrant, Conversation, MessageRecord, NewMessage, UserId};
use crate::store::UnreadScope;

/// Connection settings for the hosted backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestConfig {
    pub url: String,
    pub anon_key: String,
    /// User session token; the anon key is used as bearer when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl RestConfig {
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    id: UserId,
    #[serde(alias = "display_name")]
    full_name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
}

impl Op {
    fn error(self, message: String) -> SyncError {
        match self {
            Op::Read => SyncError::Query(message),
            Op::Write => SyncError::Write(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    config: RestConfig,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url(), table)
    }

    fn rpc_url(&self, name: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.config.base_url(), name)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .header("Authorization", format!("Bearer {}", self.config.bearer()))
    }

    async fn execute(&self, request: RequestBuilder, op: Op) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| op.error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(op.error(format!("{}: {}", status, body)));
        }
        Ok(response)
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, request: RequestBuilder, what: &'static str) -> Result<T> {
        self.execute(request, Op::Read)
            .await?
            .json::<T>()
            .await
            .map_err(|e| SyncError::decode(what, e))
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

fn timestamp_param(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl Backend for RestBackend {
    async fn write_message(&self, message: NewMessage) -> Result<MessageRecord> {
        let request = self
            .client
            .post(self.table_url(tables::MESSAGES))
            .header("Prefer", "return=representation")
            .json(&message);

        let rows: Vec<MessageRecord> = self
            .execute(request, Op::Write)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::decode("message", e))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::Write("store returned no row for insert".into()))
    }

    async fn query_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let request = self.client.get(self.table_url(tables::MESSAGES)).query(&[
            (columns::CONVERSATION_ID, format!("eq.{}", conversation_id)),
            ("order", "created_at.asc,id.asc".to_string()),
        ]);
        self.fetch(request, "messages").await
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let request = self
            .client
            .get(self.table_url(tables::CONVERSATIONS))
            .query(&[("id", format!("eq.{}", conversation_id))]);
        let rows: Vec<Conversation> = self.fetch(request, "conversation").await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::Query(format!("conversation {} not found", conversation_id)))
    }

    async fn mark_read(&self, conversation_id: &str, recipient: &UserId) -> Result<()> {
        let request = self
            .client
            .patch(self.table_url(tables::MESSAGES))
            .query(&[
                (columns::CONVERSATION_ID, format!("eq.{}", conversation_id)),
                (columns::RECIPIENT_ID, format!("eq.{}", recipient)),
                ("read", "eq.false".to_string()),
            ])
            .json(&json!({ "read": true }));
        self.execute(request, Op::Write).await?;
        Ok(())
    }

    async fn count_unread(&self, recipient: &UserId, scope: &UnreadScope) -> Result<u64> {
        let mut params = vec![
            ("select", "id".to_string()),
            (columns::RECIPIENT_ID, format!("eq.{}", recipient)),
            ("read", "eq.false".to_string()),
        ];
        if let UnreadScope::Conversation(id) = scope {
            params.push((columns::CONVERSATION_ID, format!("eq.{}", id)));
        }

        let request = self
            .client
            .head(self.table_url(tables::MESSAGES))
            .header("Prefer", "count=exact")
            .query(&params);
        let response = self.execute(request, Op::Read).await?;

        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| SyncError::decode("unread count", "missing content-range"))
    }

    async fn evaluate_achievements(&self, user: &UserId) -> Result<()> {
        let request = self
            .client
            .post(self.rpc_url(EVALUATE_ACHIEVEMENTS_RPC))
            .json(&json!({ "p_user_id": user }));
        self.execute(request, Op::Write)
            .await
            .map_err(|e| SyncError::Rpc {
                name: EVALUATE_ACHIEVEMENTS_RPC.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn recent_grants(
        &self,
        user: &UserId,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AchievementGrant>> {
        let request = self.client.get(self.table_url(tables::USER_ACHIEVEMENTS)).query(&[
            ("select", "*,achievement:achievements(*)".to_string()),
            (columns::USER_ID, format!("eq.{}", user)),
            (columns::GRANTED_AT, format!("gt.{}", timestamp_param(after))),
            ("order", format!("{}.desc", columns::GRANTED_AT)),
            ("limit", limit.to_string()),
        ]);
        self.fetch(request, "achievement grants").await
    }

    async fn display_names(&self, users: &[UserId]) -> Result<HashMap<UserId, String>> {
        if users.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<&str> = users.iter().map(UserId::as_str).collect();
        let request = self.client.get(self.table_url(tables::PROFILES)).query(&[
            ("select", "id,full_name".to_string()),
            ("id", format!("in.({})", ids.join(","))),
        ]);
        let rows: Vec<ProfileRow> = self.fetch(request, "profiles").await?;
        debug!(requested = users.len(), found = rows.len(), "resolved display names");

        Ok(rows
            .into_iter()
            .filter_map(|row| row.full_name.map(|name| (row.id, name)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("*/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn test_urls_ignore_trailing_slash() {
        let backend = RestBackend::new(RestConfig {
            url: "https://example.supabase.co/".into(),
            anon_key: "anon".into(),
            access_token: None,
        });
        assert_eq!(
            backend.table_url(tables::MESSAGES),
            "https://example.supabase.co/rest/v1/messages"
        );
        assert_eq!(
            backend.rpc_url(EVALUATE_ACHIEVEMENTS_RPC),
            "https://example.supabase.co/rest/v1/rpc/evaluate_achievements"
        );
    }

    #[test]
    fn test_bearer_prefers_session_token() {
        let mut config = RestConfig {
            url: "https://x".into(),
            anon_key: "anon".into(),
            access_token: None,
        };
        assert_eq!(config.bearer(), "anon");
        config.access_token = Some("jwt".into());
        assert_eq!(config.bearer(), "jwt");
    }

    #[test]
    fn test_timestamp_param_is_utc_rfc3339() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(timestamp_param(at), "2023-11-14T22:13:20.000000Z");
    }

    #[test]
    fn test_profile_row_aliases() {
        let row: ProfileRow = serde_json::from_str(r#"{"id": "u1", "display_name": "Ana"}"#).unwrap();
        assert_eq!(row.full_name.as_deref(), Some("Ana"));
    }
}
