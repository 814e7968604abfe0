//! DynamoDB session-store client over the AWS JSON 1.0 protocol.
//!
//! Requests are unsigned; configure the endpoint as a SigV4 signing proxy for
//! live writes.

use super::{cognito::classify_error, BackendError, SessionRecord, SessionStore};
use crate::auth::MASKED;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};
use url::Url;

const PUT_ITEM_TARGET: &str = "DynamoDB_20120810.PutItem";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";

#[derive(Debug, Clone)]
pub struct DynamoSessionStore {
    client: Client,
    endpoint: Url,
    table: String,
}

impl DynamoSessionStore {
    #[must_use]
    pub fn new(client: Client, endpoint: Url, table: impl Into<String>) -> Self {
        Self {
            client,
            endpoint,
            table: table.into(),
        }
    }
}

/// Session record as DynamoDB attribute values. The access token is never
/// stored.
#[must_use]
pub fn session_item(record: &SessionRecord) -> Value {
    json!({
        "sessionId": { "S": record.session_id },
        "username": { "S": record.identity_name },
        "createdAt": { "S": record.created_at.to_rfc3339() },
        "expiresAt": { "S": record.expires_at.to_rfc3339() },
        "active": { "BOOL": record.active },
        "accessToken": { "S": MASKED },
    })
}

#[async_trait]
impl SessionStore for DynamoSessionStore {
    #[instrument(skip(self, record), fields(table = %self.table, session_id = %record.session_id))]
    async fn put_session(&self, record: &SessionRecord) -> Result<(), BackendError> {
        let payload = json!({
            "TableName": self.table,
            "Item": session_item(record),
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Amz-Target", PUT_ITEM_TARGET)
            .body(payload.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            debug!("PutItem - {status}");
            return Err(classify_error(status.as_u16(), &body));
        }

        Ok(())
    }
}
