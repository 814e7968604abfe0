//! Cognito user-pool client over the AWS JSON 1.1 protocol.
//!
//! `InitiateAuth`, `GetUser` and `GlobalSignOut` are authorized by the client
//! id or the access token and need no request signing. `AdminListGroupsForUser`
//! does; point the endpoint at a SigV4 signing proxy when calling it live.

use super::{AuthResponse, BackendError, IdentityProvider, UserInfo};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, instrument};
use url::Url;

const TARGET_PREFIX: &str = "AWSCognitoIdentityProviderService";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Error codes that mean the credential or token was refused.
const REJECTION_CODES: [&str; 4] = [
    "NotAuthorizedException",
    "UserNotFoundException",
    "UserNotConfirmedException",
    "PasswordResetRequiredException",
];

#[derive(Debug, Clone)]
pub struct CognitoClient {
    client: Client,
    endpoint: Url,
    region: String,
    user_pool_id: String,
    client_id: String,
}

impl CognitoClient {
    #[must_use]
    pub fn new(
        client: Client,
        endpoint: Url,
        region: impl Into<String>,
        user_pool_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            region: region.into(),
            user_pool_id: user_pool_id.into(),
            client_id: client_id.into(),
        }
    }

    async fn call(&self, operation: &str, payload: Value) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{operation}"))
            .body(payload.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            debug!("{operation} - {status}");
            return Err(classify_error(status.as_u16(), &body));
        }

        if body.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }

        serde_json::from_str(&body).map_err(|e| BackendError::Malformed(format!("{operation}: {e}")))
    }
}

/// Map an AWS JSON error body onto the backend taxonomy.
pub(crate) fn classify_error(status: u16, body: &str) -> BackendError {
    if status >= 500 {
        return BackendError::Transport(format!("service returned {status}"));
    }

    let json_response: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let code = json_response["__type"]
        .as_str()
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
        .unwrap_or_default();
    let message = json_response["message"]
        .as_str()
        .or_else(|| json_response["Message"].as_str())
        .unwrap_or("")
        .to_string();

    if REJECTION_CODES.contains(&code.as_str()) {
        BackendError::Rejected { code, message }
    } else {
        BackendError::Status {
            status,
            message: if code.is_empty() {
                message
            } else {
                format!("{code}: {message}")
            },
        }
    }
}

fn secret_field(value: &Value) -> Option<SecretString> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| SecretString::from(s.to_string()))
}

#[async_trait]
impl IdentityProvider for CognitoClient {
    fn region(&self) -> &str {
        &self.region
    }

    #[instrument(skip(self, password), fields(region = %self.region))]
    async fn initiate_auth(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<AuthResponse, BackendError> {
        let payload = json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": self.client_id,
            "AuthParameters": {
                "USERNAME": username,
                "PASSWORD": password.expose_secret(),
            }
        });

        let json_response = self.call("InitiateAuth", payload).await?;
        let result = &json_response["AuthenticationResult"];

        Ok(AuthResponse {
            access_token: secret_field(&result["AccessToken"]),
            id_token: secret_field(&result["IdToken"]),
            refresh_token: secret_field(&result["RefreshToken"]),
            token_type: result["TokenType"].as_str().map(str::to_string),
            expires_in: result["ExpiresIn"].as_i64(),
            challenge_name: json_response["ChallengeName"].as_str().map(str::to_string),
        })
    }

    #[instrument(skip(self, access_token), fields(region = %self.region))]
    async fn get_user(&self, access_token: &SecretString) -> Result<UserInfo, BackendError> {
        let payload = json!({ "AccessToken": access_token.expose_secret() });
        let json_response = self.call("GetUser", payload).await?;

        let username = json_response["Username"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let attributes: BTreeMap<String, String> = json_response["UserAttributes"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|attr| {
                        Some((
                            attr["Name"].as_str()?.to_string(),
                            attr["Value"].as_str()?.to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(UserInfo { username, attributes })
    }

    #[instrument(skip(self), fields(region = %self.region))]
    async fn list_groups_for_user(&self, username: &str) -> Result<Vec<String>, BackendError> {
        let payload = json!({
            "UserPoolId": self.user_pool_id,
            "Username": username,
        });
        let json_response = self.call("AdminListGroupsForUser", payload).await?;

        let groups = json_response["Groups"]
            .as_array()
            .ok_or_else(|| BackendError::Malformed("AdminListGroupsForUser: no Groups found".to_string()))?
            .iter()
            .filter_map(|group| group["GroupName"].as_str().map(str::to_string))
            .collect();

        Ok(groups)
    }

    #[instrument(skip(self, access_token), fields(region = %self.region))]
    async fn global_sign_out(&self, access_token: &SecretString) -> Result<(), BackendError> {
        let payload = json!({ "AccessToken": access_token.expose_secret() });
        self.call("GlobalSignOut", payload).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn client(server: &MockServer) -> CognitoClient {
        CognitoClient::new(
            Client::new(),
            Url::parse(&server.uri()).unwrap(),
            "ap-northeast-1",
            "ap-northeast-1_pool",
            "client-id",
        )
    }

    #[test]
    fn test_classify_error() {
        let rejected = classify_error(
            400,
            r#"{"__type":"NotAuthorizedException","message":"Incorrect username or password."}"#,
        );
        assert!(rejected.is_rejection());

        let namespaced = classify_error(
            400,
            r#"{"__type":"com.amazonaws.cognito#UserNotFoundException","message":"nope"}"#,
        );
        assert_eq!(
            namespaced,
            BackendError::Rejected {
                code: "UserNotFoundException".into(),
                message: "nope".into()
            }
        );

        let throttled = classify_error(400, r#"{"__type":"TooManyRequestsException","message":"slow"}"#);
        assert!(matches!(throttled, BackendError::Status { status: 400, .. }));

        assert!(classify_error(503, "").is_transient());
        assert!(matches!(classify_error(403, "<html>"), BackendError::Status { .. }));
    }

    #[tokio::test]
    async fn initiate_auth_returns_tokens() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Amz-Target", "AWSCognitoIdentityProviderService.InitiateAuth"))
            .and(body_partial_json(json!({
                "AuthFlow": "USER_PASSWORD_AUTH",
                "ClientId": "client-id",
                "AuthParameters": { "USERNAME": "testuser", "PASSWORD": "secret" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "AuthenticationResult": {
                    "AccessToken": "access",
                    "IdToken": "id",
                    "RefreshToken": "refresh",
                    "TokenType": "Bearer",
                    "ExpiresIn": 3600
                }
            })))
            .mount(&server)
            .await;

        let response = client(&server)
            .initiate_auth("testuser", &SecretString::from("secret".to_string()))
            .await
            .unwrap();
        assert_eq!(response.access_token.unwrap().expose_secret(), "access");
        assert!(response.refresh_token.is_some());
        assert_eq!(response.token_type.as_deref(), Some("Bearer"));
        assert_eq!(response.expires_in, Some(3600));
        assert!(response.challenge_name.is_none());
    }

    #[tokio::test]
    async fn initiate_auth_reports_challenge() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ChallengeName": "SOFTWARE_TOKEN_MFA",
                "Session": "opaque"
            })))
            .mount(&server)
            .await;

        let response = client(&server)
            .initiate_auth("mfa-user", &SecretString::from("secret".to_string()))
            .await
            .unwrap();
        assert!(response.access_token.is_none());
        assert_eq!(response.challenge_name.as_deref(), Some("SOFTWARE_TOKEN_MFA"));
    }

    #[tokio::test]
    async fn initiate_auth_rejects_bad_password() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "NotAuthorizedException",
                "message": "Incorrect username or password."
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .initiate_auth("testuser", &SecretString::from("InvalidPassword123!".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn get_user_parses_attributes() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Amz-Target", "AWSCognitoIdentityProviderService.GetUser"))
            .and(body_partial_json(json!({ "AccessToken": "access" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Username": "testuser",
                "UserAttributes": [
                    { "Name": "custom:sid", "Value": "S-1-5-21-1000000000-1000000000-1000000000-1001" },
                    { "Name": "email", "Value": "testuser@example.com" }
                ]
            })))
            .mount(&server)
            .await;

        let user = client(&server)
            .get_user(&SecretString::from("access".to_string()))
            .await
            .unwrap();
        assert_eq!(user.username, "testuser");
        assert_eq!(
            user.attribute("custom:sid"),
            Some("S-1-5-21-1000000000-1000000000-1000000000-1001")
        );
    }

    #[tokio::test]
    async fn list_groups_requires_groups_field() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(
                "X-Amz-Target",
                "AWSCognitoIdentityProviderService.AdminListGroupsForUser",
            ))
            .and(body_partial_json(json!({ "UserPoolId": "ap-northeast-1_pool", "Username": "admin" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Groups": [ { "GroupName": "administrators" }, { "GroupName": "users" } ]
            })))
            .mount(&server)
            .await;

        let groups = client(&server).list_groups_for_user("admin").await.unwrap();
        assert_eq!(groups, vec!["administrators".to_string(), "users".to_string()]);

        let err = client(&server).list_groups_for_user("nobody").await.unwrap_err();
        // wiremock answers unmatched requests with 404
        assert!(matches!(err, BackendError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server)
            .global_sign_out(&SecretString::from("access".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn malformed_body_is_reported() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_user(&SecretString::from("access".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }
}
