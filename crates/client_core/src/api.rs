use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ConversationSummary, Credential, Message, UserId, UserProfile},
    protocol::{
        AuthResponse, ConversationPayload, LoginRequest, MarkReadResponse, MessagePayload,
        RefreshRequest, RegisterRequest, SendMessageRequest, SocialProvider, SocialSignInRequest,
        TokenResponse,
    },
};

use crate::{
    error::Result,
    mapping,
    token_manager::TokenRefresher,
    transport::{execute_json, ApiRequest, AuthorizingTransport, HttpExecutor},
};

/// Unauthenticated endpoints: sign-in flows and token refresh.
pub struct AuthApi {
    executor: Arc<dyn HttpExecutor>,
}

impl AuthApi {
    pub fn new(executor: Arc<dyn HttpExecutor>) -> Self {
        Self { executor }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(Credential, UserProfile)> {
        let request = ApiRequest::post("/auth/login")
            .unauthenticated()
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })?;
        self.authenticate(request).await
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<(Credential, UserProfile)> {
        let request = ApiRequest::post("/auth/register")
            .unauthenticated()
            .json(&RegisterRequest {
                email: email.to_string(),
                password: password.to_string(),
                display_name: display_name.to_string(),
            })?;
        self.authenticate(request).await
    }

    pub async fn social_sign_in(
        &self,
        provider: SocialProvider,
        id_token: &str,
    ) -> Result<(Credential, UserProfile)> {
        let request = ApiRequest::post("/auth/social")
            .unauthenticated()
            .json(&SocialSignInRequest {
                provider,
                id_token: id_token.to_string(),
            })?;
        self.authenticate(request).await
    }

    async fn authenticate(&self, request: ApiRequest) -> Result<(Credential, UserProfile)> {
        let response: AuthResponse = execute_json(self.executor.as_ref(), &request).await?;
        Ok(mapping::credential_from_auth(response, Utc::now()))
    }
}

#[async_trait]
impl TokenRefresher for AuthApi {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let request = ApiRequest::post("/auth/refresh")
            .unauthenticated()
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })?;
        execute_json(self.executor.as_ref(), &request).await
    }
}

/// Authenticated chat endpoints. Every call goes through the authorizing transport.
pub struct ChatApi {
    transport: AuthorizingTransport,
}

impl ChatApi {
    pub fn new(transport: AuthorizingTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &AuthorizingTransport {
        &self.transport
    }

    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let request = ApiRequest::post("/messages")
            .json::<SendMessageRequest>(&mapping::send_request_from_message(message))?;
        self.transport.send_unit(&request).await
    }

    pub async fn fetch_conversations(
        &self,
        current_user: &UserId,
    ) -> Result<Vec<ConversationSummary>> {
        let payloads: Vec<ConversationPayload> = self
            .transport
            .send_json(&ApiRequest::get("/conversations"))
            .await?;
        let now = Utc::now();
        Ok(payloads
            .iter()
            .map(|payload| mapping::summary_from_conversation_payload(payload, current_user, now))
            .collect())
    }

    pub async fn fetch_conversation(
        &self,
        partner: &UserId,
        since_ms: Option<i64>,
    ) -> Result<Vec<Message>> {
        let mut request = ApiRequest::get(format!(
            "/conversations/{}/messages",
            path_segment(partner.as_str())
        ));
        if let Some(since_ms) = since_ms {
            request = request.query("since", since_ms.to_string());
        }
        let payloads: Vec<MessagePayload> = self.transport.send_json(&request).await?;
        Ok(payloads.into_iter().map(mapping::message_from_payload).collect())
    }

    pub async fn mark_read(&self, partner: &UserId) -> Result<u64> {
        let request = ApiRequest::post(format!(
            "/conversations/{}/read",
            path_segment(partner.as_str())
        ));
        let response: MarkReadResponse = self.transport.send_json(&request).await?;
        Ok(response.updated)
    }

    pub async fn delete_conversation(&self, partner: &UserId) -> Result<()> {
        let request = ApiRequest::delete(format!(
            "/conversations/{}",
            path_segment(partner.as_str())
        ));
        self.transport.send_unit(&request).await
    }

    pub async fn fetch_profile(&self) -> Result<UserProfile> {
        self.transport.send_json(&ApiRequest::get("/me")).await
    }
}

fn path_segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partner_ids_are_escaped_in_paths() {
        assert_eq!(path_segment("plain"), "plain");
        assert_eq!(path_segment("a/b c"), "a%2Fb+c");
    }
}
