use async_trait::async_trait;
use hn_core::wire::{
    ApiEnvelope, LoginData, LoginRequest, RefreshRequest, RevokeOthersResponse,
    RevokeSessionRequest, TokenGrant, TokenValidation,
};
use hn_core::{SessionInfo, User};
use hn_error::{HnError, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::gateway::{AuthGateway, Endpoint, GatewayContract};

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub contract: GatewayContract,
    pub timeout_ms: u64,
}

/// 基于 reqwest 的身份服务客户端
#[derive(Clone)]
pub struct HttpAuthGateway {
    http: Client,
    cfg: HttpGatewayConfig,
}

impl HttpAuthGateway {
    pub fn new(cfg: HttpGatewayConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| HnError::Configuration {
                key: "gateway".to_string(),
                reason: format!("Failed to build http client: {}", e),
            })?;
        Ok(Self { http, cfg })
    }

    fn url(&self, endpoint: Endpoint) -> String {
        self.cfg.contract.url(&self.cfg.base_url, endpoint)
    }

    /// 发送请求并解析信封；HTTP 401/403 与业务码 401/403 同义
    async fn envelope<T: DeserializeOwned>(
        &self,
        operation: &str,
        req: RequestBuilder,
    ) -> Result<ApiEnvelope<T>> {
        let resp = req.send().await.map_err(|e| self.transport_error(operation, e))?;

        let status = resp.status();
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            debug!(operation, status = status.as_u16(), "gateway returned error status");
            return Err(match status {
                StatusCode::UNAUTHORIZED => HnError::AuthExpired {
                    reason: format!("{} rejected: status={}", operation, status),
                },
                StatusCode::FORBIDDEN => HnError::permission_denied(operation),
                _ => HnError::Http {
                    status: status.as_u16(),
                    message: format!("status={} body={}", status, txt),
                },
            });
        }

        resp.json().await.map_err(|e| HnError::Serialization {
            format: "json".to_string(),
            message: format!("{}: {}", operation, e),
        })
    }

    async fn send<T: DeserializeOwned>(&self, operation: &str, req: RequestBuilder) -> Result<Option<T>> {
        self.envelope::<T>(operation, req)
            .await?
            .into_result(self.cfg.contract.success_code)
    }

    async fn send_data<T: DeserializeOwned>(&self, operation: &str, req: RequestBuilder) -> Result<T> {
        self.envelope::<T>(operation, req)
            .await?
            .into_data(self.cfg.contract.success_code)
    }

    fn transport_error(&self, operation: &str, e: reqwest::Error) -> HnError {
        if e.is_timeout() {
            HnError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.cfg.timeout_ms,
            }
        } else {
            HnError::network(operation, e)
        }
    }
}

#[async_trait]
impl AuthGateway for HttpAuthGateway {
    #[instrument(skip(self, request), fields(username = %request.username))]
    async fn login(&self, request: &LoginRequest) -> Result<LoginData> {
        let req = self.http.post(self.url(Endpoint::Login)).json(request);
        self.send_data("login", req).await
    }

    #[instrument(skip(self, refresh_token))]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let body = RefreshRequest {
            refresh_token: refresh_token.to_string(),
        };
        let req = self.http.post(self.url(Endpoint::Refresh)).json(&body);
        self.send_data("refresh", req).await
    }

    #[instrument(skip(self, access_token))]
    async fn validate(&self, access_token: &str) -> Result<TokenValidation> {
        let req = self
            .http
            .get(self.url(Endpoint::Validate))
            .bearer_auth(access_token);
        self.send_data("validate", req).await
    }

    #[instrument(skip(self, access_token))]
    async fn logout(&self, access_token: &str) -> Result<()> {
        let req = self
            .http
            .post(self.url(Endpoint::Logout))
            .bearer_auth(access_token);
        self.send::<serde_json::Value>("logout", req).await?;
        Ok(())
    }

    #[instrument(skip(self, access_token))]
    async fn current_user(&self, access_token: &str) -> Result<User> {
        let req = self
            .http
            .get(self.url(Endpoint::CurrentUser))
            .bearer_auth(access_token);
        self.send_data("current_user", req).await
    }

    #[instrument(skip(self, access_token))]
    async fn list_sessions(&self, access_token: &str) -> Result<Vec<SessionInfo>> {
        let req = self
            .http
            .get(self.url(Endpoint::SessionList))
            .bearer_auth(access_token);
        Ok(self
            .send::<Vec<SessionInfo>>("list_sessions", req)
            .await?
            .unwrap_or_default())
    }

    #[instrument(skip(self, access_token))]
    async fn revoke_session(&self, access_token: &str, session_id: &str) -> Result<()> {
        let body = RevokeSessionRequest {
            session_id: session_id.to_string(),
        };
        let req = self
            .http
            .post(self.url(Endpoint::SessionRevoke))
            .bearer_auth(access_token)
            .json(&body);
        self.send::<serde_json::Value>("revoke_session", req).await?;
        Ok(())
    }

    #[instrument(skip(self, access_token))]
    async fn revoke_other_sessions(&self, access_token: &str) -> Result<u64> {
        let req = self
            .http
            .post(self.url(Endpoint::SessionRevokeOthers))
            .bearer_auth(access_token);
        let resp: RevokeOthersResponse = self.send_data("revoke_other_sessions", req).await?;
        Ok(resp.revoked_count)
    }
}
