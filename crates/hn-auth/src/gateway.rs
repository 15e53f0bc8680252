use async_trait::async_trait;
use hn_core::wire::{LoginData, LoginRequest, TokenGrant, TokenValidation};
use hn_core::{SessionInfo, User};
use hn_error::Result;
use serde::{Deserialize, Serialize};

/// 身份服务接口
///
/// 核心逻辑只依赖这个窄接口；传输细节由实现决定。
#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<LoginData>;

    /// 用 refresh token 换取新的访问令牌
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    async fn validate(&self, access_token: &str) -> Result<TokenValidation>;

    async fn logout(&self, access_token: &str) -> Result<()>;

    /// 当前令牌对应的用户资料
    async fn current_user(&self, access_token: &str) -> Result<User>;

    async fn list_sessions(&self, access_token: &str) -> Result<Vec<SessionInfo>>;

    async fn revoke_session(&self, access_token: &str, session_id: &str) -> Result<()>;

    /// 返回被吊销的会话数
    async fn revoke_other_sessions(&self, access_token: &str) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Login,
    Refresh,
    Validate,
    Logout,
    CurrentUser,
    SessionList,
    SessionRevoke,
    SessionRevokeOthers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractPreset {
    #[default]
    Canonical,
    LegacyOa,
    LegacyUsers,
}

/// HTTP 契约：路径前缀、各端点路径与成功码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayContract {
    pub api_prefix: String,
    pub auth_prefix: String,
    pub session_prefix: String,
    pub success_code: i64,
}

impl GatewayContract {
    /// `/api/v1` + `/auth/*` + `/user/session/*`，成功码 200
    pub fn canonical() -> Self {
        Self {
            api_prefix: "/api/v1".to_string(),
            auth_prefix: "/auth".to_string(),
            session_prefix: "/user/session".to_string(),
            success_code: 200,
        }
    }

    /// OA 后台旧接口 `/api/oa/auth/*`
    pub fn legacy_oa() -> Self {
        Self {
            api_prefix: "/api".to_string(),
            auth_prefix: "/oa/auth".to_string(),
            session_prefix: "/user/session".to_string(),
            success_code: 200,
        }
    }

    /// 用户端，成功码 0
    pub fn legacy_users() -> Self {
        Self {
            success_code: 0,
            ..Self::canonical()
        }
    }

    pub fn from_preset(preset: ContractPreset) -> Self {
        match preset {
            ContractPreset::Canonical => Self::canonical(),
            ContractPreset::LegacyOa => Self::legacy_oa(),
            ContractPreset::LegacyUsers => Self::legacy_users(),
        }
    }

    pub fn path(&self, endpoint: Endpoint) -> String {
        let (prefix, tail) = match endpoint {
            Endpoint::Login => (&self.auth_prefix, "/login"),
            Endpoint::Refresh => (&self.auth_prefix, "/refresh"),
            Endpoint::Validate => (&self.auth_prefix, "/validate"),
            Endpoint::Logout => (&self.auth_prefix, "/logout"),
            Endpoint::CurrentUser => (&self.auth_prefix, "/me"),
            Endpoint::SessionList => (&self.session_prefix, "/list"),
            Endpoint::SessionRevoke => (&self.session_prefix, "/revoke"),
            Endpoint::SessionRevokeOthers => (&self.session_prefix, "/revoke-others"),
        };
        format!("{}{}{}", self.api_prefix, prefix, tail)
    }

    pub fn url(&self, base_url: &str, endpoint: Endpoint) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.path(endpoint))
    }
}

impl Default for GatewayContract {
    fn default() -> Self {
        Self::canonical()
    }
}
