use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hn_core::wire::{DeviceInfo, LoginData, LoginRequest, LoginSession, TokenGrant, TokenValidation};
use hn_core::{SessionInfo, User, UserStatus};
use hn_error::{HnError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::{AuthGateway, Endpoint};
use crate::jwt::{Claims, JwtService};
use crate::permissions::SystemRole;

/// 登录失败的业务码
pub const CODE_BAD_CREDENTIALS: i64 = 1001;
pub const CODE_ACCOUNT_DISABLED: i64 = 1002;
pub const CODE_SESSION_NOT_FOUND: i64 = 1004;

const REFRESH_TTL_DAYS: i64 = 7;

struct MockAccount {
    password: String,
    user: User,
}

struct MockSession {
    user_id: String,
    platform: String,
    device_info: DeviceInfo,
    // 只有最近一次签发的 refresh token 可用
    refresh_token: String,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
}

#[derive(Default)]
struct MockState {
    accounts: HashMap<String, MockAccount>,
    sessions: HashMap<String, MockSession>,
    calls: HashMap<Endpoint, usize>,
    refresh_failure: Option<HnError>,
    validate_failure: Option<HnError>,
}

/// 进程内身份服务，签发真实的 HS256 令牌
pub struct MockAuthGateway {
    jwt: JwtService,
    expires_in: i64,
    latency: std::time::Duration,
    state: Mutex<MockState>,
}

impl MockAuthGateway {
    pub fn new(secret: &str) -> Self {
        Self {
            jwt: JwtService::new(secret),
            expires_in: 3600,
            latency: std::time::Duration::ZERO,
            state: Mutex::new(MockState::default()),
        }
    }

    /// 预置 admin / reviewer / operator 三个账号
    pub fn with_default_accounts(secret: &str) -> Self {
        let gateway = Self::new(secret);
        gateway.add_account("admin", "admin123", SystemRole::SUPER_ADMIN, Some("系统管理员"));
        gateway.add_account("reviewer", "reviewer123", SystemRole::REVIEWER, Some("审核员"));
        gateway.add_account("operator", "operator123", SystemRole::OPERATOR, Some("运营"));
        gateway
    }

    /// 访问令牌有效期（秒）
    pub fn with_expires_in(mut self, secs: i64) -> Self {
        self.expires_in = secs;
        self
    }

    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    /// 按角色默认权限添加账号，返回生成的用户
    pub fn add_account(&self, username: &str, password: &str, role: &str, real_name: Option<&str>) -> User {
        let mut state = self.state.lock();
        let user = User {
            id: (state.accounts.len() + 1).to_string(),
            username: username.to_string(),
            real_name: real_name.map(str::to_string),
            role: role.to_string(),
            permissions: SystemRole::default_permissions(role)
                .into_iter()
                .map(str::to_string)
                .collect(),
            status: UserStatus::Active,
        };
        state.accounts.insert(
            username.to_string(),
            MockAccount {
                password: password.to_string(),
                user: user.clone(),
            },
        );
        user
    }

    pub fn set_user_status(&self, username: &str, status: UserStatus) {
        if let Some(account) = self.state.lock().accounts.get_mut(username) {
            account.user.status = status;
        }
    }

    /// 之后的 refresh 调用都以该错误失败；`None` 恢复正常
    pub fn set_refresh_failure(&self, failure: Option<HnError>) {
        self.state.lock().refresh_failure = failure;
    }

    pub fn set_validate_failure(&self, failure: Option<HnError>) {
        self.state.lock().validate_failure = failure;
    }

    /// 服务端吊销会话，模拟在其他设备上被踢下线
    pub fn revoke_server_side(&self, session_id: &str) -> bool {
        self.state.lock().sessions.remove(session_id).is_some()
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.state.lock().calls.get(&endpoint).copied().unwrap_or(0)
    }

    pub fn active_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    async fn enter(&self, endpoint: Endpoint) {
        *self.state.lock().calls.entry(endpoint).or_insert(0) += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn issue(&self, user: &User, session_id: &str) -> Result<(String, String)> {
        let access = self.jwt.issue_access_token(
            &user.id,
            &user.username,
            &user.role,
            session_id,
            Duration::seconds(self.expires_in),
        )?;
        let refresh = self.jwt.issue_refresh_token(
            &user.id,
            &user.username,
            &user.role,
            session_id,
            Duration::days(REFRESH_TTL_DAYS),
        )?;
        Ok((access, refresh))
    }

    /// 校验访问令牌，且对应会话未被吊销
    fn authenticate(&self, state: &MockState, access_token: &str) -> Result<Claims> {
        let claims = self.jwt.verify_access_token(access_token)?;
        if !state.sessions.contains_key(&claims.session_id) {
            return Err(HnError::auth_expired("session revoked"));
        }
        Ok(claims)
    }
}

#[async_trait]
impl AuthGateway for MockAuthGateway {
    async fn login(&self, request: &LoginRequest) -> Result<LoginData> {
        self.enter(Endpoint::Login).await;

        let user = {
            let state = self.state.lock();
            match state.accounts.get(&request.username) {
                Some(account) if account.password == request.password => account.user.clone(),
                _ => {
                    return Err(HnError::Business {
                        code: CODE_BAD_CREDENTIALS,
                        message: "用户名或密码错误".to_string(),
                    })
                }
            }
        };
        if matches!(user.status, UserStatus::Inactive | UserStatus::Suspended) {
            return Err(HnError::Business {
                code: CODE_ACCOUNT_DISABLED,
                message: "账号已停用".to_string(),
            });
        }

        let session_id = format!("sess_{}", Uuid::new_v4().simple());
        let (access_token, refresh_token) = self.issue(&user, &session_id)?;
        let now = Utc::now();
        self.state.lock().sessions.insert(
            session_id.clone(),
            MockSession {
                user_id: user.id.clone(),
                platform: request.platform.clone(),
                device_info: request.device_info.clone(),
                refresh_token: refresh_token.clone(),
                created_at: now,
                last_active_at: now,
            },
        );
        info!(username = %user.username, session_id = %session_id, "mock login");

        Ok(LoginData {
            user,
            session: LoginSession {
                access_token,
                refresh_token,
                session_id: Some(session_id),
                expires_in: self.expires_in,
            },
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.enter(Endpoint::Refresh).await;

        if let Some(failure) = self.state.lock().refresh_failure.clone() {
            warn!("mock refresh failure injected");
            return Err(failure);
        }

        let claims = self.jwt.verify_refresh_token(refresh_token)?;
        let user = {
            let state = self.state.lock();
            let session = state
                .sessions
                .get(&claims.session_id)
                .ok_or_else(|| HnError::auth_expired("session revoked"))?;
            if session.refresh_token != refresh_token {
                return Err(HnError::auth_expired("refresh token already rotated"));
            }
            state
                .accounts
                .values()
                .find(|a| a.user.id == session.user_id)
                .map(|a| a.user.clone())
                .ok_or_else(|| HnError::auth_expired("account removed"))?
        };

        let (access_token, new_refresh) = self.issue(&user, &claims.session_id)?;
        if let Some(session) = self.state.lock().sessions.get_mut(&claims.session_id) {
            session.refresh_token = new_refresh.clone();
            session.last_active_at = Utc::now();
        }
        debug!(session_id = %claims.session_id, "mock refresh");

        Ok(TokenGrant {
            access_token,
            refresh_token: Some(new_refresh),
            session_id: Some(claims.session_id),
            expires_in: self.expires_in,
        })
    }

    async fn validate(&self, access_token: &str) -> Result<TokenValidation> {
        self.enter(Endpoint::Validate).await;

        let state = self.state.lock();
        if let Some(failure) = state.validate_failure.clone() {
            return Err(failure);
        }
        match self.authenticate(&state, access_token) {
            Ok(claims) => Ok(TokenValidation {
                valid: true,
                expires_at: Some(claims.expires_at()),
                user_id: Some(claims.sub),
                role: Some(claims.role),
                session_id: Some(claims.session_id),
            }),
            Err(_) => Ok(TokenValidation::invalid()),
        }
    }

    async fn logout(&self, access_token: &str) -> Result<()> {
        self.enter(Endpoint::Logout).await;

        let mut state = self.state.lock();
        let claims = self.authenticate(&state, access_token)?;
        state.sessions.remove(&claims.session_id);
        Ok(())
    }

    async fn current_user(&self, access_token: &str) -> Result<User> {
        self.enter(Endpoint::CurrentUser).await;

        let state = self.state.lock();
        let claims = self.authenticate(&state, access_token)?;
        state
            .accounts
            .values()
            .find(|a| a.user.id == claims.sub)
            .map(|a| a.user.clone())
            .ok_or_else(|| HnError::auth_expired("account removed"))
    }

    async fn list_sessions(&self, access_token: &str) -> Result<Vec<SessionInfo>> {
        self.enter(Endpoint::SessionList).await;

        let state = self.state.lock();
        let claims = self.authenticate(&state, access_token)?;
        let mut sessions: Vec<SessionInfo> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.user_id == claims.sub)
            .map(|(id, s)| SessionInfo {
                session_id: id.clone(),
                platform: s.platform.clone(),
                device_info: Some(s.device_info.clone()),
                ip_address: Some("127.0.0.1".to_string()),
                location: None,
                status: Some("active".to_string()),
                is_current: *id == claims.session_id,
                created_at: s.created_at,
                last_active_at: s.last_active_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn revoke_session(&self, access_token: &str, session_id: &str) -> Result<()> {
        self.enter(Endpoint::SessionRevoke).await;

        let mut state = self.state.lock();
        let claims = self.authenticate(&state, access_token)?;
        match state.sessions.get(session_id) {
            Some(s) if s.user_id == claims.sub => {
                state.sessions.remove(session_id);
                Ok(())
            }
            _ => Err(HnError::Business {
                code: CODE_SESSION_NOT_FOUND,
                message: "会话不存在".to_string(),
            }),
        }
    }

    async fn revoke_other_sessions(&self, access_token: &str) -> Result<u64> {
        self.enter(Endpoint::SessionRevokeOthers).await;

        let mut state = self.state.lock();
        let claims = self.authenticate(&state, access_token)?;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|id, s| s.user_id != claims.sub || *id == claims.session_id);
        Ok((before - state.sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_request(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.into(),
            password: password.into(),
            platform: "oa".into(),
            device_info: DeviceInfo {
                device_id: "oa_web_test".into(),
                device_type: "web".into(),
                device_name: "test".into(),
                app_version: "1.0.0".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_login_and_refresh_rotation() {
        let gateway = MockAuthGateway::with_default_accounts("mock-secret");
        let data = gateway.login(&login_request("reviewer", "reviewer123")).await.unwrap();
        assert_eq!(data.user.role, "reviewer");
        assert!(data.user.permissions.contains("loan_approve"));

        let grant = gateway.refresh(&data.session.refresh_token).await.unwrap();
        assert_eq!(grant.session_id, data.session.session_id);

        // 旧的 refresh token 已失效
        let reused = gateway.refresh(&data.session.refresh_token).await.unwrap_err();
        assert!(reused.is_auth_expired());
        assert_eq!(gateway.calls(Endpoint::Refresh), 2);
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let gateway = MockAuthGateway::with_default_accounts("mock-secret");
        let err = gateway.login(&login_request("admin", "wrong")).await.unwrap_err();
        assert!(matches!(err, HnError::Business { code: CODE_BAD_CREDENTIALS, .. }));
    }

    #[tokio::test]
    async fn test_suspended_account_cannot_login() {
        let gateway = MockAuthGateway::with_default_accounts("mock-secret");
        gateway.set_user_status("operator", UserStatus::Suspended);
        let err = gateway.login(&login_request("operator", "operator123")).await.unwrap_err();
        assert!(matches!(err, HnError::Business { code: CODE_ACCOUNT_DISABLED, .. }));
    }

    #[tokio::test]
    async fn test_revoke_other_sessions() {
        let gateway = MockAuthGateway::with_default_accounts("mock-secret");
        let first = gateway.login(&login_request("admin", "admin123")).await.unwrap();
        gateway.login(&login_request("admin", "admin123")).await.unwrap();
        gateway.login(&login_request("reviewer", "reviewer123")).await.unwrap();

        let token = &first.session.access_token;
        let listed = gateway.list_sessions(token).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed.iter().filter(|s| s.is_current).count(), 1);

        assert_eq!(gateway.revoke_other_sessions(token).await.unwrap(), 1);
        assert_eq!(gateway.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_validate_after_server_side_revoke() {
        let gateway = MockAuthGateway::with_default_accounts("mock-secret");
        let data = gateway.login(&login_request("admin", "admin123")).await.unwrap();
        let token = data.session.access_token.clone();
        assert!(gateway.validate(&token).await.unwrap().valid);

        let session_id = data.session.session_id.unwrap();
        assert!(gateway.revoke_server_side(&session_id));
        assert!(!gateway.validate(&token).await.unwrap().valid);
    }
}
