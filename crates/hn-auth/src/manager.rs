use hn_core::wire::{DeviceInfo, LoginRequest, TokenValidation};
use hn_core::{Session, SessionInfo, User};
use hn_error::{ErrorMetadataBuilder, HnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::gateway::AuthGateway;
use crate::permissions::PermissionEvaluator;
use crate::refresh::TokenRefreshCoordinator;
use crate::session::{clear_or_warn, SessionStore};

/// 登录时上报的客户端信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub platform: String,
    pub device_type: String,
    pub device_name: String,
    pub app_version: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            platform: "oa".to_string(),
            device_type: "web".to_string(),
            device_name: "hn-console".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// 认证服务对象，登录、登出与带令牌的请求都经由它
pub struct AuthManager {
    store: Arc<SessionStore>,
    gateway: Arc<dyn AuthGateway>,
    coordinator: Arc<TokenRefreshCoordinator>,
    evaluator: PermissionEvaluator,
    device: DeviceProfile,
}

impl AuthManager {
    pub fn new(store: Arc<SessionStore>, gateway: Arc<dyn AuthGateway>, device: DeviceProfile) -> Self {
        let coordinator = Arc::new(TokenRefreshCoordinator::new(store.clone(), gateway.clone()));
        Self {
            store,
            gateway,
            coordinator,
            evaluator: PermissionEvaluator::default(),
            device,
        }
    }

    pub fn with_evaluator(mut self, evaluator: PermissionEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<TokenRefreshCoordinator> {
        &self.coordinator
    }

    pub fn current_user(&self) -> Option<User> {
        self.store.current_user()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_valid()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.current_user().is_some_and(|user| {
            self.evaluator.check(
                &user,
                &HashSet::new(),
                &HashSet::from([permission.to_string()]),
            )
        })
    }

    /// 当前用户的角色是否在给定列表中
    pub fn has_role(&self, roles: &[&str]) -> bool {
        self.current_user()
            .is_some_and(|user| roles.contains(&user.role.as_str()))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(HnError::InvalidRequest {
                reason: "用户名和密码不能为空".to_string(),
            });
        }

        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
            platform: self.device.platform.clone(),
            device_info: DeviceInfo {
                device_id: self.store.device_id(&self.device.platform)?,
                device_type: self.device.device_type.clone(),
                device_name: self.device.device_name.clone(),
                app_version: self.device.app_version.clone(),
            },
        };

        let data = match self.gateway.login(&request).await {
            Ok(data) => data,
            Err(e) => {
                e.log(
                    &ErrorMetadataBuilder::new("auth_manager")
                        .operation("login")
                        .context("username", username)
                        .build(&e),
                );
                return Err(e);
            }
        };

        let session = Session::issued(
            data.session.access_token,
            data.session.refresh_token,
            data.session.session_id,
            data.session.expires_in,
            self.store.clock().now(),
        )?;
        self.store.save(&session, &data.user)?;
        info!(
            user_id = %data.user.id,
            username = %data.user.username,
            role = %data.user.role,
            "login succeeded"
        );
        Ok(data.user)
    }

    /// 通知服务端后清空本地会话；服务端失败不影响本地登出
    pub async fn logout(&self) -> Result<()> {
        if let Some(token) = self.store.access_token() {
            if let Err(e) = self.gateway.logout(&token).await {
                warn!(error = %e, "server logout failed; clearing local session anyway");
            }
        }
        self.store.clear()?;
        info!("logged out");
        Ok(())
    }

    /// 服务端校验当前令牌；无效时清空会话
    pub async fn validate(&self) -> Result<TokenValidation> {
        let Some(token) = self.store.access_token() else {
            return Err(HnError::auth_expired("not logged in"));
        };
        match self.gateway.validate(&token).await {
            Ok(validation) if validation.valid => Ok(validation),
            Ok(_) => {
                clear_or_warn(&self.store, "validate");
                Err(HnError::auth_expired("token rejected by server"))
            }
            Err(e) => {
                warn!(error = %e, "token validation failed");
                clear_or_warn(&self.store, "validate");
                Err(match e {
                    HnError::AuthExpired { .. } => e,
                    other => HnError::auth_expired(format!("validation failed: {}", other)),
                })
            }
        }
    }

    /// 启动时恢复会话；已进入提前刷新窗口则静默刷新一次
    pub async fn restore(&self) -> Result<Option<Session>> {
        let Some(session) = self.store.load()? else {
            return Ok(None);
        };
        if !self.store.should_preemptively_refresh() {
            return Ok(Some(session));
        }
        match self.coordinator.refresh().await {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                debug!(error = %e, "silent refresh on restore failed");
                Ok(None)
            }
        }
    }

    /// 携带访问令牌执行请求
    ///
    /// 令牌过期时刷新一次并重试一次；其他错误原样返回。
    pub async fn authorized<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.store.is_valid() || self.store.should_preemptively_refresh() {
            self.coordinator.refresh().await?;
        }
        let token = self.current_token()?;

        match op(token).await {
            Err(e) if e.is_auth_expired() => {
                debug!("request rejected with expired token; refreshing once");
                self.coordinator.refresh().await?;
                let token = self.current_token()?;
                match op(token).await {
                    Err(e) if e.is_auth_expired() => {
                        clear_or_warn(&self.store, "authorized_retry");
                        Err(e)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// 重新拉取当前用户资料并整体替换，令牌不变
    pub async fn fetch_user_info(&self) -> Result<User> {
        let generation = self.store.generation();
        let gateway = self.gateway.clone();
        let user = self
            .authorized(move |token| {
                let gateway = gateway.clone();
                async move { gateway.current_user(&token).await }
            })
            .await?;
        if self.store.replace_user(&user, generation)? {
            debug!(user_id = %user.id, role = %user.role, "user profile updated");
        }
        Ok(user)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let gateway = self.gateway.clone();
        self.authorized(move |token| {
            let gateway = gateway.clone();
            async move { gateway.list_sessions(&token).await }
        })
        .await
    }

    /// 吊销其他设备上的会话；当前会话请使用 `logout`
    pub async fn revoke_session(&self, session_id: &str) -> Result<()> {
        let current = self.store.current_session().and_then(|s| s.session_id);
        if current.as_deref() == Some(session_id) {
            return Err(HnError::InvalidRequest {
                reason: "不能吊销当前会话".to_string(),
            });
        }
        let gateway = self.gateway.clone();
        let target = session_id.to_string();
        self.authorized(move |token| {
            let gateway = gateway.clone();
            let target = target.clone();
            async move { gateway.revoke_session(&token, &target).await }
        })
        .await?;
        info!(session_id = %session_id, "session revoked");
        Ok(())
    }

    pub async fn revoke_other_sessions(&self) -> Result<u64> {
        let gateway = self.gateway.clone();
        let count = self
            .authorized(move |token| {
                let gateway = gateway.clone();
                async move { gateway.revoke_other_sessions(&token).await }
            })
            .await?;
        info!(revoked = count, "other sessions revoked");
        Ok(count)
    }

    fn current_token(&self) -> Result<String> {
        self.store
            .access_token()
            .ok_or_else(|| HnError::auth_expired("session cleared"))
    }
}
