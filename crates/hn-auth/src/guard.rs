use hn_core::NavigationRequest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::gateway::AuthGateway;
use crate::permissions::PermissionEvaluator;
use crate::refresh::TokenRefreshCoordinator;
use crate::routes::RouteTable;
use crate::session::SessionStore;

/// 登录页、首页与无权限页
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePaths {
    pub login: String,
    pub home: String,
    pub forbidden: String,
}

impl Default for RoutePaths {
    fn default() -> Self {
        Self {
            login: "/login".to_string(),
            home: "/dashboard".to_string(),
            forbidden: "/403".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationDecision {
    Allow,
    /// 登录后回到 `resume`
    RedirectToLogin { resume: String },
    RedirectToForbidden,
    RedirectHome,
}

impl NavigationDecision {
    /// 重定向地址；放行时为 `None`
    pub fn location(&self, paths: &RoutePaths) -> Option<String> {
        match self {
            Self::Allow => None,
            Self::RedirectToLogin { resume } => {
                if resume.is_empty() || hn_core::strip_query(resume) == paths.login {
                    Some(paths.login.clone())
                } else {
                    Some(format!(
                        "{}?redirect={}",
                        paths.login,
                        urlencoding::encode(resume)
                    ))
                }
            }
            Self::RedirectToForbidden => Some(paths.forbidden.clone()),
            Self::RedirectHome => Some(paths.home.clone()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPhase {
    Start,
    CheckSession,
    Validating,
    Refreshing,
    CheckPermissions,
}

/// 单次导航的判定结果及经过的阶段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardOutcome {
    pub decision: NavigationDecision,
    pub phases: Vec<GuardPhase>,
}

/// 导航守卫
///
/// 每次导航最多刷新一次令牌；刷新或服务端校验失败都会清空会话并跳转登录页。
pub struct RouteGuard {
    store: Arc<SessionStore>,
    coordinator: Arc<TokenRefreshCoordinator>,
    gateway: Arc<dyn AuthGateway>,
    evaluator: PermissionEvaluator,
    routes: RouteTable,
    paths: RoutePaths,
    validate_on_navigation: bool,
}

impl RouteGuard {
    pub fn new(
        coordinator: Arc<TokenRefreshCoordinator>,
        gateway: Arc<dyn AuthGateway>,
        routes: RouteTable,
        paths: RoutePaths,
    ) -> Self {
        Self {
            store: coordinator.store().clone(),
            coordinator,
            gateway,
            evaluator: PermissionEvaluator::default(),
            routes,
            paths,
            validate_on_navigation: false,
        }
    }

    pub fn with_evaluator(mut self, evaluator: PermissionEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// 本地有效的会话也先到服务端校验一次
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_on_navigation = enabled;
        self
    }

    pub fn paths(&self) -> &RoutePaths {
        &self.paths
    }

    /// 按路由表解析目标路径后判定
    pub async fn navigate(&self, target: &str) -> GuardOutcome {
        let request = self.routes.resolve(target);
        self.evaluate(&request).await
    }

    #[instrument(skip(self, request), fields(target_path = %request.target_path))]
    pub async fn evaluate(&self, request: &NavigationRequest) -> GuardOutcome {
        let mut phases = vec![GuardPhase::Start];
        let generation = self.store.generation();
        let is_login_surface = request.route_path() == self.paths.login;

        if is_login_surface && self.store.is_valid() {
            return finish(NavigationDecision::RedirectHome, phases);
        }
        if request.is_public || is_login_surface {
            return finish(NavigationDecision::Allow, phases);
        }

        phases.push(GuardPhase::CheckSession);
        if !self.store.is_valid() || self.store.should_preemptively_refresh() {
            phases.push(GuardPhase::Refreshing);
            debug!("session stale; refreshing");
            if let Err(e) = self.coordinator.refresh().await {
                debug!(error = %e, "refresh failed; redirecting to login");
                self.discard_stale(generation);
                return finish(self.to_login(request), phases);
            }
        } else if self.validate_on_navigation {
            phases.push(GuardPhase::Validating);
            if !self.validate_remotely().await {
                self.discard_stale(generation);
                return finish(self.to_login(request), phases);
            }
        }

        phases.push(GuardPhase::CheckPermissions);
        // 刷新期间被登出时用户资料已不存在
        let Some(user) = self.store.current_user() else {
            return finish(self.to_login(request), phases);
        };
        match self.evaluator.evaluate(
            &user,
            &request.required_roles,
            &request.required_permissions,
        ) {
            Ok(()) => finish(NavigationDecision::Allow, phases),
            Err(e) => {
                debug!(user_id = %user.id, role = %user.role, reason = %e, "navigation forbidden");
                finish(NavigationDecision::RedirectToForbidden, phases)
            }
        }
    }

    async fn validate_remotely(&self) -> bool {
        let Some(token) = self.store.access_token() else {
            return false;
        };
        match self.gateway.validate(&token).await {
            Ok(validation) if validation.valid => true,
            Ok(_) => {
                debug!("server rejected session");
                false
            }
            Err(e) => {
                warn!(error = %e, "session validation failed");
                false
            }
        }
    }

    /// 只清除本次导航开始时看到的会话，不影响期间的新登录
    fn discard_stale(&self, generation: u64) {
        if let Err(e) = self.store.clear_if_generation(generation) {
            warn!(error = %e, "failed to clear stale session");
        }
    }

    fn to_login(&self, request: &NavigationRequest) -> NavigationDecision {
        NavigationDecision::RedirectToLogin {
            resume: request.target_path.clone(),
        }
    }
}

fn finish(decision: NavigationDecision, phases: Vec<GuardPhase>) -> GuardOutcome {
    debug!(?decision, ?phases, "navigation decided");
    GuardOutcome { decision, phases }
}
