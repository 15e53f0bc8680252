use chrono::Duration;
use hn_error::{HnError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::gateway::{AuthGateway, ContractPreset, GatewayContract};
use crate::guard::{RouteGuard, RoutePaths};
use crate::http_gateway::{HttpAuthGateway, HttpGatewayConfig};
use crate::manager::{AuthManager, DeviceProfile};
use crate::mock_gateway::MockAuthGateway;
use crate::permissions::{PermissionEvaluator, SystemRole};
use crate::routes::{RouteDefinition, RouteTable};
use crate::session::{SessionStore, DEFAULT_REFRESH_LEAD_SECS};
use crate::storage::{KeyValueStorage, LayoutPreset, MemoryStorage, SledStorage, StorageLayout};

/// 提前刷新窗口与模拟令牌有效期的上限：30天
const MAX_DURATION_SECS: i64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    #[default]
    Live,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub mode: GatewayMode,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub contract: ContractPreset,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_mock_secret")]
    pub mock_secret: String,
    #[serde(default = "default_mock_expires_in")]
    pub mock_expires_in: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::default(),
            base_url: default_base_url(),
            contract: ContractPreset::default(),
            timeout_ms: default_timeout_ms(),
            mock_secret: default_mock_secret(),
            mock_expires_in: default_mock_expires_in(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub layout: LayoutPreset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_preemptive_refresh_secs")]
    pub preemptive_refresh_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preemptive_refresh_secs: default_preemptive_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_home_path")]
    pub home_path: String,
    #[serde(default = "default_forbidden_path")]
    pub forbidden_path: String,
    #[serde(default)]
    pub validate_on_navigation: bool,
    #[serde(default = "default_superuser_role")]
    pub superuser_role: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            home_path: default_home_path(),
            forbidden_path: default_forbidden_path(),
            validate_on_navigation: false,
            superuser_role: default_superuser_role(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_mock_secret() -> String {
    "hn-mock-secret".to_string()
}

fn default_mock_expires_in() -> i64 {
    3600
}

fn default_preemptive_refresh_secs() -> i64 {
    DEFAULT_REFRESH_LEAD_SECS
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_home_path() -> String {
    "/dashboard".to_string()
}

fn default_forbidden_path() -> String {
    "/403".to_string()
}

fn default_superuser_role() -> String {
    SystemRole::SUPER_ADMIN.to_string()
}

/// 认证模块配置，对应 `configs/default.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub device: DeviceProfile,
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

/// 组装完成的服务对象
pub struct AuthServices {
    pub manager: Arc<AuthManager>,
    pub guard: Arc<RouteGuard>,
}

impl AuthConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: AuthConfig = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| HnError::Configuration {
            key: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&s)
    }

    /// 用进程环境变量覆盖
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("HN_GATEWAY_URL") {
            self.gateway.base_url = url;
        }
        if let Some(mode) = lookup("HN_GATEWAY_MODE") {
            self.gateway.mode = match mode.trim().to_ascii_lowercase().as_str() {
                "live" => GatewayMode::Live,
                "mock" => GatewayMode::Mock,
                other => {
                    return Err(HnError::Configuration {
                        key: "HN_GATEWAY_MODE".to_string(),
                        reason: format!("expected live|mock, got '{}'", other),
                    })
                }
            };
        }
        if let Some(path) = lookup("HN_STORAGE_PATH") {
            self.storage.backend = StorageBackend::Sled;
            self.storage.path = Some(path);
        }
        if let Some(secs) = lookup("HN_PREEMPTIVE_REFRESH_SECS") {
            self.session.preemptive_refresh_secs =
                secs.trim().parse().map_err(|_| HnError::Configuration {
                    key: "HN_PREEMPTIVE_REFRESH_SECS".to_string(),
                    reason: format!("not an integer: '{}'", secs),
                })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_DURATION_SECS).contains(&self.session.preemptive_refresh_secs) {
            return Err(HnError::Configuration {
                key: "session.preemptive_refresh_secs".to_string(),
                reason: format!("must be within 0..={}", MAX_DURATION_SECS),
            });
        }
        if !(1..=MAX_DURATION_SECS).contains(&self.gateway.mock_expires_in) {
            return Err(HnError::Configuration {
                key: "gateway.mock_expires_in".to_string(),
                reason: format!("must be within 1..={}", MAX_DURATION_SECS),
            });
        }
        if self.gateway.timeout_ms == 0 {
            return Err(HnError::Configuration {
                key: "gateway.timeout_ms".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.gateway.mode == GatewayMode::Live && self.gateway.base_url.trim().is_empty() {
            return Err(HnError::Configuration {
                key: "gateway.base_url".to_string(),
                reason: "required in live mode".to_string(),
            });
        }
        for (key, path) in [
            ("guard.login_path", &self.guard.login_path),
            ("guard.home_path", &self.guard.home_path),
            ("guard.forbidden_path", &self.guard.forbidden_path),
        ] {
            if !path.starts_with('/') {
                return Err(HnError::Configuration {
                    key: key.to_string(),
                    reason: format!("must be an absolute path, got '{}'", path),
                });
            }
        }
        Ok(())
    }

    pub fn route_paths(&self) -> RoutePaths {
        RoutePaths {
            login: self.guard.login_path.clone(),
            home: self.guard.home_path.clone(),
            forbidden: self.guard.forbidden_path.clone(),
        }
    }

    fn open_storage(&self) -> Result<Arc<dyn KeyValueStorage>> {
        Ok(match self.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::Sled => {
                let path = self.storage.path.as_deref().ok_or_else(|| HnError::Configuration {
                    key: "storage.path".to_string(),
                    reason: "required for sled backend".to_string(),
                })?;
                Arc::new(SledStorage::open(path)?)
            }
        })
    }

    fn make_gateway(&self) -> Result<Arc<dyn AuthGateway>> {
        Ok(match self.gateway.mode {
            GatewayMode::Mock => Arc::new(
                MockAuthGateway::with_default_accounts(&self.gateway.mock_secret)
                    .with_expires_in(self.gateway.mock_expires_in),
            ),
            GatewayMode::Live => Arc::new(HttpAuthGateway::new(HttpGatewayConfig {
                base_url: self.gateway.base_url.clone(),
                contract: GatewayContract::from_preset(self.gateway.contract),
                timeout_ms: self.gateway.timeout_ms,
            })?),
        })
    }

    /// 按配置组装存储、网关、认证服务与导航守卫
    pub fn build(&self) -> Result<AuthServices> {
        self.validate()?;

        let store = Arc::new(
            SessionStore::new(
                self.open_storage()?,
                StorageLayout::from_preset(self.storage.layout),
            )
            .with_refresh_lead(Duration::seconds(self.session.preemptive_refresh_secs)),
        );
        let gateway = self.make_gateway()?;
        let evaluator = PermissionEvaluator::new(self.guard.superuser_role.clone());

        let manager = Arc::new(
            AuthManager::new(store, gateway.clone(), self.device.clone())
                .with_evaluator(evaluator.clone()),
        );
        let guard = Arc::new(
            RouteGuard::new(
                manager.coordinator().clone(),
                gateway,
                RouteTable::new(&self.routes),
                self.route_paths(),
            )
            .with_evaluator(evaluator)
            .with_validation(self.guard.validate_on_navigation),
        );

        info!(
            mode = ?self.gateway.mode,
            contract = ?self.gateway.contract,
            backend = ?self.storage.backend,
            layout = ?self.storage.layout,
            routes = self.routes.len(),
            "auth services ready"
        );
        Ok(AuthServices { manager, guard })
    }
}
