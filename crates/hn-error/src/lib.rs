use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// 会话与鉴权生命周期的统一错误类型
///
/// 需要 `Clone`：同一次令牌刷新的结果会分发给所有等待者。
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HnError {
    // === 网关错误 ===
    #[error("网络错误: {operation}")]
    Network { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("HTTP错误: 状态码 {status}")]
    Http { status: u16, message: String },

    #[error("业务错误({code}): {message}")]
    Business { code: i64, message: String },

    // === 鉴权错误 ===
    #[error("登录已过期: {reason}")]
    AuthExpired { reason: String },

    #[error("权限不足: {operation}")]
    PermissionDenied { operation: String },

    #[error("请求无效: {reason}")]
    InvalidRequest { reason: String },

    // === 系统错误 ===
    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("存储错误: {operation}")]
    Storage { operation: String, message: String },

    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 网关或鉴权错误
    High,     // 本地存储、序列化等错误
    Critical, // 配置或内部错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

impl HnError {
    pub fn auth_expired(reason: impl Into<String>) -> Self {
        HnError::AuthExpired {
            reason: reason.into(),
        }
    }

    pub fn permission_denied(operation: impl Into<String>) -> Self {
        HnError::PermissionDenied {
            operation: operation.into(),
        }
    }

    pub fn network(operation: impl Into<String>, message: impl ToString) -> Self {
        HnError::Network {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(operation: impl Into<String>, message: impl ToString) -> Self {
        HnError::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, HnError::AuthExpired { .. })
    }

    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HnError::Business { .. } | HnError::InvalidRequest { .. } => ErrorSeverity::Low,
            HnError::AuthExpired { .. }
            | HnError::PermissionDenied { .. }
            | HnError::Network { .. }
            | HnError::Timeout { .. }
            | HnError::Http { .. } => ErrorSeverity::Medium,
            HnError::Serialization { .. } | HnError::Storage { .. } => ErrorSeverity::High,
            HnError::Configuration { .. } | HnError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low | ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    session_id = ?metadata.session_id,
                    error = %self,
                    context = ?metadata.context,
                    "认证流程错误"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    session_id = ?metadata.session_id,
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "严重错误"
                );
            }
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            HnError::Network { .. } => "网络连接失败，请检查网络设置".to_string(),
            HnError::Timeout { .. } => "请求超时，请检查网络连接".to_string(),
            HnError::Http { status: 404, .. } => "请求的资源不存在".to_string(),
            HnError::Http { status: 500, .. } => "服务器内部错误".to_string(),
            HnError::Http {
                status: 502..=504, ..
            } => "服务器暂时不可用，请稍后再试".to_string(),
            HnError::Http { status, .. } => format!("请求失败 ({})", status),
            HnError::Business { message, .. } if !message.is_empty() => message.clone(),
            HnError::Business { .. } => "请求失败".to_string(),
            HnError::AuthExpired { .. } => "登录已过期，请重新登录".to_string(),
            HnError::PermissionDenied { .. } => "权限不足，无法访问此页面".to_string(),
            HnError::InvalidRequest { .. } => "请求参数有误，请检查后重试".to_string(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                session_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn session_id(mut self, session_id: &str) -> Self {
        self.metadata.session_id = Some(session_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &HnError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, HnError>;

// === 转换实现 ===

impl From<serde_json::Error> for HnError {
    fn from(err: serde_json::Error) -> Self {
        HnError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for HnError {
    fn from(err: serde_yaml::Error) -> Self {
        HnError::Serialization {
            format: "yaml".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<sled::Error> for HnError {
    fn from(err: sled::Error) -> Self {
        HnError::Storage {
            operation: "sled".to_string(),
            message: err.to_string(),
        }
    }
}
