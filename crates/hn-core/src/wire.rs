//! 身份服务 HTTP 契约的请求/响应结构

use chrono::{DateTime, Utc};
use hn_error::{HnError, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::User;

/// 统一响应信封 `{ code, message, data }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// 按成功码拆信封；401/403 业务码与 HTTP 状态同义
    pub fn into_result(self, success_code: i64) -> Result<Option<T>> {
        if self.code == success_code {
            return Ok(self.data);
        }
        Err(match self.code {
            401 => HnError::AuthExpired {
                reason: non_empty(self.message, "登录已过期"),
            },
            403 => HnError::PermissionDenied {
                operation: non_empty(self.message, "权限不足"),
            },
            code => HnError::Business {
                code,
                message: self.message,
            },
        })
    }

    /// 需要 data 的接口，缺失时视为序列化错误
    pub fn into_data(self, success_code: i64) -> Result<T> {
        self.into_result(success_code)?
            .ok_or_else(|| HnError::Serialization {
                format: "json".to_string(),
                message: "response envelope has no data".to_string(),
            })
    }
}

fn non_empty(message: String, fallback: &str) -> String {
    if message.is_empty() {
        fallback.to_string()
    } else {
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: String,
    pub device_name: String,
    pub app_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub platform: String,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginSession {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginData {
    pub user: User,
    pub session: LoginSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// 刷新接口返回；部分后端不轮换 refresh_token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub expires_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenValidation {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            user_id: None,
            role: None,
            session_id: None,
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeSessionRequest {
    #[serde(rename = "session_id_to_revoke")]
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeOthersResponse {
    pub revoked_count: u64,
}

fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Num(i64),
    }

    Ok(Option::<Id>::deserialize(deserializer)?.map(|id| match id {
        Id::Str(s) => s,
        Id::Num(n) => n.to_string(),
    }))
}
