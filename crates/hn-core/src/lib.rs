use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

pub mod wire;

/// 当前登录会话（令牌与过期时间）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// 由登录或刷新响应构造，`expires_in` 单位为秒
    ///
    /// `expires_in` 来自服务端，超出时间范围时返回错误。
    pub fn issued(
        access_token: String,
        refresh_token: String,
        session_id: Option<String>,
        expires_in: i64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let expires_at = Duration::try_seconds(expires_in)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| Error::InvalidRequest {
                reason: format!("expires_in out of range: {}", expires_in),
            })?;
        Ok(Self {
            access_token,
            refresh_token,
            session_id,
            expires_at,
        })
    }

    /// 有效当且仅当访问令牌非空且尚未到期
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && now < self.expires_at
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// 是否已进入提前刷新窗口
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, lead: Duration) -> bool {
        self.has_refresh_token()
            && self
                .expires_at
                .checked_sub_signed(lead)
                .map_or(true, |start| now >= start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    #[default]
    Pending,
    #[serde(other)]
    Unknown,
}

/// 登录用户资料，随登录/刷新整体替换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub real_name: Option<String>,
    pub role: String,
    #[serde(default)]
    pub permissions: HashSet<String>,
    #[serde(default)]
    pub status: UserStatus,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.real_name.as_deref().unwrap_or(&self.username)
    }
}

/// 单次导航请求，由路由元数据派生
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NavigationRequest {
    pub target_path: String,
    pub is_public: bool,
    pub required_roles: HashSet<String>,
    pub required_permissions: HashSet<String>,
}

impl NavigationRequest {
    pub fn public(target_path: impl Into<String>) -> Self {
        Self {
            target_path: target_path.into(),
            is_public: true,
            ..Default::default()
        }
    }

    pub fn protected(target_path: impl Into<String>) -> Self {
        Self {
            target_path: target_path.into(),
            ..Default::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// 去掉查询串和锚点后的路径，用于路由匹配
    pub fn route_path(&self) -> &str {
        strip_query(&self.target_path)
    }
}

pub fn strip_query(path: &str) -> &str {
    let end = path.find(|c| c == '?' || c == '#').unwrap_or(path.len());
    &path[..end]
}

/// 用户在其他设备上的活跃会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub platform: String,
    #[serde(default)]
    pub device_info: Option<wire::DeviceInfo>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// 后端不同版本的 id 可能是数字也可能是字符串
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Num(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Num(n) => n.to_string(),
    })
}

pub use hn_error::{HnError as Error, Result};
