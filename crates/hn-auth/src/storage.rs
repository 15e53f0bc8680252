use hn_error::{HnError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// 键值持久化后端
///
/// `apply` 必须原子：要么整组写入/删除，要么都不生效。
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// 批量写入，`None` 表示删除该键
    fn apply(&self, ops: &[(&str, Option<String>)]) -> Result<()>;

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.apply(&[(key, Some(value))])
    }
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn apply(&self, ops: &[(&str, Option<String>)]) -> Result<()> {
        let mut entries = self.entries.lock();
        for (key, value) in ops {
            match value {
                Some(v) => {
                    entries.insert((*key).to_string(), v.clone());
                }
                None => {
                    entries.remove(*key);
                }
            }
        }
        Ok(())
    }
}

/// 基于 sled 的磁盘存储，批量写入走 `apply_batch`
#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| HnError::Configuration {
            key: "storage.path".to_string(),
            reason: format!("Failed to open sled db: {}", e),
        })?;
        Ok(Self { db })
    }

    /// 临时库，进程退出即删除
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KeyValueStorage for SledStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.db.get(key)?;
        value
            .map(|v| {
                String::from_utf8(v.to_vec()).map_err(|e| HnError::Serialization {
                    format: "utf8".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    fn apply(&self, ops: &[(&str, Option<String>)]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in ops {
            match value {
                Some(v) => batch.insert(key.as_bytes(), v.as_bytes()),
                None => batch.remove(key.as_bytes()),
            }
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }
}

/// 持久化键名，各前端应用历史上各不相同
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: String,
    pub user: String,
    pub expires_at: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayoutPreset {
    #[default]
    Oa,
    Admin,
    Users,
}

impl StorageLayout {
    /// OA 管理后台
    pub fn oa() -> Self {
        Self::prefixed("oa_")
    }

    /// 后台管理（旧版）
    pub fn admin() -> Self {
        Self::prefixed("admin_")
    }

    /// 用户端
    pub fn users() -> Self {
        Self {
            access_token: "token".to_string(),
            refresh_token: "refreshToken".to_string(),
            session_id: "sessionId".to_string(),
            user: "userInfo".to_string(),
            expires_at: "loginExpireTime".to_string(),
            device_id: "deviceId".to_string(),
        }
    }

    fn prefixed(prefix: &str) -> Self {
        Self {
            access_token: format!("{}token", prefix),
            refresh_token: format!("{}refresh_token", prefix),
            session_id: format!("{}session_id", prefix),
            user: format!("{}user_info", prefix),
            expires_at: format!("{}expires_at", prefix),
            device_id: format!("{}device_id", prefix),
        }
    }

    pub fn from_preset(preset: LayoutPreset) -> Self {
        match preset {
            LayoutPreset::Oa => Self::oa(),
            LayoutPreset::Admin => Self::admin(),
            LayoutPreset::Users => Self::users(),
        }
    }

    /// 会话组的全部键（不含设备标识）
    pub fn session_keys(&self) -> [&str; 5] {
        [
            self.access_token.as_str(),
            self.refresh_token.as_str(),
            self.session_id.as_str(),
            self.user.as_str(),
            self.expires_at.as_str(),
        ]
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::oa()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_batch(storage: &dyn KeyValueStorage) {
        storage
            .apply(&[("a", Some("1".into())), ("b", Some("2".into()))])
            .unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(storage.get("b").unwrap().as_deref(), Some("2"));

        storage.apply(&[("a", None), ("b", None)]).unwrap();
        assert!(storage.get("a").unwrap().is_none());
        assert!(storage.get("b").unwrap().is_none());

        // 删除不存在的键不报错
        storage.apply(&[("missing", None)]).unwrap();
    }

    #[test]
    fn test_memory_storage_batch() {
        let storage = MemoryStorage::new();
        exercise_batch(&storage);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_sled_storage_batch() {
        let storage = SledStorage::temporary().unwrap();
        exercise_batch(&storage);
    }

    #[test]
    fn test_layout_presets_are_distinct() {
        let oa = StorageLayout::oa();
        assert_eq!(oa.access_token, "oa_token");
        assert_eq!(oa.user, "oa_user_info");
        assert_eq!(StorageLayout::users().expires_at, "loginExpireTime");
        assert!(!oa.session_keys().contains(&oa.device_id.as_str()));
        assert_eq!(StorageLayout::from_preset(LayoutPreset::Admin), StorageLayout::admin());
    }
}
