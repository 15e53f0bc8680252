use chrono::{DateTime, Duration, TimeZone, Utc};
use hn_core::{Session, User};
use hn_error::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::storage::{KeyValueStorage, StorageLayout};

/// 默认提前刷新窗口：到期前5分钟
pub const DEFAULT_REFRESH_LEAD_SECS: i64 = 300;

#[derive(Debug, Default)]
struct SessionState {
    session: Option<Session>,
    user: Option<User>,
    // 每次 save / clear 自增，用于丢弃基于旧会话发起的刷新结果
    generation: u64,
}

/// 当前会话的唯一持有者（内存 + 持久化）
pub struct SessionStore {
    storage: Arc<dyn KeyValueStorage>,
    layout: StorageLayout,
    clock: Arc<dyn Clock>,
    refresh_lead: Duration,
    state: RwLock<SessionState>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, layout: StorageLayout) -> Self {
        Self {
            storage,
            layout,
            clock: Arc::new(SystemClock),
            refresh_lead: Duration::seconds(DEFAULT_REFRESH_LEAD_SECS),
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_refresh_lead(mut self, lead: Duration) -> Self {
        self.refresh_lead = lead;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// 从持久化恢复会话
    ///
    /// 残缺的持久化数据，或已过期且没有 refresh token 的会话，都会被清除并返回 `None`。
    pub fn load(&self) -> Result<Option<Session>> {
        let mut state = self.state.write();

        let access_token = self.storage.get(&self.layout.access_token)?;
        let refresh_token = self.storage.get(&self.layout.refresh_token)?;
        let session_id = self.storage.get(&self.layout.session_id)?;
        let user_json = self.storage.get(&self.layout.user)?;
        let expires_at = self.storage.get(&self.layout.expires_at)?;

        let Some(access_token) = access_token.filter(|t| !t.is_empty()) else {
            if refresh_token.is_some() || user_json.is_some() || expires_at.is_some() {
                warn!("discarding partially persisted session");
                self.wipe(&mut state)?;
            }
            return Ok(None);
        };

        let Some(expires_at) = expires_at.as_deref().and_then(parse_millis) else {
            warn!("persisted session has no usable expiry; clearing");
            self.wipe(&mut state)?;
            return Ok(None);
        };

        let user = match user_json.as_deref().map(serde_json::from_str::<User>) {
            Some(Ok(user)) => user,
            Some(Err(e)) => {
                warn!(error = %e, "persisted user profile is corrupt; clearing");
                self.wipe(&mut state)?;
                return Ok(None);
            }
            None => {
                warn!("persisted session has no user profile; clearing");
                self.wipe(&mut state)?;
                return Ok(None);
            }
        };

        let session = Session {
            access_token,
            refresh_token: refresh_token.unwrap_or_default(),
            session_id: session_id.filter(|s| !s.is_empty()),
            expires_at,
        };

        let now = self.clock.now();
        if now >= session.expires_at && !session.has_refresh_token() {
            info!(user_id = %user.id, "persisted session expired without refresh token");
            self.wipe(&mut state)?;
            return Ok(None);
        }

        debug!(
            user_id = %user.id,
            session_id = ?session.session_id,
            expires_at = %session.expires_at,
            "session restored"
        );
        state.session = Some(session.clone());
        state.user = Some(user);
        Ok(Some(session))
    }

    /// 原子写入会话与用户资料，覆盖旧状态
    pub fn save(&self, session: &Session, user: &User) -> Result<()> {
        let mut state = self.state.write();
        self.persist(session, user)?;
        state.session = Some(session.clone());
        state.user = Some(user.clone());
        state.generation += 1;
        info!(user_id = %user.id, session_id = ?session.session_id, "session saved");
        Ok(())
    }

    /// 用刷新结果替换令牌
    ///
    /// `generation` 为刷新发起时的代数；期间发生过 `save` 或 `clear` 则不写入，返回 `false`。
    pub fn replace_tokens(&self, session: &Session, generation: u64) -> Result<bool> {
        let mut state = self.state.write();
        if state.generation != generation {
            warn!(
                started = generation,
                current = state.generation,
                "session replaced while refresh was in flight; dropping result"
            );
            return Ok(false);
        }
        let Some(user) = state.user.clone() else {
            return Ok(false);
        };
        self.persist(session, &user)?;
        state.session = Some(session.clone());
        Ok(true)
    }

    /// 只替换用户资料，令牌不变
    ///
    /// 与 `replace_tokens` 相同，代数变化后不写入。
    pub fn replace_user(&self, user: &User, generation: u64) -> Result<bool> {
        let mut state = self.state.write();
        if state.generation != generation || state.session.is_none() {
            debug!("session changed while fetching profile; dropping result");
            return Ok(false);
        }
        let user_json = serde_json::to_string(user)?;
        self.storage
            .apply(&[(self.layout.user.as_str(), Some(user_json))])?;
        state.user = Some(user.clone());
        Ok(true)
    }

    /// 清除全部会话键；幂等，不清除设备标识
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        self.wipe(&mut state)
    }

    /// 仅当代数未变化时清除，避免误清后来的新登录
    pub fn clear_if_generation(&self, generation: u64) -> Result<bool> {
        let mut state = self.state.write();
        if state.generation != generation {
            return Ok(false);
        }
        self.wipe(&mut state)?;
        Ok(true)
    }

    pub fn is_valid(&self) -> bool {
        let now = self.clock.now();
        self.state
            .read()
            .session
            .as_ref()
            .is_some_and(|s| s.is_valid_at(now))
    }

    pub fn should_preemptively_refresh(&self) -> bool {
        let now = self.clock.now();
        self.state
            .read()
            .session
            .as_ref()
            .is_some_and(|s| s.needs_refresh_at(now, self.refresh_lead))
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.read().session.clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.read().user.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .session
            .as_ref()
            .map(|s| s.access_token.clone())
            .filter(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state
            .read()
            .session
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .filter(|t| !t.is_empty())
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// 设备标识，首次使用时生成并单独持久化，登出不清除
    pub fn device_id(&self, platform: &str) -> Result<String> {
        if let Some(id) = self.storage.get(&self.layout.device_id)? {
            if !id.is_empty() {
                return Ok(id);
            }
        }
        let id = format!("{}_web_{}", platform, Uuid::new_v4().simple());
        self.storage.set(&self.layout.device_id, id.clone())?;
        debug!(device_id = %id, "device id created");
        Ok(id)
    }

    fn persist(&self, session: &Session, user: &User) -> Result<()> {
        let user_json = serde_json::to_string(user)?;
        self.storage.apply(&[
            (
                self.layout.access_token.as_str(),
                Some(session.access_token.clone()),
            ),
            (
                self.layout.refresh_token.as_str(),
                Some(session.refresh_token.clone()),
            ),
            (self.layout.session_id.as_str(), session.session_id.clone()),
            (self.layout.user.as_str(), Some(user_json)),
            (
                self.layout.expires_at.as_str(),
                Some(session.expires_at.timestamp_millis().to_string()),
            ),
        ])
    }

    fn wipe(&self, state: &mut SessionState) -> Result<()> {
        state.session = None;
        state.user = None;
        state.generation += 1;
        let ops: Vec<(&str, Option<String>)> = self
            .layout
            .session_keys()
            .into_iter()
            .map(|key| (key, None))
            .collect();
        self.storage.apply(&ops).map_err(|e| {
            warn!(error = %e, "failed to clear persisted session");
            e
        })
    }
}

fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    let millis = raw.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SessionStore")
            .field("layout", &self.layout)
            .field("has_session", &state.session.is_some())
            .field("generation", &state.generation)
            .finish()
    }
}

/// 存储报错时仍需把状态视为已登出的场景
pub(crate) fn clear_or_warn(store: &SessionStore, operation: &str) {
    if let Err(e) = store.clear() {
        warn!(operation, error = %e, "session clear failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use hn_core::UserStatus;
    use std::collections::HashSet;

    fn reviewer() -> User {
        User {
            id: "1001".into(),
            username: "lisi".into(),
            real_name: Some("李四".into()),
            role: "reviewer".into(),
            permissions: HashSet::from(["loan_approve".to_string()]),
            status: UserStatus::Active,
        }
    }

    fn fixture(now: DateTime<Utc>) -> (Arc<MemoryStorage>, Arc<ManualClock>, SessionStore) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(now));
        let store = SessionStore::new(storage.clone(), StorageLayout::oa()).with_clock(clock.clone());
        (storage, clock, store)
    }

    fn session(expires_at: DateTime<Utc>, refresh_token: &str) -> Session {
        Session {
            access_token: "access-1".into(),
            refresh_token: refresh_token.into(),
            session_id: Some("sess_1".into()),
            expires_at,
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let (storage, clock, store) = fixture(now);
        let saved = session(now + Duration::hours(1), "refresh-1");
        store.save(&saved, &reviewer()).unwrap();

        let reloaded = SessionStore::new(storage, StorageLayout::oa()).with_clock(clock);
        let loaded = reloaded.load().unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(reloaded.current_user().unwrap(), reviewer());
        assert!(reloaded.is_valid());
    }

    #[test]
    fn test_validity_boundary() {
        let now = Utc::now();
        let (_storage, clock, store) = fixture(now);
        let expires_at = now + Duration::minutes(10);
        store.save(&session(expires_at, "r"), &reviewer()).unwrap();

        clock.set(expires_at - Duration::milliseconds(1));
        assert!(store.is_valid());
        clock.set(expires_at);
        assert!(!store.is_valid());
    }

    #[test]
    fn test_clear_is_idempotent_and_keeps_device_id() {
        let now = Utc::now();
        let (storage, _clock, store) = fixture(now);
        let device_id = store.device_id("oa").unwrap();
        store
            .save(&session(now + Duration::hours(1), "r"), &reviewer())
            .unwrap();

        store.clear().unwrap();
        assert!(!store.is_valid());
        assert_eq!(storage.len(), 1);
        store.clear().unwrap();
        assert!(!store.is_valid());
        assert_eq!(storage.len(), 1);

        assert_eq!(store.device_id("oa").unwrap(), device_id);
        assert!(device_id.starts_with("oa_web_"));
    }

    #[test]
    fn test_load_expired_without_refresh_token_fails_closed() {
        let now = Utc::now();
        let (storage, clock, store) = fixture(now);
        store
            .save(&session(now + Duration::minutes(1), ""), &reviewer())
            .unwrap();

        clock.advance(Duration::minutes(2));
        let reloaded = SessionStore::new(storage.clone(), StorageLayout::oa()).with_clock(clock);
        assert!(reloaded.load().unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_load_expired_with_refresh_token_keeps_session_for_refresh() {
        let now = Utc::now();
        let (storage, clock, store) = fixture(now);
        store
            .save(&session(now - Duration::minutes(1), "refresh-1"), &reviewer())
            .unwrap();

        let reloaded = SessionStore::new(storage, StorageLayout::oa()).with_clock(clock);
        let loaded = reloaded.load().unwrap().unwrap();
        assert_eq!(loaded.refresh_token, "refresh-1");
        assert!(!reloaded.is_valid());
        assert!(reloaded.should_preemptively_refresh());
    }

    #[test]
    fn test_load_partial_state_is_cleared() {
        let now = Utc::now();
        let (storage, _clock, store) = fixture(now);
        storage
            .apply(&[
                ("oa_token", Some("access".into())),
                ("oa_user_info", Some("{not json".into())),
                ("oa_expires_at", Some((now + Duration::hours(1)).timestamp_millis().to_string())),
            ])
            .unwrap();

        assert!(store.load().unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_preemptive_window() {
        let now = Utc::now();
        let (_storage, clock, store) = fixture(now);
        store
            .save(&session(now + Duration::minutes(30), "r"), &reviewer())
            .unwrap();
        assert!(!store.should_preemptively_refresh());

        clock.advance(Duration::minutes(26));
        assert!(store.is_valid());
        assert!(store.should_preemptively_refresh());
    }

    #[test]
    fn test_save_starts_new_generation() {
        let now = Utc::now();
        let (_storage, _clock, store) = fixture(now);
        store
            .save(&session(now + Duration::minutes(1), "r"), &reviewer())
            .unwrap();
        let generation = store.generation();

        let mut admin = reviewer();
        admin.id = "1".into();
        admin.role = "super_admin".into();
        let mut newer = session(now + Duration::hours(1), "r-admin");
        newer.access_token = "access-admin".into();
        store.save(&newer, &admin).unwrap();

        let stale = session(now + Duration::hours(2), "r2");
        assert!(!store.replace_tokens(&stale, generation).unwrap());
        assert!(!store.replace_user(&reviewer(), generation).unwrap());
        assert_eq!(store.current_session().unwrap(), newer);
        assert_eq!(store.current_user().unwrap(), admin);
    }

    #[test]
    fn test_replace_user_keeps_tokens() {
        let now = Utc::now();
        let (storage, clock, store) = fixture(now);
        let saved = session(now + Duration::hours(1), "r");
        store.save(&saved, &reviewer()).unwrap();

        let mut promoted = reviewer();
        promoted.permissions.insert("user:manage".into());
        assert!(store.replace_user(&promoted, store.generation()).unwrap());

        let reloaded = SessionStore::new(storage, StorageLayout::oa()).with_clock(clock);
        assert_eq!(reloaded.load().unwrap().unwrap(), saved);
        assert_eq!(reloaded.current_user().unwrap(), promoted);
    }

    #[test]
    fn test_replace_user_without_session_is_dropped() {
        let (storage, _clock, store) = fixture(Utc::now());
        assert!(!store.replace_user(&reviewer(), store.generation()).unwrap());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_replace_tokens_after_clear_is_dropped() {
        let now = Utc::now();
        let (storage, _clock, store) = fixture(now);
        store
            .save(&session(now + Duration::minutes(1), "r"), &reviewer())
            .unwrap();
        let generation = store.generation();

        store.clear().unwrap();
        let refreshed = session(now + Duration::hours(1), "r2");
        assert!(!store.replace_tokens(&refreshed, generation).unwrap());
        assert!(store.current_session().is_none());
        assert!(storage.is_empty());
    }
}
