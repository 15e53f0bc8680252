use futures::future::{BoxFuture, FutureExt, Shared};
use hn_core::Session;
use hn_error::{HnError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::gateway::AuthGateway;
use crate::session::SessionStore;

type SharedOutcome = Shared<BoxFuture<'static, Result<Session>>>;

/// 正在进行中的刷新；同一时刻最多一个
struct RefreshTicket {
    id: u64,
    outcome: SharedOutcome,
}

/// 令牌刷新的单飞协调器
///
/// 并发调用 `refresh` 只会触发一次网络请求，所有调用方拿到同一个结果。
/// 刷新失败视为终态：清空会话并返回 `AuthExpired`，内部不重试。
pub struct TokenRefreshCoordinator {
    store: Arc<SessionStore>,
    gateway: Arc<dyn AuthGateway>,
    inflight: Arc<Mutex<Option<RefreshTicket>>>,
    next_ticket: AtomicU64,
}

impl TokenRefreshCoordinator {
    pub fn new(store: Arc<SessionStore>, gateway: Arc<dyn AuthGateway>) -> Self {
        Self {
            store,
            gateway,
            inflight: Arc::new(Mutex::new(None)),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn is_refreshing(&self) -> bool {
        self.inflight.lock().is_some()
    }

    pub async fn refresh(&self) -> Result<Session> {
        self.ticket()?.await
    }

    /// 取得现有票据，或创建新票据并启动刷新任务
    fn ticket(&self) -> Result<SharedOutcome> {
        let mut slot = self.inflight.lock();
        if let Some(ticket) = slot.as_ref() {
            debug!(ticket = ticket.id, "joining in-flight refresh");
            return Ok(ticket.outcome.clone());
        }

        let Some(refresh_token) = self.store.refresh_token() else {
            debug!("no refresh token; refresh skipped");
            return Err(HnError::auth_expired("no refresh token"));
        };

        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let generation = self.store.generation();
        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let inflight = self.inflight.clone();

        // 刷新在独立任务中运行，调用方放弃等待也不会中断
        let task = tokio::spawn(async move {
            let result = gateway.refresh(&refresh_token).await;
            let outcome = settle(&store, result, generation);
            release(&inflight, id);
            outcome
        });

        let release_slot = self.inflight.clone();
        let task_store = self.store.clone();
        let outcome = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    release(&release_slot, id);
                    Err(terminal(&task_store, generation, format!("refresh task aborted: {}", e)))
                }
            }
        }
        .boxed()
        .shared();

        debug!(ticket = id, generation, "refresh started");
        *slot = Some(RefreshTicket {
            id,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }
}

/// 把网关结果落到会话存储上
fn settle(
    store: &SessionStore,
    result: Result<hn_core::wire::TokenGrant>,
    generation: u64,
) -> Result<Session> {
    let grant = match result {
        Ok(grant) => grant,
        Err(HnError::AuthExpired { reason }) => return Err(terminal(store, generation, reason)),
        Err(e) => return Err(terminal(store, generation, format!("refresh failed: {}", e))),
    };

    let previous = store.current_session();
    let issued = Session::issued(
        grant.access_token,
        grant
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous.as_ref().map(|s| s.refresh_token.clone()))
            .unwrap_or_default(),
        grant
            .session_id
            .or_else(|| previous.and_then(|s| s.session_id)),
        grant.expires_in,
        store.clock().now(),
    );
    let session = match issued {
        Ok(session) => session,
        Err(e) => return Err(terminal(store, generation, format!("refresh failed: {}", e))),
    };

    match store.replace_tokens(&session, generation) {
        Ok(true) => info!(session_id = ?session.session_id, expires_at = %session.expires_at, "token refreshed"),
        Ok(false) => debug!("refresh result not persisted; session changed meanwhile"),
        Err(e) => {
            warn!(error = %e, "failed to persist refreshed session");
            return Err(e);
        }
    }
    Ok(session)
}

/// 刷新失败是终态：清空发起时的会话，返回 `AuthExpired`
fn terminal(store: &SessionStore, generation: u64, reason: String) -> HnError {
    warn!(reason = %reason, "token refresh failed; clearing session");
    if let Err(e) = store.clear_if_generation(generation) {
        warn!(error = %e, "session clear failed");
    }
    HnError::auth_expired(reason)
}

fn release(inflight: &Mutex<Option<RefreshTicket>>, id: u64) {
    let mut slot = inflight.lock();
    if slot.as_ref().is_some_and(|t| t.id == id) {
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::Endpoint;
    use crate::mock_gateway::MockAuthGateway;
    use crate::storage::{MemoryStorage, StorageLayout};
    use chrono::{Duration, Utc};
    use hn_core::wire::{DeviceInfo, LoginRequest};

    async fn logged_in(
        latency_ms: u64,
    ) -> (Arc<MemoryStorage>, Arc<SessionStore>, Arc<MockAuthGateway>, TokenRefreshCoordinator) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(SessionStore::new(storage.clone(), StorageLayout::oa()).with_clock(clock));
        let gateway = Arc::new(
            MockAuthGateway::with_default_accounts("refresh-test")
                .with_latency(std::time::Duration::from_millis(latency_ms)),
        );

        let data = gateway
            .login(&LoginRequest {
                username: "admin".into(),
                password: "admin123".into(),
                platform: "oa".into(),
                device_info: DeviceInfo {
                    device_id: "oa_web_1".into(),
                    device_type: "web".into(),
                    device_name: "test".into(),
                    app_version: "1.0.0".into(),
                },
            })
            .await
            .unwrap();
        let session = Session::issued(
            data.session.access_token,
            data.session.refresh_token,
            data.session.session_id,
            60,
            store.clock().now() - Duration::minutes(5),
        )
        .unwrap();
        store.save(&session, &data.user).unwrap();

        let coordinator = TokenRefreshCoordinator::new(store.clone(), gateway.clone());
        (storage, store, gateway, coordinator)
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let (_storage, store, gateway, coordinator) = logged_in(50).await;
        let before = store.current_session().unwrap();
        assert!(!store.is_valid());

        let results = futures::future::join_all((0..8).map(|_| coordinator.refresh())).await;

        assert_eq!(gateway.calls(Endpoint::Refresh), 1);
        let first = results[0].clone().unwrap();
        for r in &results {
            assert_eq!(r.as_ref().unwrap(), &first);
        }
        assert_ne!(first.access_token, before.access_token);
        assert_eq!(first.session_id, before.session_id);
        assert!(store.is_valid());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_failed_refresh_clears_store_for_every_waiter() {
        let (storage, store, gateway, coordinator) = logged_in(30).await;
        gateway.set_refresh_failure(Some(HnError::network("refresh", "connection reset")));

        let results = futures::future::join_all((0..4).map(|_| coordinator.refresh())).await;

        assert_eq!(gateway.calls(Endpoint::Refresh), 1);
        for r in results {
            assert!(r.unwrap_err().is_auth_expired());
        }
        assert!(store.current_session().is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_skips_network() {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(SessionStore::new(storage, StorageLayout::oa()));
        let gateway = Arc::new(MockAuthGateway::with_default_accounts("refresh-test"));
        let coordinator = TokenRefreshCoordinator::new(store, gateway.clone());

        assert!(coordinator.refresh().await.unwrap_err().is_auth_expired());
        assert_eq!(gateway.calls(Endpoint::Refresh), 0);
    }

    #[tokio::test]
    async fn test_logout_during_refresh_is_not_resurrected() {
        let (storage, store, gateway, coordinator) = logged_in(50).await;

        let pending = coordinator.refresh();
        let (result, _) = tokio::join!(pending, async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            store.clear().unwrap();
        });

        // 等待方仍拿到票据的结果，但存储保持登出状态
        assert!(result.is_ok());
        assert_eq!(gateway.calls(Endpoint::Refresh), 1);
        assert!(store.current_session().is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_login_during_refresh_is_not_overwritten() {
        let (_storage, store, gateway, coordinator) = logged_in(50).await;
        let admin_user = store.current_user().unwrap();
        let mut reviewer = admin_user.clone();
        reviewer.id = "2".into();
        reviewer.username = "reviewer".into();
        reviewer.role = "reviewer".into();
        let newer = Session::issued(
            "reviewer-access".into(),
            "reviewer-refresh".into(),
            Some("sess_reviewer".into()),
            3600,
            store.clock().now(),
        )
        .unwrap();

        let (result, _) = tokio::join!(coordinator.refresh(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            store.save(&newer, &reviewer).unwrap();
        });

        assert!(result.is_ok());
        assert_eq!(gateway.calls(Endpoint::Refresh), 1);
        assert_eq!(store.current_session().unwrap(), newer);
        assert_eq!(store.current_user().unwrap(), reviewer);
        assert!(store.is_valid());
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_clear_newer_login() {
        let (_storage, store, gateway, coordinator) = logged_in(50).await;
        gateway.set_refresh_failure(Some(HnError::network("refresh", "connection reset")));
        let user = store.current_user().unwrap();
        let newer = Session::issued(
            "newer-access".into(),
            "newer-refresh".into(),
            None,
            3600,
            store.clock().now(),
        )
        .unwrap();

        let (result, _) = tokio::join!(coordinator.refresh(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            store.save(&newer, &user).unwrap();
        });

        assert!(result.unwrap_err().is_auth_expired());
        assert_eq!(store.current_session().unwrap(), newer);
    }

    #[test]
    fn test_out_of_range_expiry_is_terminal() {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone(), StorageLayout::oa());
        let now = store.clock().now();
        let session = Session::issued("at".into(), "rt".into(), None, 60, now).unwrap();
        store.save(&session, &admin_profile()).unwrap();

        let grant = hn_core::wire::TokenGrant {
            access_token: "at-2".into(),
            refresh_token: None,
            session_id: None,
            expires_in: 10_000_000_000_000,
        };
        let err = settle(&store, Ok(grant), store.generation()).unwrap_err();
        assert!(err.is_auth_expired());
        assert!(store.current_session().is_none());
        assert!(storage.is_empty());
    }

    fn admin_profile() -> hn_core::User {
        hn_core::User {
            id: "1".into(),
            username: "admin".into(),
            real_name: None,
            role: "super_admin".into(),
            permissions: Default::default(),
            status: hn_core::UserStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_sequential_refreshes_issue_new_tickets() {
        let (_storage, _store, gateway, coordinator) = logged_in(0).await;
        coordinator.refresh().await.unwrap();
        coordinator.refresh().await.unwrap();
        assert_eq!(gateway.calls(Endpoint::Refresh), 2);
    }
}
