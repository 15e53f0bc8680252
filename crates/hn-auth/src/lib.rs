pub mod clock;
pub mod config;
pub mod gateway;
pub mod guard;
pub mod http_gateway;
pub mod jwt;
pub mod manager;
pub mod mock_gateway;
pub mod permissions;
pub mod refresh;
pub mod routes;
pub mod session;
pub mod storage;

// 重新导出核心类型
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, AuthServices, GatewayMode, StorageBackend};
pub use gateway::{AuthGateway, ContractPreset, Endpoint, GatewayContract};
pub use guard::{GuardOutcome, GuardPhase, NavigationDecision, RouteGuard, RoutePaths};
pub use http_gateway::{HttpAuthGateway, HttpGatewayConfig};
pub use jwt::{Claims, JwtService};
pub use manager::{AuthManager, DeviceProfile};
pub use mock_gateway::MockAuthGateway;
pub use permissions::{Permission, PermissionEvaluator, SystemRole};
pub use refresh::TokenRefreshCoordinator;
pub use routes::{RouteDefinition, RouteTable};
pub use session::SessionStore;
pub use storage::{KeyValueStorage, LayoutPreset, MemoryStorage, SledStorage, StorageLayout};

pub use hn_core::{NavigationRequest, Session, SessionInfo, User, UserStatus};

// 错误类型
pub use hn_error::{HnError, Result};
