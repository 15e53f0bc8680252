/// 权限定义模块
/// 定义系统中的权限、角色以及路由级授权判断
use hn_core::User;
use hn_error::{HnError, Result};
use std::collections::HashSet;

/// 权限常量定义
pub struct Permission;

impl Permission {
    pub const USER_MANAGE: &'static str = "user_manage";
    pub const LOAN_APPROVE: &'static str = "loan_approve";
    pub const MACHINE_MANAGE: &'static str = "machine_manage";
    pub const CONTENT_MANAGE: &'static str = "content_manage";
    pub const SYSTEM_CONFIG: &'static str = "system_config";
    pub const RISK_MONITOR: &'static str = "risk_monitor";
    pub const DATA_EXPORT: &'static str = "data_export";
    pub const LOG_VIEW: &'static str = "log_view";

    // 审批与看板
    pub const DASHBOARD_VIEW: &'static str = "dashboard:view";
    pub const APPROVAL_VIEW: &'static str = "approval:view";
    pub const APPROVAL_REVIEW: &'static str = "approval:review";

    pub fn all() -> Vec<&'static str> {
        vec![
            Self::USER_MANAGE,
            Self::LOAN_APPROVE,
            Self::MACHINE_MANAGE,
            Self::CONTENT_MANAGE,
            Self::SYSTEM_CONFIG,
            Self::RISK_MONITOR,
            Self::DATA_EXPORT,
            Self::LOG_VIEW,
            Self::DASHBOARD_VIEW,
            Self::APPROVAL_VIEW,
            Self::APPROVAL_REVIEW,
        ]
    }
}

/// 系统角色定义
pub struct SystemRole;

impl SystemRole {
    pub const SUPER_ADMIN: &'static str = "super_admin";
    pub const ADMIN: &'static str = "admin";
    pub const REVIEWER: &'static str = "reviewer";
    pub const OPERATOR: &'static str = "operator";

    /// 获取角色的默认权限
    pub fn default_permissions(role: &str) -> Vec<&'static str> {
        match role {
            Self::SUPER_ADMIN => Permission::all(),
            Self::ADMIN => vec![
                Permission::USER_MANAGE,
                Permission::LOAN_APPROVE,
                Permission::MACHINE_MANAGE,
                Permission::CONTENT_MANAGE,
                Permission::SYSTEM_CONFIG,
                Permission::DASHBOARD_VIEW,
            ],
            Self::REVIEWER => vec![
                Permission::LOAN_APPROVE,
                Permission::DASHBOARD_VIEW,
                Permission::APPROVAL_VIEW,
                Permission::APPROVAL_REVIEW,
            ],
            Self::OPERATOR => vec![
                Permission::MACHINE_MANAGE,
                Permission::CONTENT_MANAGE,
                Permission::DASHBOARD_VIEW,
            ],
            _ => vec![],
        }
    }
}

/// 路由级授权判断，无副作用
///
/// 超级管理员角色直接放行；否则角色要求任一命中，权限要求全部命中，空集合不构成约束。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionEvaluator {
    superuser_role: String,
}

impl Default for PermissionEvaluator {
    fn default() -> Self {
        Self::new(SystemRole::SUPER_ADMIN)
    }
}

impl PermissionEvaluator {
    pub fn new(superuser_role: impl Into<String>) -> Self {
        Self {
            superuser_role: superuser_role.into(),
        }
    }

    pub fn superuser_role(&self) -> &str {
        &self.superuser_role
    }

    pub fn check(
        &self,
        user: &User,
        required_roles: &HashSet<String>,
        required_permissions: &HashSet<String>,
    ) -> bool {
        self.evaluate(user, required_roles, required_permissions)
            .is_ok()
    }

    /// 与 `check` 相同，失败时说明缺少的角色或权限
    pub fn evaluate(
        &self,
        user: &User,
        required_roles: &HashSet<String>,
        required_permissions: &HashSet<String>,
    ) -> Result<()> {
        if user.role == self.superuser_role {
            return Ok(());
        }

        if !required_roles.is_empty() && !required_roles.contains(&user.role) {
            let mut roles: Vec<&str> = required_roles.iter().map(String::as_str).collect();
            roles.sort_unstable();
            return Err(HnError::permission_denied(format!(
                "role '{}' not in [{}]",
                user.role,
                roles.join(", ")
            )));
        }

        let mut missing: Vec<&str> = required_permissions
            .iter()
            .filter(|p| !user.permissions.contains(*p))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(HnError::permission_denied(format!(
                "missing permissions [{}]",
                missing.join(", ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hn_core::UserStatus;

    fn user(role: &str, permissions: &[&str]) -> User {
        User {
            id: "1".into(),
            username: "u".into(),
            real_name: None,
            role: role.into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            status: UserStatus::Active,
        }
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reviewer_lacks_user_manage() {
        let evaluator = PermissionEvaluator::default();
        let reviewer = user("reviewer", &["loan_approve"]);
        assert!(!evaluator.check(&reviewer, &set(&[]), &set(&["user_manage"])));

        let err = evaluator
            .evaluate(&reviewer, &set(&[]), &set(&["user_manage"]))
            .unwrap_err();
        assert!(err.to_string().contains("权限不足"));
    }

    #[test]
    fn test_superuser_bypass() {
        let evaluator = PermissionEvaluator::default();
        let root = user("super_admin", &[]);
        assert!(evaluator.check(&root, &set(&["operator"]), &set(&["system_config"])));
    }

    #[test]
    fn test_roles_any_permissions_all() {
        let evaluator = PermissionEvaluator::default();
        let reviewer = user("reviewer", &["loan_approve", "dashboard:view"]);

        assert!(evaluator.check(&reviewer, &set(&["admin", "reviewer"]), &set(&[])));
        assert!(!evaluator.check(&reviewer, &set(&["admin"]), &set(&[])));
        assert!(evaluator.check(
            &reviewer,
            &set(&["reviewer"]),
            &set(&["loan_approve", "dashboard:view"])
        ));
        assert!(!evaluator.check(
            &reviewer,
            &set(&["reviewer"]),
            &set(&["loan_approve", "data_export"])
        ));
    }

    #[test]
    fn test_empty_requirements_allow_any_user() {
        let evaluator = PermissionEvaluator::default();
        assert!(evaluator.check(&user("operator", &[]), &set(&[]), &set(&[])));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let evaluator = PermissionEvaluator::default();
        let admin_upper = user("ADMIN", &["User_Manage"]);
        assert!(!evaluator.check(&admin_upper, &set(&["admin"]), &set(&[])));
        assert!(!evaluator.check(&admin_upper, &set(&[]), &set(&["user_manage"])));
        assert!(!evaluator.check(&user("Super_Admin", &[]), &set(&[]), &set(&["log_view"])));
    }

    #[test]
    fn test_configurable_superuser_role() {
        let evaluator = PermissionEvaluator::new("ADMIN");
        assert!(evaluator.check(&user("ADMIN", &[]), &set(&[]), &set(&["system_config"])));
        assert!(!evaluator.check(&user("super_admin", &[]), &set(&[]), &set(&["system_config"])));
    }

    #[test]
    fn test_default_role_permissions() {
        assert_eq!(
            SystemRole::default_permissions(SystemRole::SUPER_ADMIN).len(),
            Permission::all().len()
        );
        assert!(SystemRole::default_permissions("reviewer").contains(&Permission::LOAN_APPROVE));
        assert!(SystemRole::default_permissions("guest").is_empty());
    }
}
