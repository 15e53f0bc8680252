use hn_core::{strip_query, NavigationRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 路由定义；子路由路径相对父路由，权限要求与父路由合并
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
    /// 未设置时继承父路由
    #[serde(default)]
    pub public: Option<bool>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub children: Vec<RouteDefinition>,
}

impl RouteDefinition {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn public(mut self) -> Self {
        self.public = Some(true);
        self
    }

    pub fn roles<I: IntoIterator<Item = S>, S: Into<String>>(mut self, roles: I) -> Self {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn permissions<I: IntoIterator<Item = S>, S: Into<String>>(mut self, perms: I) -> Self {
        self.permissions.extend(perms.into_iter().map(Into::into));
        self
    }

    pub fn child(mut self, child: RouteDefinition) -> Self {
        self.children.push(child);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
    CatchAll,
}

/// 展开后的路由
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub pattern: String,
    pub name: Option<String>,
    pub public: bool,
    pub roles: HashSet<String>,
    pub permissions: HashSet<String>,
    segments: Vec<Segment>,
}

impl CompiledRoute {
    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    fn has_catch_all(&self) -> bool {
        self.segments.contains(&Segment::CatchAll)
    }

    fn matches(&self, parts: &[&str]) -> bool {
        let mut i = 0;
        for segment in &self.segments {
            match segment {
                Segment::CatchAll => return true,
                Segment::Param => {
                    if i >= parts.len() {
                        return false;
                    }
                }
                Segment::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return false;
                    }
                }
            }
            i += 1;
        }
        i == parts.len()
    }
}

/// 路径到导航请求的解析表
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    pub fn new(definitions: &[RouteDefinition]) -> Self {
        let mut routes = Vec::new();
        for def in definitions {
            flatten(def, "", false, &HashSet::new(), &HashSet::new(), &mut routes);
        }
        Self { routes }
    }

    /// 字面段最多者优先，其次不含通配，最后按定义顺序
    pub fn lookup(&self, path: &str) -> Option<&CompiledRoute> {
        let parts = split(strip_query(path));
        let mut best: Option<&CompiledRoute> = None;
        for route in self.routes.iter().filter(|r| r.matches(&parts)) {
            let better = match best {
                None => true,
                Some(current) => {
                    (route.literal_count(), !route.has_catch_all())
                        > (current.literal_count(), !current.has_catch_all())
                }
            };
            if better {
                best = Some(route);
            }
        }
        best
    }

    /// 未匹配的路径按受保护、无额外要求处理
    pub fn resolve(&self, target: &str) -> NavigationRequest {
        match self.lookup(target) {
            Some(route) => NavigationRequest {
                target_path: target.to_string(),
                is_public: route.public,
                required_roles: route.roles.clone(),
                required_permissions: route.permissions.clone(),
            },
            None => NavigationRequest::protected(target),
        }
    }
}

fn flatten(
    def: &RouteDefinition,
    parent: &str,
    parent_public: bool,
    parent_roles: &HashSet<String>,
    parent_perms: &HashSet<String>,
    out: &mut Vec<CompiledRoute>,
) {
    let pattern = join(parent, &def.path);
    let public = def.public.unwrap_or(parent_public);
    let mut roles = parent_roles.clone();
    roles.extend(def.roles.iter().cloned());
    let mut permissions = parent_perms.clone();
    permissions.extend(def.permissions.iter().cloned());

    let segments = split(&pattern)
        .into_iter()
        .map(|s| {
            if s == "*" || s.starts_with(":pathMatch") {
                Segment::CatchAll
            } else if s.starts_with(':') {
                Segment::Param
            } else {
                Segment::Literal(s.to_string())
            }
        })
        .collect();

    out.push(CompiledRoute {
        pattern: pattern.clone(),
        name: def.name.clone(),
        public,
        roles: roles.clone(),
        permissions: permissions.clone(),
        segments,
    });

    for child in &def.children {
        flatten(child, &pattern, public, &roles, &permissions, out);
    }
}

fn join(parent: &str, path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    let parent = parent.trim_end_matches('/');
    if path.is_empty() {
        if parent.is_empty() {
            "/".to_string()
        } else {
            parent.to_string()
        }
    } else {
        format!("{}/{}", parent, path)
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
