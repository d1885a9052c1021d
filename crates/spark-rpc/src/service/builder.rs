use std::fmt;
use std::panic::Location;

use crate::wire::Map;

use super::signature::{HandlerEntry, IntoHandler};

/// 源码位置，注册错误与调试信息中以 `file:line` 形式出现。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SourceSite(&'static Location<'static>);

impl SourceSite {
    #[track_caller]
    pub(crate) fn caller() -> Self {
        Self(Location::caller())
    }
}

impl fmt::Display for SourceSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0.file(), self.0.line())
    }
}

pub(crate) struct ActionDef {
    pub(crate) name: String,
    pub(crate) handler: Result<HandlerEntry, String>,
    pub(crate) site: SourceSite,
}

pub(crate) struct ChildDef {
    pub(crate) name: String,
    pub(crate) service: Service,
    pub(crate) data: Map,
    pub(crate) site: SourceSite,
}

/// 服务定义构建器。
///
/// 名称与签名在构建阶段只做记录，统一在挂载时校验，错误信息附带各自的注册位置：
///
/// ```
/// use spark_rpc::{Map, Runtime, Service, ServiceMeta};
///
/// let user = Service::new()
///     .on("GetName", |rt: Runtime, id: u64| rt.ok(format!("user-{id}")))
///     .on("$onMount", |rt: Runtime| rt.ok(()));
/// let meta = ServiceMeta::new("user", user, Map::new());
/// assert_eq!(meta.name(), "user");
/// ```
pub struct Service {
    pub(crate) actions: Vec<ActionDef>,
    pub(crate) children: Vec<ChildDef>,
}

impl Service {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            children: Vec::new(),
        }
    }

    /// 以 `name` 注册处理函数。
    #[track_caller]
    pub fn on<Args>(mut self, name: &str, handler: impl IntoHandler<Args>) -> Self {
        self.actions.push(ActionDef {
            name: name.to_owned(),
            handler: handler.into_handler(),
            site: SourceSite::caller(),
        });
        self
    }

    /// 添加子服务，`data` 在挂载时拷贝为子服务的服务数据。
    #[track_caller]
    pub fn add_child_service(mut self, name: &str, service: Service, data: Map) -> Self {
        self.children.push(ChildDef {
            name: name.to_owned(),
            service,
            data,
            site: SourceSite::caller(),
        });
        self
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field(
                "actions",
                &self.actions.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            )
            .field(
                "children",
                &self.children.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// 挂在根服务 `#` 下的一级服务。
#[derive(Debug)]
pub struct ServiceMeta {
    pub(crate) name: String,
    pub(crate) service: Service,
    pub(crate) data: Map,
    pub(crate) site: SourceSite,
}

impl ServiceMeta {
    #[track_caller]
    pub fn new(name: impl Into<String>, service: Service, data: Map) -> Self {
        Self {
            name: name.into(),
            service,
            data,
            site: SourceSite::caller(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
