use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use regex::Regex;

use crate::error::{RpcError, codes};
use crate::wire::Map;

use super::builder::{ActionDef, ChildDef, Service, ServiceMeta, SourceSite};
use super::data::ServiceData;
use super::dispatch::{DispatchCache, DispatchFn};
use super::perf::{PerfIndicator, PerfSnapshot};
use super::signature::HandlerEntry;

/// 根服务路径。
pub const ROOT_PATH: &str = "#";
pub const ON_MOUNT: &str = "$onMount";
pub const ON_UNMOUNT: &str = "$onUnmount";
pub const ON_UPDATE_CONFIG: &str = "$onUpdateConfig";

const SERVICE_NAME_PATTERN: &str = r"^[_0-9A-Za-z]+$";
const ACTION_NAME_PATTERN: &str =
    r"^(?:[_A-Za-z][_0-9A-Za-z]*|\$onMount|\$onUnmount|\$onUpdateConfig)$";

/// 执行生命周期系统动作的一方（处理器的系统执行器）。
pub(crate) trait LifecycleRunner {
    fn run_lifecycle(&self, path: &str) -> Result<(), RpcError>;
}

pub(crate) struct ServiceNode {
    path: String,
    depth: usize,
    data: ServiceData,
    site: SourceSite,
    mounted: AtomicBool,
}

/// 挂载后的动作，挂载完成即不可变。
pub(crate) struct Action {
    path: String,
    name: String,
    handler: HandlerEntry,
    cached: Option<DispatchFn>,
    site: SourceSite,
    perf: PerfIndicator,
    service: Arc<ServiceNode>,
}

impl Action {
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// `$` 开头的生命周期动作只在系统执行器上可见。
    pub(crate) fn is_system(&self) -> bool {
        self.name.starts_with('$')
    }

    pub(crate) fn handler(&self) -> &HandlerEntry {
        &self.handler
    }

    pub(crate) fn cached(&self) -> Option<DispatchFn> {
        self.cached
    }

    pub(crate) fn site(&self) -> SourceSite {
        self.site
    }

    pub(crate) fn perf(&self) -> &PerfIndicator {
        &self.perf
    }

    pub(crate) fn service_data(&self) -> &ServiceData {
        &self.service.data
    }
}

/// 单个动作的统计快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionStats {
    pub path: String,
    pub kind: String,
    /// 是否挂接了派发缓存。
    pub cached: bool,
    pub perf: PerfSnapshot,
}

type ActionTable = HashMap<String, Arc<Action>>;

/// 服务树与动作表。
///
/// # 教案式说明
/// - **意图 (Why)**：请求路径上的查找必须无锁，挂载与卸载则很少发生；
/// - **契约 (What)**：
///   - 动作表以 `ArcSwap` 发布整张快照，执行器只做 `load` + 哈希查找；
///   - 服务节点与所有结构性修改由 `services` 互斥锁串行化，修改后复制并替换整张动作表；
///   - 节点路径形如 `#.a.b`，动作路径形如 `#.a.b:Op`，根节点 `#` 深度为 0；
/// - **风险 (Trade-offs)**：每次挂载复制整张表，适合启动期集中挂载，不适合高频热更新。
pub(crate) struct Registry {
    max_node_depth: usize,
    cache: Option<DispatchCache>,
    service_name: Regex,
    action_name: Regex,
    table: ArcSwap<ActionTable>,
    services: Mutex<BTreeMap<String, Arc<ServiceNode>>>,
}

fn config_error(message: impl Into<String>, site: SourceSite) -> RpcError {
    codes::SERVICE_CONFIG.with_message(message).add_debug(site)
}

fn in_subtree(path: &str, prefix: &str) -> bool {
    prefix == ROOT_PATH
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

impl Registry {
    pub(crate) fn new(max_node_depth: usize, cache: Option<DispatchCache>) -> Result<Self, RpcError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| codes::KERNEL.with_message(format!("bad name pattern: {err}")))
        };
        Ok(Self {
            max_node_depth,
            cache,
            service_name: compile(SERVICE_NAME_PATTERN)?,
            action_name: compile(ACTION_NAME_PATTERN)?,
            table: ArcSwap::from_pointee(ActionTable::new()),
            services: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<Arc<Action>> {
        self.table.load().get(path).cloned()
    }

    /// 当前动作表中出现过的全部 kind-string，去重并排序。
    pub(crate) fn kinds(&self) -> Vec<String> {
        let table = self.table.load();
        let mut kinds: Vec<String> = table
            .values()
            .map(|action| action.handler.kind().to_owned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        kinds.sort_unstable();
        kinds
    }

    pub(crate) fn stats(&self, path: &str) -> Option<ActionStats> {
        self.lookup(path).map(|action| ActionStats {
            path: action.path.clone(),
            kind: action.handler.kind().to_owned(),
            cached: action.cached.is_some(),
            perf: action.perf.snapshot(),
        })
    }

    /// 已挂载服务上名为 `hook` 的系统动作路径，按路径排序。
    pub(crate) fn lifecycle_targets(&self, hook: &str) -> Vec<String> {
        let table = self.table.load();
        let mut targets: Vec<String> = table
            .values()
            .filter(|action| action.name == hook && action.service.mounted.load(Ordering::Acquire))
            .map(|action| action.path.clone())
            .collect();
        targets.sort_unstable();
        targets
    }

    pub(crate) fn service_paths(&self) -> Vec<String> {
        self.services.lock().keys().cloned().collect()
    }

    fn publish(&self, edit: impl FnOnce(&mut ActionTable)) {
        let mut next = ActionTable::clone(&self.table.load());
        edit(&mut next);
        self.table.store(Arc::new(next));
    }

    /// 把 `meta` 挂到根服务下；任何一步失败都会卸载本次新建的全部节点。
    pub(crate) fn mount(&self, meta: ServiceMeta, runner: &dyn LifecycleRunner) -> Result<(), RpcError> {
        let ServiceMeta {
            name,
            service,
            data,
            site,
        } = meta;
        let mut services = self.services.lock();
        let mut created = Vec::new();
        let child = ChildDef {
            name,
            service,
            data,
            site,
        };
        let result = self.mount_node(&mut services, ROOT_PATH, 0, child, runner, &mut created);
        if let Err(err) = &result {
            tracing::warn!(error = %err, "service mount failed, unwinding");
            self.unmount_nodes(&mut services, created, runner);
        }
        result
    }

    fn mount_node(
        &self,
        services: &mut BTreeMap<String, Arc<ServiceNode>>,
        parent: &str,
        parent_depth: usize,
        def: ChildDef,
        runner: &dyn LifecycleRunner,
        created: &mut Vec<Arc<ServiceNode>>,
    ) -> Result<(), RpcError> {
        let ChildDef {
            name,
            service,
            data,
            site,
        } = def;
        if !self.service_name.is_match(&name) {
            return Err(config_error(format!("service name {name:?} is illegal"), site));
        }
        let path = format!("{parent}.{name}");
        let depth = parent_depth + 1;
        if depth > self.max_node_depth {
            return Err(config_error(format!("service path {path} is too long"), site));
        }
        if let Some(existing) = services.get(&path) {
            return Err(config_error(
                format!("service {path} is duplicated\n{}", existing.site),
                site,
            ));
        }

        let node = Arc::new(ServiceNode {
            path: path.clone(),
            depth,
            data: ServiceData::new(data),
            site,
            mounted: AtomicBool::new(false),
        });
        let Service { actions, children } = service;
        let actions = self.build_actions(&node, actions)?;

        services.insert(path.clone(), Arc::clone(&node));
        created.push(Arc::clone(&node));
        self.publish(|table| {
            for action in actions {
                table.insert(action.path.clone(), action);
            }
        });

        let on_mount = format!("{path}:{ON_MOUNT}");
        if self.lookup(&on_mount).is_some() {
            runner
                .run_lifecycle(&on_mount)
                .map_err(|err| config_error(format!("{on_mount} failed: {}", err.message()), site))?;
        }
        node.mounted.store(true, Ordering::Release);
        tracing::debug!(service = %path, depth, "service mounted");

        for child in children {
            self.mount_node(services, &path, depth, child, runner, created)?;
        }
        Ok(())
    }

    fn build_actions(
        &self,
        node: &Arc<ServiceNode>,
        defs: Vec<ActionDef>,
    ) -> Result<Vec<Arc<Action>>, RpcError> {
        let mut sites: HashMap<String, SourceSite> = HashMap::new();
        let mut actions = Vec::with_capacity(defs.len());
        for def in defs {
            let ActionDef {
                name,
                handler,
                site,
            } = def;
            let path = format!("{}:{name}", node.path);
            if !self.action_name.is_match(&name) {
                return Err(config_error(format!("action name {name:?} is illegal"), site));
            }
            let handler = handler.map_err(|message| config_error(message, site))?;
            if name.starts_with('$') && !handler.arg_kinds().is_empty() {
                return Err(config_error(
                    format!("system action {path} must not take arguments"),
                    site,
                ));
            }
            if let Some(previous) = sites.insert(name.clone(), site) {
                return Err(config_error(
                    format!("action {path} is duplicated\n{previous}"),
                    site,
                ));
            }
            let cached = self
                .cache
                .as_ref()
                .and_then(|cache| cache.get(handler.kind()));
            actions.push(Arc::new(Action {
                path,
                name,
                handler,
                cached,
                site,
                perf: PerfIndicator::default(),
                service: Arc::clone(node),
            }));
        }
        Ok(actions)
    }

    /// 卸载 `prefix` 及其全部子服务，返回移除的节点数；`#` 表示整棵树。
    pub(crate) fn unmount(&self, prefix: &str, runner: &dyn LifecycleRunner) -> usize {
        let mut services = self.services.lock();
        let nodes: Vec<Arc<ServiceNode>> = services
            .values()
            .filter(|node| in_subtree(&node.path, prefix))
            .cloned()
            .collect();
        self.unmount_nodes(&mut services, nodes, runner)
    }

    fn unmount_nodes(
        &self,
        services: &mut BTreeMap<String, Arc<ServiceNode>>,
        mut nodes: Vec<Arc<ServiceNode>>,
        runner: &dyn LifecycleRunner,
    ) -> usize {
        // 子节点先于父节点触发 `$onUnmount`。
        nodes.sort_by(|a, b| b.depth.cmp(&a.depth).then_with(|| b.path.cmp(&a.path)));
        for node in &nodes {
            if !node.mounted.swap(false, Ordering::AcqRel) {
                continue;
            }
            let on_unmount = format!("{}:{ON_UNMOUNT}", node.path);
            if self.lookup(&on_unmount).is_some()
                && let Err(err) = runner.run_lifecycle(&on_unmount)
            {
                tracing::warn!(service = %node.path, error = %err, "$onUnmount failed");
            }
        }
        let removed: HashSet<&str> = nodes.iter().map(|node| node.path.as_str()).collect();
        for path in &removed {
            services.remove(*path);
        }
        self.publish(|table| {
            table.retain(|_, action| !removed.contains(action.service.path.as_str()));
        });
        nodes.len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("max_node_depth", &self.max_node_depth)
            .field("actions", &self.table.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    struct NoopRunner;

    impl LifecycleRunner for NoopRunner {
        fn run_lifecycle(&self, _path: &str) -> Result<(), RpcError> {
            Ok(())
        }
    }

    struct FailingRunner(&'static str);

    impl LifecycleRunner for FailingRunner {
        fn run_lifecycle(&self, path: &str) -> Result<(), RpcError> {
            if path == self.0 {
                Err(codes::ACTION.with_message("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn registry(max_depth: usize) -> Registry {
        Registry::new(max_depth, None).expect("名称模式应当可编译")
    }

    fn echo() -> Service {
        Service::new().on("Echo", |rt: Runtime, v: i64| rt.ok(v))
    }

    #[test]
    fn paths_are_rooted_at_hash() {
        let registry = registry(8);
        let meta = ServiceMeta::new(
            "user",
            echo().add_child_service("profile", echo(), Map::new()),
            Map::new(),
        );
        registry.mount(meta, &NoopRunner).expect("挂载应当成功");
        assert!(registry.lookup("#.user:Echo").is_some());
        assert!(registry.lookup("#.user.profile:Echo").is_some());
        assert_eq!(registry.kinds(), vec!["I".to_owned()]);
    }

    #[test]
    fn illegal_names_are_rejected() {
        let registry = registry(8);
        let err = registry
            .mount(ServiceMeta::new("bad-name", echo(), Map::new()), &NoopRunner)
            .expect_err("含连字符的服务名应当被拒绝");
        assert!(err.is(&codes::SERVICE_CONFIG));
        assert!(err.message().starts_with("service name \"bad-name\" is illegal\n"));

        let service = Service::new().on("9Op", |rt: Runtime| rt.ok(()));
        let err = registry
            .mount(ServiceMeta::new("svc", service, Map::new()), &NoopRunner)
            .expect_err("数字开头的动作名应当被拒绝");
        assert!(err.message().starts_with("action name \"9Op\" is illegal"));
        assert!(registry.service_paths().is_empty(), "失败的挂载不应留下节点");
    }

    #[test]
    fn depth_limit_names_full_path() {
        let registry = registry(2);
        let nested = Service::new().add_child_service(
            "b",
            Service::new().add_child_service("c", echo(), Map::new()),
            Map::new(),
        );
        let err = registry
            .mount(ServiceMeta::new("a", nested, Map::new()), &NoopRunner)
            .expect_err("第三层应当超出深度上限");
        assert!(err.message().starts_with("service path #.a.b.c is too long"));
        assert!(registry.service_paths().is_empty());
    }

    #[test]
    fn duplicate_service_reports_both_sites() {
        let registry = registry(8);
        registry
            .mount(ServiceMeta::new("dup", echo(), Map::new()), &NoopRunner)
            .expect("首次挂载应当成功");
        let err = registry
            .mount(ServiceMeta::new("dup", echo(), Map::new()), &NoopRunner)
            .expect_err("重复路径应当被拒绝");
        let lines: Vec<&str> = err.message().lines().collect();
        assert_eq!(lines[0], "service #.dup is duplicated");
        assert_eq!(lines.len(), 3, "应包含两处定义位置: {lines:?}");
        assert!(lines[1].contains("registry.rs") && lines[2].contains("registry.rs"));
        assert!(registry.lookup("#.dup:Echo").is_some(), "已有服务不受影响");
    }

    #[test]
    fn system_actions_take_no_arguments() {
        let registry = registry(8);
        let service = Service::new().on("$onMount", |rt: Runtime, _: bool| rt.ok(()));
        let err = registry
            .mount(ServiceMeta::new("svc", service, Map::new()), &NoopRunner)
            .expect_err("带参数的系统动作应当被拒绝");
        assert!(err
            .message()
            .starts_with("system action #.svc:$onMount must not take arguments"));
    }

    #[test]
    fn failing_child_mount_unwinds_whole_subtree() {
        let registry = registry(8);
        let child = Service::new().on("$onMount", |rt: Runtime| rt.ok(()));
        let parent = Service::new()
            .on("$onMount", |rt: Runtime| rt.ok(()))
            .add_child_service("child", child, Map::new());
        let err = registry
            .mount(
                ServiceMeta::new("parent", parent, Map::new()),
                &FailingRunner("#.parent.child:$onMount"),
            )
            .expect_err("子服务 $onMount 失败应当导致挂载失败");
        assert!(err.message().starts_with("#.parent.child:$onMount failed: boom"));
        assert!(registry.service_paths().is_empty());
        assert!(registry.lookup("#.parent:$onMount").is_none());
    }

    #[test]
    fn unmount_prefix_keeps_siblings() {
        let registry = registry(8);
        registry
            .mount(ServiceMeta::new("ab", echo(), Map::new()), &NoopRunner)
            .expect("挂载 ab");
        registry
            .mount(
                ServiceMeta::new("a", echo().add_child_service("x", echo(), Map::new()), Map::new()),
                &NoopRunner,
            )
            .expect("挂载 a");
        assert_eq!(registry.unmount("#.a", &NoopRunner), 2);
        assert_eq!(registry.service_paths(), vec!["#.ab".to_owned()]);
        assert!(registry.lookup("#.a.x:Echo").is_none());
    }
}
