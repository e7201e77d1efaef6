//! 插件引擎
//!
//! 持有有序的描述符注册表和搜索路径，负责依赖解析、加载/卸载编排以及扩展创建。
//! 引擎的所有操作都在调用者线程上同步完成；需要并发时，每个线程使用各自的引擎
//! 并启用非全局加载器。

use super::capability::{Capability, ConstructArgs, InterfaceInfo};
use super::dependency::VersionConstraint;
use super::descriptor::{PluginDescriptor, Transition};
use super::extension::Extension;
use super::loader::{ensure_loaded, PluginLoader};
use super::loader_registry::{language_id, EngineLoaders, LoaderRegistry};
use crate::config::EngineConfig;
use crate::error::{PluginError, Result};
use crate::events::{EventHub, HandlerId, HookStage, PluginEvent, PluginHook};
use crate::types::{PluginId, SearchPath, MANIFEST_EXTENSION};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 插件引擎
pub struct Engine {
    registry: Arc<LoaderRegistry>,
    /// 按依赖排序的描述符
    plugins: RwLock<Vec<Arc<PluginDescriptor>>>,
    search_paths: RwLock<Vec<SearchPath>>,
    loaders: Mutex<EngineLoaders>,
    events: EventHub,
    locale: Option<String>,
    scan_depth: u32,
    in_dispose: AtomicBool,
}

impl Engine {
    /// 使用进程级加载器注册表的空引擎
    pub fn new() -> Self {
        Self::with_registry(LoaderRegistry::global(), &EngineConfig::default())
    }

    /// 非全局语言的加载器由本引擎私有
    pub fn new_with_nonglobal_loaders() -> Self {
        let config = EngineConfig {
            nonglobal_loaders: true,
            ..EngineConfig::default()
        };
        Self::with_registry(LoaderRegistry::global(), &config)
    }

    /// 指定加载器注册表创建引擎
    ///
    /// 只读取配置中的引擎参数；搜索路径、语言与插件列表由 [`Engine::from_config`] 处理。
    pub fn with_registry(registry: Arc<LoaderRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            plugins: RwLock::new(Vec::new()),
            search_paths: RwLock::new(Vec::new()),
            loaders: Mutex::new(EngineLoaders::new(config.nonglobal_loaders)),
            events: EventHub::new(),
            locale: config.locale.clone(),
            scan_depth: config.scan_depth,
            in_dispose: AtomicBool::new(false),
        }
    }

    /// 按配置构建引擎: 搜索路径、启用语言、加载插件
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::from_config_with_registry(LoaderRegistry::global(), config)
    }

    pub fn from_config_with_registry(registry: Arc<LoaderRegistry>, config: &EngineConfig) -> Result<Self> {
        let engine = Self::with_registry(registry, config);

        for language in &config.enabled_languages {
            engine.enable_language(language)?;
        }

        for sp in &config.search_paths {
            engine.insert_search_path(false, sp.to_search_path());
        }

        if !config.loaded_plugins.is_empty() {
            engine.set_loaded_plugins(&config.loaded_plugins);
        }

        info!(
            "Engine configured with {} plugin(s), {} loaded",
            engine.plugin_list().len(),
            engine.get_loaded_plugins().len()
        );
        Ok(engine)
    }

    pub fn registry(&self) -> &Arc<LoaderRegistry> {
        &self.registry
    }

    /// 事件中心
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    // ---- 搜索路径与扫描 ----

    /// 追加搜索路径并立即扫描
    pub fn add_search_path(&self, module_dir: impl AsRef<Path>, data_dir: Option<&Path>) {
        self.insert_search_path(false, SearchPath::new(module_dir, data_dir));
    }

    /// 在最前面插入搜索路径并立即扫描
    pub fn prepend_search_path(&self, module_dir: impl AsRef<Path>, data_dir: Option<&Path>) {
        self.insert_search_path(true, SearchPath::new(module_dir, data_dir));
    }

    fn insert_search_path(&self, prepend: bool, sp: SearchPath) {
        {
            let mut paths = self.search_paths.write();
            if prepend {
                paths.insert(0, sp.clone());
            } else {
                paths.push(sp.clone());
            }
        }
        info!("Added plugin search path: {:?}", sp.module_dir);

        if self.scan_search_path(&sp) {
            self.plugin_list_changed();
        }
    }

    pub fn search_paths(&self) -> Vec<SearchPath> {
        self.search_paths.read().clone()
    }

    /// 重新扫描所有搜索路径，只添加新发现的插件，不改变已有顺序
    pub fn rescan(&self) {
        let paths = self.search_paths();
        if paths.is_empty() {
            debug!("No search paths were provided");
            return;
        }

        let mut found = false;
        for sp in &paths {
            found |= self.scan_search_path(sp);
        }

        if found {
            self.plugin_list_changed();
        }
    }

    fn scan_search_path(&self, sp: &SearchPath) -> bool {
        debug!("Loading {}/*.{}...", sp.module_dir.display(), MANIFEST_EXTENSION);
        self.scan_dir(&sp.module_dir, &sp.data_dir, self.scan_depth)
    }

    fn scan_dir(&self, module_dir: &Path, data_dir: &Path, recursions: u32) -> bool {
        let entries = match std::fs::read_dir(module_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot read '{}': {}", module_dir.display(), e);
                return false;
            }
        };

        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();

        let mut found = false;
        for path in paths {
            if path.is_dir() {
                if recursions > 0 {
                    found |= self.scan_dir(&path, data_dir, recursions - 1);
                }
            } else if path.extension().map_or(false, |ext| ext == MANIFEST_EXTENSION) {
                found |= self.load_manifest(&path, module_dir, data_dir);
            }
        }
        found
    }

    fn load_manifest(&self, filename: &Path, module_dir: &Path, data_dir: &Path) -> bool {
        let info = match PluginDescriptor::from_file(filename, module_dir, data_dir, self.locale.as_deref()) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Error loading '{}'", filename.display());
                return false;
            }
        };

        if let Some(existing) = self.get_plugin_info(info.module_name()) {
            if existing.filename() == filename {
                debug!("Plugin '{}' is already registered", info.module_name());
            } else {
                debug!(
                    "Skipping '{}': plugin '{}' was already found in '{}'",
                    filename.display(),
                    info.module_name(),
                    existing.filename().display()
                );
            }
            return false;
        }

        self.insert_descriptor(Arc::new(info)).is_ok()
    }

    /// 按依赖位置插入: 紧跟在位置最靠后的已注册依赖之后，没有则放在最前
    fn insert_descriptor(&self, info: Arc<PluginDescriptor>) -> Result<()> {
        let mut plugins = self.plugins.write();

        if plugins.iter().any(|p| p.module_name() == info.module_name()) {
            return Err(PluginError::precondition(&format!(
                "plugin '{}' is already registered",
                info.module_name()
            )));
        }

        let position = plugins
            .iter()
            .rposition(|p| info.has_dependency(p.module_name()))
            .map_or(0, |i| i + 1);

        debug!("Registered plugin '{}' at position {}", info.module_name(), position);
        plugins.insert(position, info);
        Ok(())
    }

    /// 直接注册一个描述符（不经过目录扫描）
    pub fn register_descriptor(&self, info: PluginDescriptor) -> Result<Arc<PluginDescriptor>> {
        let info = Arc::new(info);
        self.insert_descriptor(info.clone())?;
        self.plugin_list_changed();
        Ok(info)
    }

    fn plugin_list_changed(&self) {
        let plugins = self.plugin_list();
        debug!(
            "Plugins: {}",
            plugins.iter().map(|p| p.module_name()).collect::<Vec<_>>().join(", ")
        );
        self.events.emit_plugin_list(&plugins);
    }

    /// 注册表顺序的描述符快照
    pub fn plugin_list(&self) -> Vec<Arc<PluginDescriptor>> {
        self.plugins.read().clone()
    }

    pub fn get_plugin_info(&self, module_name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.module_name() == module_name)
            .cloned()
    }

    // ---- 加载器 ----

    /// 为本引擎启用一种语言
    pub fn enable_language(&self, name: &str) -> Result<()> {
        let mut loaders = self.loaders.lock();
        self.registry.enable_language(&mut loaders, name)
    }

    fn loader_for(&self, info: &PluginDescriptor) -> Result<Arc<dyn PluginLoader>> {
        let id = language_id(info.language()).ok_or_else(|| {
            PluginError::loader_unavailable(info.language(), "unknown plugin loader")
        })?;

        let mut loaders = self.loaders.lock();
        self.registry.plugin_loader(&mut loaders, id)
    }

    /// 通知所有持有的加载器释放跨语言引用
    pub fn garbage_collect(&self) {
        let loaders = self.loaders.lock().active();
        for loader in loaders {
            loader.garbage_collect();
        }
    }

    // ---- 加载与卸载 ----

    /// 加载插件及其依赖
    ///
    /// 已加载或正在加载时直接成功；失败原因会记录在描述符上。
    pub fn load_plugin(&self, info: &Arc<PluginDescriptor>) -> Result<()> {
        if info.is_loaded() || info.transition() == Some(Transition::Loading) {
            return Ok(());
        }

        if !info.is_available() {
            return Err(match info.error() {
                Some(e) => (*e).clone(),
                None => PluginError::load_failed(info.module_name(), "plugin is not available"),
            });
        }

        self.events.emit_hook(self, PluginEvent::Load, HookStage::Before, info);
        self.load_plugin_real(info)?;
        self.events.emit_hook(self, PluginEvent::Load, HookStage::After, info);
        Ok(())
    }

    fn load_plugin_real(&self, info: &Arc<PluginDescriptor>) -> Result<()> {
        info.set_transition(Some(Transition::Loading));
        let result = self.load_dependencies(info).and_then(|_| {
            let loader = self.loader_for(info)?;
            loader.load(info)
        });
        info.set_transition(None);

        if let Err(e) = result {
            warn!(error = %e, "Error loading plugin '{}'", info.module_name());
            info.mark_unavailable(e.clone());
            return Err(e);
        }

        info.set_loaded(true);
        info!("Loaded plugin '{}'", info.module_name());

        if !self.in_dispose.load(Ordering::SeqCst) {
            self.events.emit_loaded_plugins(&self.get_loaded_plugins());
        }
        Ok(())
    }

    fn load_dependencies(&self, info: &Arc<PluginDescriptor>) -> Result<()> {
        for dep in info.dependencies() {
            let Some(dep_info) = self.get_plugin_info(&dep.name) else {
                warn!(
                    "Could not find plugin '{}' for plugin '{}'",
                    dep.name,
                    info.module_name()
                );
                return Err(PluginError::DependencyNotFound {
                    plugin: info.module_name().to_string(),
                    dependency: dep.name.clone(),
                });
            };

            if dep.constraint != VersionConstraint::Any && !dep.check(dep_info.version()) {
                return Err(PluginError::DependencyVersionMismatch {
                    plugin: info.module_name().to_string(),
                    dependency: dep.name.clone(),
                    required: dep.to_string(),
                    found: dep_info.version().unwrap_or("none").to_string(),
                });
            }

            if self.load_plugin(&dep_info).is_err() {
                return Err(PluginError::DependencyLoadFailed {
                    plugin: info.module_name().to_string(),
                    dependency: dep.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// 卸载插件，先卸载依赖它的插件
    pub fn unload_plugin(&self, info: &Arc<PluginDescriptor>) {
        if !info.is_loaded() || info.transition() == Some(Transition::Unloading) {
            return;
        }

        self.events.emit_hook(self, PluginEvent::Unload, HookStage::Before, info);
        self.unload_plugin_real(info);
        self.events.emit_hook(self, PluginEvent::Unload, HookStage::After, info);
    }

    fn unload_plugin_real(&self, info: &Arc<PluginDescriptor>) {
        info.set_transition(Some(Transition::Unloading));
        // 先清除标记，依赖者卸载时的通知里不再包含本插件
        info.set_loaded(false);

        // 从注册表末尾开始，依赖链最深的插件最先卸载
        for other in self.plugin_list().iter().rev() {
            if Arc::ptr_eq(other, info) {
                continue;
            }
            if other.is_loaded()
                && other.transition() != Some(Transition::Unloading)
                && other.has_dependency(info.module_name())
            {
                self.unload_plugin(other);
            }
        }

        match self.loader_for(info) {
            Ok(loader) => {
                loader.garbage_collect();
                loader.unload(info);
            }
            Err(e) => warn!(error = %e, "No loader to unload plugin '{}'", info.module_name()),
        }

        info.set_transition(None);
        info!("Unloaded plugin '{}'", info.module_name());

        // 引擎销毁时不通知，保持宿主记录的已加载列表
        if !self.in_dispose.load(Ordering::SeqCst) {
            self.events.emit_loaded_plugins(&self.get_loaded_plugins());
        }
    }

    /// 已加载插件的模块名，按注册表顺序
    pub fn get_loaded_plugins(&self) -> Vec<PluginId> {
        self.plugins
            .read()
            .iter()
            .filter(|p| p.is_loaded())
            .map(|p| p.module_name().to_string())
            .collect()
    }

    /// 使已加载集合与给定名称一致；未知名称被忽略
    pub fn set_loaded_plugins<S: AsRef<str>>(&self, names: &[S]) {
        for info in self.plugin_list() {
            if !info.is_available() {
                continue;
            }

            let wanted = names.iter().any(|n| n.as_ref() == info.module_name());
            if wanted && !info.is_loaded() {
                if let Err(e) = self.load_plugin(&info) {
                    warn!(error = %e, "Failed to load plugin '{}'", info.module_name());
                }
            } else if !wanted && info.is_loaded() {
                self.unload_plugin(&info);
            }
        }
    }

    // ---- 扩展 ----

    /// 插件是否提供某个接口；未加载时总是 `false`
    pub fn provides_extension(&self, info: &Arc<PluginDescriptor>, iface: &InterfaceInfo) -> bool {
        if !info.is_loaded() {
            return false;
        }

        let provided = self
            .loader_for(info)
            .and_then(|loader| loader.provides_capability(info, iface));
        match provided {
            Ok(provided) => provided,
            Err(e) => {
                warn!(error = %e, "Cannot query plugin '{}'", info.module_name());
                false
            }
        }
    }

    /// 创建实现给定接口的代理
    ///
    /// 第一个接口为主接口，实现对象由它创建，其余接口必须由同一对象满足。
    /// 插件未提供主接口时记录警告并返回 `None`。
    pub fn create_extension(
        &self,
        info: &Arc<PluginDescriptor>,
        interfaces: &[&'static InterfaceInfo],
        args: ConstructArgs,
    ) -> Result<Option<Extension>> {
        ensure_loaded(info)?;
        let primary = interfaces
            .first()
            .ok_or_else(|| PluginError::precondition("at least one interface is required"))?;

        let loader = self.loader_for(info)?;
        let Some(target) = loader.create_capability(info, primary, args)? else {
            warn!(
                "Plugin '{}' does not provide a '{}' extension",
                info.module_name(),
                primary.name
            );
            return Ok(None);
        };

        for iface in interfaces.iter().flat_map(|i| i.with_prerequisites()) {
            if !target.implements(iface) {
                warn!(
                    "Plugin '{}' does not provide a '{}' extension",
                    info.module_name(),
                    iface.name
                );
                return Ok(None);
            }
        }

        self.registry.proxies().build(info, interfaces, target).map(Some)
    }

    /// 创建强类型能力门面
    pub fn create_capability<T: Capability>(
        &self,
        info: &Arc<PluginDescriptor>,
        args: ConstructArgs,
    ) -> Result<Option<T>> {
        Ok(self
            .create_extension(info, &[T::interface()], args)?
            .map(T::from_extension))
    }

    // ---- 事件 ----

    /// 注册加载钩子
    pub fn connect_load<F>(&self, stage: HookStage, hook: F) -> HandlerId
    where
        F: Fn(&Engine, &Arc<PluginDescriptor>) + Send + Sync + 'static,
    {
        let hook: PluginHook = Arc::new(hook);
        self.events.connect_hook(PluginEvent::Load, stage, hook)
    }

    /// 注册卸载钩子
    pub fn connect_unload<F>(&self, stage: HookStage, hook: F) -> HandlerId
    where
        F: Fn(&Engine, &Arc<PluginDescriptor>) + Send + Sync + 'static,
    {
        let hook: PluginHook = Arc::new(hook);
        self.events.connect_hook(PluginEvent::Unload, stage, hook)
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.events.disconnect(id)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.in_dispose.store(true, Ordering::SeqCst);

        for info in self.plugin_list().iter().rev() {
            if info.is_loaded() {
                self.unload_plugin(info);
            }
        }

        self.loaders.lock().release();
        debug!("Engine disposed");
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("search_paths", &*self.search_paths.read())
            .field(
                "plugins",
                &self.plugins.read().iter().map(|p| p.module_name().to_string()).collect::<Vec<_>>(),
            )
            .field("loaded", &self.get_loaded_plugins())
            .finish()
    }
}
