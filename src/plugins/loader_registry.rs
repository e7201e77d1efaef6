//! 加载器注册表
//!
//! 每种语言在进程内至多一个全局加载器实例，由注册表持有；非全局加载器由各引擎
//! 私有。加载器在第一次真正需要时才创建。相互冲突的语言（例如同一解释器的两个
//! 不兼容主版本）不能在同一进程中同时启用。

use super::descriptor::canonical_language;
use super::extension::ProxyBuilder;
use super::loader::PluginLoader;
use super::native_loader::NativeLoader;
use super::object_module::{LoaderFactory, ObjectModule};
use crate::config::RegistryOptions;
use crate::error::{PluginError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 语言描述
#[derive(Debug)]
pub struct LanguageSpec {
    /// 清单中 `Loader` 的取值
    pub name: &'static str,
    /// 加载器后端模块名
    pub module_name: &'static str,
    /// 不能同时启用的语言
    pub conflicts: &'static [&'static str],
}

/// 支持的语言
pub static LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        name: "native",
        module_name: "nativeloader",
        conflicts: &[],
    },
    LanguageSpec {
        name: "lua5.1",
        module_name: "lua51loader",
        conflicts: &[],
    },
    LanguageSpec {
        name: "python",
        module_name: "pythonloader",
        conflicts: &["python3"],
    },
    LanguageSpec {
        name: "python3",
        module_name: "python3loader",
        conflicts: &["python"],
    },
];

/// 本地语言编号
pub const NATIVE_LANGUAGE_ID: usize = 0;

/// 语言名称对应的编号
pub fn language_id(name: &str) -> Option<usize> {
    let name = canonical_language(name);
    LANGUAGES.iter().position(|l| l.name == name)
}

/// 语言编号对应的名称
pub fn language_name(id: usize) -> &'static str {
    LANGUAGES.get(id).map(|l| l.name).unwrap_or("unknown")
}

#[derive(Default)]
struct GlobalLoaderInfo {
    loader: Option<Arc<dyn PluginLoader>>,
    enabled: bool,
    failed: bool,
}

struct RegistryState {
    loaders: Vec<GlobalLoaderInfo>,
    backends: HashMap<usize, LoaderFactory>,
    /// 加载器后端模块，常驻
    modules: HashMap<usize, Arc<ObjectModule>>,
    shut_down: bool,
}

/// 引擎私有的加载器槽位
#[derive(Default, Clone)]
pub(crate) struct LocalLoaderInfo {
    pub(crate) loader: Option<Arc<dyn PluginLoader>>,
    pub(crate) enabled: bool,
    pub(crate) failed: bool,
}

/// 每个引擎持有一份
pub(crate) struct EngineLoaders {
    pub(crate) slots: Vec<LocalLoaderInfo>,
    pub(crate) nonglobal: bool,
}

impl EngineLoaders {
    pub(crate) fn new(nonglobal: bool) -> Self {
        let mut slots = vec![LocalLoaderInfo::default(); LANGUAGES.len()];
        slots[NATIVE_LANGUAGE_ID].enabled = true;
        Self { slots, nonglobal }
    }

    /// 当前持有的加载器
    pub(crate) fn active(&self) -> Vec<Arc<dyn PluginLoader>> {
        self.slots.iter().filter_map(|s| s.loader.clone()).collect()
    }

    /// 释放全部加载器引用
    pub(crate) fn release(&mut self) {
        for slot in &mut self.slots {
            slot.loader = None;
        }
    }
}

/// 进程级默认注册表
static GLOBAL_REGISTRY: Lazy<Arc<LoaderRegistry>> =
    Lazy::new(|| Arc::new(LoaderRegistry::new(RegistryOptions::default())));

/// 加载器注册表
pub struct LoaderRegistry {
    options: RegistryOptions,
    state: Mutex<RegistryState>,
    proxies: ProxyBuilder,
}

impl LoaderRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        let mut loaders: Vec<GlobalLoaderInfo> =
            LANGUAGES.iter().map(|_| GlobalLoaderInfo::default()).collect();
        loaders[NATIVE_LANGUAGE_ID].enabled = true;

        let registry = Self {
            options,
            state: Mutex::new(RegistryState {
                loaders,
                backends: HashMap::new(),
                modules: HashMap::new(),
                shut_down: false,
            }),
            proxies: ProxyBuilder::new(),
        };

        #[cfg(feature = "python")]
        registry.register_python_backend();

        registry
    }

    /// 进程级默认注册表
    pub fn global() -> Arc<LoaderRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// 代理构建器（转发表缓存）
    pub fn proxies(&self) -> &ProxyBuilder {
        &self.proxies
    }

    #[cfg(feature = "python")]
    fn register_python_backend(&self) {
        use super::python_loader::PythonLoader;

        let factory: LoaderFactory = Arc::new(|| {
            let loader: Arc<dyn PluginLoader> = Arc::new(PythonLoader::new());
            loader
        });
        if let Err(e) = self.register_backend("python3", factory) {
            warn!(error = %e, "Failed to register the python3 loader backend");
        }
    }

    /// 注册进程内的加载器后端，优先于加载器模块目录
    pub fn register_backend(&self, language: &str, factory: LoaderFactory) -> Result<()> {
        let id = language_id(language).ok_or_else(|| PluginError::UnknownLanguage {
            language: language.to_string(),
        })?;

        if id == NATIVE_LANGUAGE_ID {
            return Err(PluginError::config("the native loader cannot be replaced"));
        }

        self.state.lock().backends.insert(id, factory);
        debug!("Registered loader backend for '{}'", language_name(id));
        Ok(())
    }

    /// 语言是否在进程范围内启用
    pub fn is_enabled(&self, language: &str) -> bool {
        match language_id(language) {
            Some(id) => self.state.lock().loaders[id].enabled,
            None => false,
        }
    }

    /// 语言是否已被标记为失败
    pub fn is_failed(&self, language: &str) -> bool {
        match language_id(language) {
            Some(id) => self.state.lock().loaders[id].failed,
            None => false,
        }
    }

    /// 为引擎启用一种语言
    pub(crate) fn enable_language(&self, local: &mut EngineLoaders, name: &str) -> Result<()> {
        let Some(id) = language_id(name) else {
            warn!("Failed to enable unknown plugin loader '{}'", name);
            return Err(PluginError::UnknownLanguage {
                language: name.to_string(),
            });
        };

        let slot = &mut local.slots[id];
        if slot.enabled {
            return Ok(());
        }
        if slot.failed {
            return Err(PluginError::loader_unavailable(
                language_name(id),
                "the loader previously failed",
            ));
        }

        let mut state = self.state.lock();

        if state.loaders[id].enabled {
            slot.enabled = true;
            return Ok(());
        }

        if !self.options.allow_conflicting_loaders {
            for conflict in LANGUAGES[id].conflicts {
                let Some(conflict_id) = language_id(conflict) else {
                    continue;
                };
                if !state.loaders[conflict_id].enabled {
                    continue;
                }

                error!(
                    "Cannot enable plugin loader '{}' as the '{}' plugin loader is already enabled",
                    language_name(id),
                    conflict
                );
                slot.failed = true;
                state.loaders[id].failed = true;
                return Err(PluginError::LoaderConflict {
                    language: language_name(id).to_string(),
                    active: conflict.to_string(),
                });
            }
        }

        // 延迟到第一次使用时再创建加载器
        slot.enabled = true;
        state.loaders[id].enabled = true;
        info!("Plugin loader '{}' enabled", language_name(id));
        Ok(())
    }

    /// 获取引擎可用的加载器
    pub(crate) fn plugin_loader(&self, local: &mut EngineLoaders, id: usize) -> Result<Arc<dyn PluginLoader>> {
        let name = language_name(id);

        {
            let slot = &local.slots[id];
            if let Some(loader) = &slot.loader {
                return Ok(loader.clone());
            }
            if slot.failed {
                return Err(PluginError::loader_unavailable(name, "the loader failed to initialize"));
            }
        }

        if !local.slots[id].enabled {
            if !self.state.lock().loaders[id].enabled {
                warn!("The '{}' plugin loader has not been enabled", name);
                return Err(PluginError::loader_unavailable(name, "the loader has not been enabled"));
            }

            warn!(
                "The '{}' plugin loader was not enabled for this engine, enabling it now",
                name
            );
            self.enable_language(local, name)?;
        }

        let nonglobal = local.nonglobal;
        let loader = {
            let mut state = self.state.lock();
            self.local_plugin_loader(&mut state, id, nonglobal)
        };

        let slot = &mut local.slots[id];
        match loader {
            Some(loader) => {
                slot.loader = Some(loader.clone());
                Ok(loader)
            }
            None => {
                slot.failed = true;
                Err(PluginError::loader_unavailable(name, "the loader failed to initialize"))
            }
        }
    }

    fn local_plugin_loader(
        &self,
        state: &mut RegistryState,
        id: usize,
        nonglobal: bool,
    ) -> Option<Arc<dyn PluginLoader>> {
        if state.loaders[id].failed || state.shut_down {
            return None;
        }

        if let Some(loader) = &state.loaders[id].loader {
            if !nonglobal || loader.is_global() {
                return Some(loader.clone());
            }
        }

        let Some(loader) = self.create_plugin_loader(state, id) else {
            state.loaders[id].failed = true;
            return None;
        };

        if !nonglobal || loader.is_global() {
            state.loaders[id].loader = Some(loader.clone());
        }

        Some(loader)
    }

    fn create_plugin_loader(&self, state: &mut RegistryState, id: usize) -> Option<Arc<dyn PluginLoader>> {
        let name = language_name(id);

        let loader: Option<Arc<dyn PluginLoader>> = if id == NATIVE_LANGUAGE_ID {
            Some(Arc::new(NativeLoader::new()))
        } else if let Some(factory) = state.backends.get(&id) {
            Some(factory())
        } else {
            self.loader_module(state, id).and_then(|module| module.create_loader())
        };

        let Some(loader) = loader else {
            warn!("Loader '{}' is not a valid plugin loader", name);
            return None;
        };

        if let Err(e) = loader.initialize() {
            warn!(error = %e, "Loader '{}' failed to initialize", name);
            return None;
        }

        info!("Plugin loader '{}' created", name);
        Some(loader)
    }

    fn loader_module(&self, state: &mut RegistryState, id: usize) -> Option<Arc<ObjectModule>> {
        if let Some(module) = state.modules.get(&id) {
            return Some(module.clone());
        }

        let spec = &LANGUAGES[id];
        let mut module = ObjectModule::new(spec.module_name, &self.options.loader_dir(spec.name));

        if let Err(e) = module.load() {
            warn!(error = %e, "Could not load plugin loader '{}'", spec.name);
            return None;
        }

        let module = Arc::new(module);
        state.modules.insert(id, module.clone());
        Some(module)
    }

    /// 释放全部全局加载器，并把所有语言标记为失败
    ///
    /// 之后创建的引擎只能使用已经持有的加载器实例。
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }

        for info in &mut state.loaders {
            info.loader = None;
            info.failed = true;
        }
        state.shut_down = true;
        info!("Loader registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

impl fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let languages: Vec<String> = LANGUAGES
            .iter()
            .zip(state.loaders.iter())
            .map(|(spec, info)| {
                format!(
                    "{}(enabled={}, failed={}, instance={})",
                    spec.name,
                    info.enabled,
                    info.failed,
                    info.loader.is_some()
                )
            })
            .collect();
        f.debug_struct("LoaderRegistry")
            .field("options", &self.options)
            .field("languages", &languages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::FakeLoader;

    fn registry() -> LoaderRegistry {
        LoaderRegistry::new(RegistryOptions::default())
    }

    fn backend(loader: Arc<FakeLoader>) -> LoaderFactory {
        Arc::new(move || {
            let loader: Arc<dyn PluginLoader> = loader.clone();
            loader
        })
    }

    #[test]
    fn test_language_table() {
        assert_eq!(language_id("native"), Some(NATIVE_LANGUAGE_ID));
        assert_eq!(language_id("C"), Some(NATIVE_LANGUAGE_ID));
        assert_eq!(language_id("Python3"), Some(3));
        assert_eq!(language_id("cobol"), None);
        assert_eq!(language_name(2), "python");
    }

    #[test]
    fn test_native_loader_is_always_enabled() {
        let registry = registry();
        let mut local = EngineLoaders::new(false);

        assert!(registry.is_enabled("native"));
        let first = registry.plugin_loader(&mut local, NATIVE_LANGUAGE_ID).unwrap();
        let second = registry.plugin_loader(&mut local, NATIVE_LANGUAGE_ID).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_conflicting_languages() {
        let registry = registry();
        let mut local = EngineLoaders::new(false);

        registry.enable_language(&mut local, "python").unwrap();
        let err = registry.enable_language(&mut local, "python3").unwrap_err();

        assert!(matches!(err, PluginError::LoaderConflict { .. }));
        assert!(registry.is_enabled("python"));
        assert!(!registry.is_enabled("python3"));
        assert!(registry.is_failed("python3"));

        // 其它引擎同样不能再启用
        let mut other = EngineLoaders::new(false);
        assert!(registry.enable_language(&mut other, "python3").is_err());
        assert!(registry.enable_language(&mut other, "python").is_ok());
    }

    #[test]
    fn test_conflicts_can_be_allowed() {
        let registry = LoaderRegistry::new(RegistryOptions {
            allow_conflicting_loaders: true,
            ..RegistryOptions::default()
        });
        let mut local = EngineLoaders::new(false);

        registry.enable_language(&mut local, "python").unwrap();
        registry.enable_language(&mut local, "python3").unwrap();
        assert!(registry.is_enabled("python3"));
    }

    #[test]
    fn test_unknown_language() {
        let registry = registry();
        let mut local = EngineLoaders::new(false);
        assert!(matches!(
            registry.enable_language(&mut local, "cobol"),
            Err(PluginError::UnknownLanguage { .. })
        ));
    }

    #[test]
    fn test_loader_is_created_lazily_and_shared() {
        let registry = registry();
        let fake = Arc::new(FakeLoader::new());
        registry.register_backend("lua5.1", backend(fake.clone())).unwrap();

        let mut a = EngineLoaders::new(false);
        let mut b = EngineLoaders::new(false);

        registry.enable_language(&mut a, "lua5.1").unwrap();
        assert_eq!(fake.initialize_count(), 0);

        let la = registry.plugin_loader(&mut a, 1).unwrap();
        assert_eq!(fake.initialize_count(), 1);

        // b 没有启用，但全局已启用：自动启用并复用同一个实例
        let lb = registry.plugin_loader(&mut b, 1).unwrap();
        assert!(Arc::ptr_eq(&la, &lb));
        assert_eq!(fake.initialize_count(), 1);
    }

    #[test]
    fn test_nonglobal_engines_get_private_instances() {
        let registry = registry();
        let created = Arc::new(Mutex::new(Vec::<Arc<FakeLoader>>::new()));
        let sink = created.clone();
        let factory: LoaderFactory = Arc::new(move || {
            let fake = Arc::new(FakeLoader::new().with_global(false));
            sink.lock().push(fake.clone());
            let loader: Arc<dyn PluginLoader> = fake;
            loader
        });
        registry.register_backend("lua5.1", factory).unwrap();

        let mut a = EngineLoaders::new(true);
        let mut b = EngineLoaders::new(true);
        registry.enable_language(&mut a, "lua5.1").unwrap();
        registry.enable_language(&mut b, "lua5.1").unwrap();

        let la = registry.plugin_loader(&mut a, 1).unwrap();
        let lb = registry.plugin_loader(&mut b, 1).unwrap();
        assert!(!Arc::ptr_eq(&la, &lb));
        assert_eq!(created.lock().len(), 2);
    }

    #[test]
    fn test_not_enabled_anywhere() {
        let registry = registry();
        let mut local = EngineLoaders::new(false);
        assert!(matches!(
            registry.plugin_loader(&mut local, 1),
            Err(PluginError::LoaderUnavailable { .. })
        ));
    }

    #[test]
    fn test_failed_initialize_marks_language_failed() {
        let registry = registry();
        let fake = Arc::new(FakeLoader::new().with_failing_initialize());
        registry.register_backend("lua5.1", backend(fake)).unwrap();

        let mut local = EngineLoaders::new(false);
        registry.enable_language(&mut local, "lua5.1").unwrap();

        assert!(registry.plugin_loader(&mut local, 1).is_err());
        assert!(registry.is_failed("lua5.1"));
        assert!(registry.plugin_loader(&mut local, 1).is_err());
    }

    #[test]
    fn test_missing_loader_module() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LoaderRegistry::new(RegistryOptions {
            lib_dir: dir.path().to_path_buf(),
            allow_conflicting_loaders: false,
        });
        let mut local = EngineLoaders::new(false);
        registry.enable_language(&mut local, "lua5.1").unwrap();

        assert!(registry.plugin_loader(&mut local, 1).is_err());
        assert!(registry.is_failed("lua5.1"));
    }

    #[test]
    fn test_shutdown_releases_loaders() {
        let registry = registry();
        let mut local = EngineLoaders::new(false);
        registry.plugin_loader(&mut local, NATIVE_LANGUAGE_ID).unwrap();

        registry.shutdown();
        assert!(registry.is_shut_down());

        let mut fresh = EngineLoaders::new(false);
        assert!(registry.plugin_loader(&mut fresh, NATIVE_LANGUAGE_ID).is_err());

        // 已经持有的实例不受影响
        assert!(registry.plugin_loader(&mut local, NATIVE_LANGUAGE_ID).is_ok());
    }

    #[test]
    fn test_native_backend_cannot_be_replaced() {
        let registry = registry();
        let fake = Arc::new(FakeLoader::new());
        assert!(registry.register_backend("native", backend(fake)).is_err());
    }
}
