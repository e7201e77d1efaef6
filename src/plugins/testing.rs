//! 测试支持: 记录调用的假加载器、假实现对象与清单写入工具

use super::capability::{ConstructArgs, ExtensionObject, InterfaceInfo};
use super::descriptor::{ExternalValue, PluginDescriptor};
use super::engine::Engine;
use super::loader::{ensure_loaded, PluginLoader};
use super::loader_registry::LoaderRegistry;
use super::object_module::LoaderFactory;
use crate::config::{EngineConfig, RegistryOptions};
use crate::error::{PluginError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 测试清单使用的语言
pub const FAKE_LANGUAGE: &str = "lua5.1";

/// 挂在描述符上的加载状态
#[derive(Debug)]
pub struct FakeModule {
    pub module_name: String,
}

/// 记录所有调用的加载器
///
/// 插件提供的接口由清单中的 `X-Provides=IfaceA,IfaceB` 声明。
pub struct FakeLoader {
    global: bool,
    failing_initialize: bool,
    initialize_count: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    log: Mutex<Vec<String>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            global: true,
            failing_initialize: false,
            initialize_count: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    pub fn with_failing_initialize(mut self) -> Self {
        self.failing_initialize = true;
        self
    }

    /// 让某个模块的加载失败
    pub fn fail_module(&self, module_name: &str) {
        self.failing.lock().insert(module_name.to_string());
    }

    pub fn initialize_count(&self) -> usize {
        self.initialize_count.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// 作为注册表后端使用
    pub fn factory(self: &Arc<Self>) -> LoaderFactory {
        let loader = self.clone();
        Arc::new(move || {
            let loader: Arc<dyn PluginLoader> = loader.clone();
            loader
        })
    }

    fn provides(info: &PluginDescriptor, iface: &InterfaceInfo) -> bool {
        match info.external_data("Provides") {
            Some(ExternalValue::String(list)) => list.split(',').any(|name| name.trim() == iface.name),
            _ => false,
        }
    }
}

impl PluginLoader for FakeLoader {
    fn initialize(&self) -> Result<()> {
        self.initialize_count.fetch_add(1, Ordering::SeqCst);
        if self.failing_initialize {
            return Err(PluginError::loader_unavailable(FAKE_LANGUAGE, "runtime missing"));
        }
        Ok(())
    }

    fn is_global(&self) -> bool {
        self.global
    }

    fn load(&self, info: &Arc<PluginDescriptor>) -> Result<()> {
        let name = info.module_name().to_string();
        self.log.lock().push(format!("load:{}", name));

        if self.failing.lock().contains(&name) {
            return Err(PluginError::load_failed(&name, "module refused to load"));
        }

        info.set_loader_data(Arc::new(FakeModule { module_name: name }));
        Ok(())
    }

    fn unload(&self, info: &Arc<PluginDescriptor>) {
        self.log.lock().push(format!("unload:{}", info.module_name()));
        info.clear_loader_data();
    }

    fn provides_capability(&self, info: &Arc<PluginDescriptor>, iface: &InterfaceInfo) -> Result<bool> {
        ensure_loaded(info)?;
        Ok(Self::provides(info, iface))
    }

    fn create_capability(
        &self,
        info: &Arc<PluginDescriptor>,
        iface: &InterfaceInfo,
        args: ConstructArgs,
    ) -> Result<Option<Arc<dyn ExtensionObject>>> {
        ensure_loaded(info)?;
        if !Self::provides(info, iface) {
            return Ok(None);
        }

        Ok(Some(Arc::new(FakeObject {
            plugin: info.module_name().to_string(),
            saw_plugin_info: args.plugin_info().is_some(),
            args,
            calls: Mutex::new(Vec::new()),
        })))
    }

    fn garbage_collect(&self) {
        self.log.lock().push("gc".to_string());
    }
}

/// 假实现对象，返回所属插件名
pub struct FakeObject {
    pub plugin: String,
    pub saw_plugin_info: bool,
    pub args: ConstructArgs,
    pub calls: Mutex<Vec<String>>,
}

impl ExtensionObject for FakeObject {
    fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value> {
        self.calls.lock().push(method.to_string());
        if method == "fail" {
            return Err(PluginError::call(method, &self.plugin));
        }
        Ok(Value::String(self.plugin.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 在 `dir` 下写入 `<module>.plugin`，`extra` 追加到 `[Plugin]` 组
pub fn write_manifest(dir: &Path, module: &str, extra: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("{}.plugin", module));
    let content = format!(
        "[Plugin]\nModule={}\nName={}\nLoader={}\n{}",
        module, module, FAKE_LANGUAGE, extra
    );
    std::fs::write(&path, content).unwrap();
    path
}

/// 使用私有注册表和假加载器的引擎
pub fn fake_engine(config: &EngineConfig) -> (Arc<Engine>, Arc<FakeLoader>) {
    let registry = Arc::new(LoaderRegistry::new(RegistryOptions::default()));
    let fake = Arc::new(FakeLoader::new());
    registry.register_backend(FAKE_LANGUAGE, fake.factory()).unwrap();

    let engine = Engine::with_registry(registry, config);
    engine.enable_language(FAKE_LANGUAGE).unwrap();
    (Arc::new(engine), fake)
}
