//! 对象模块
//!
//! 包装一个本地插件的代码单元（动态库或进程内注册函数），保存插件在注册阶段
//! 声明的接口实现工厂。模块默认常驻：动态库一经打开便不再卸载，因为插件创建的
//! 对象可能比插件的加载状态活得更久。

use super::capability::{ConstructArgs, ExtensionObject, InterfaceInfo};
use super::loader::PluginLoader;
use crate::error::{PluginError, Result};
use crate::types::REGISTER_TYPES_SYMBOL;
use libloading::{Library, Symbol};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// 插件注册函数
pub type RegisterTypesFn = fn(&mut ObjectModule);

/// 接口实现工厂
pub type ExtensionFactory =
    Arc<dyn Fn(ConstructArgs) -> Result<Arc<dyn ExtensionObject>> + Send + Sync>;

/// 加载器工厂（加载器后端模块使用）
pub type LoaderFactory = Arc<dyn Fn() -> Arc<dyn PluginLoader> + Send + Sync>;

/// 可由对象模块直接构造的实现类型
pub trait ExtensionType: ExtensionObject + Sized + 'static {
    /// 是否声明 `plugin-info` 构造参数
    const ACCEPTS_PLUGIN_INFO: bool = false;

    fn construct(args: ConstructArgs) -> Result<Self>;
}

/// 进程内注册的模块
static EMBEDDED_MODULES: Lazy<RwLock<HashMap<String, RegisterTypesFn>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// 注册一个进程内模块，清单中 `Embedded=<symbol>` 引用它
pub fn register_embedded_module(symbol: &str, register: RegisterTypesFn) {
    debug!("Registering embedded module '{}'", symbol);
    EMBEDDED_MODULES.write().insert(symbol.to_string(), register);
}

fn embedded_module(symbol: &str) -> Option<RegisterTypesFn> {
    EMBEDDED_MODULES.read().get(symbol).copied()
}

/// 为动态库导出注册符号
///
/// ```ignore
/// fn register(module: &mut moses_plugin::ObjectModule) {
///     module.register_extension_type::<MyActivatable>(&moses_plugin::ACTIVATABLE);
/// }
///
/// moses_plugin::declare_plugin!(register);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($register:path) => {
        #[no_mangle]
        pub fn moses_plugin_register_types(module: &mut $crate::plugins::ObjectModule) {
            $register(module)
        }
    };
}

struct Implementation {
    interface: String,
    accepts_plugin_info: bool,
    factory: ExtensionFactory,
}

enum ModuleSource {
    Library(PathBuf),
    Embedded(String),
}

/// 对象模块
pub struct ObjectModule {
    module_name: String,
    source: ModuleSource,
    library: Option<Library>,
    loaded: bool,
    implementations: Vec<Implementation>,
    loader_factory: Option<LoaderFactory>,
}

impl ObjectModule {
    /// 位于 `module_dir` 下的动态库模块，文件名按平台规则由模块名生成
    pub fn new(module_name: &str, module_dir: &Path) -> Self {
        let path = module_dir.join(libloading::library_filename(module_name));
        Self::with_source(module_name, ModuleSource::Library(path))
    }

    /// 进程内注册函数模块
    pub fn new_embedded(module_name: &str, symbol: &str) -> Self {
        Self::with_source(module_name, ModuleSource::Embedded(symbol.to_string()))
    }

    fn with_source(module_name: &str, source: ModuleSource) -> Self {
        Self {
            module_name: module_name.to_string(),
            source,
            library: None,
            loaded: false,
            implementations: Vec::new(),
            loader_factory: None,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// 动态库路径（进程内模块为 `None`）
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            ModuleSource::Library(path) => Some(path),
            ModuleSource::Embedded(_) => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// 打开代码单元并执行注册函数；重复调用不会重复注册
    pub fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }

        let register = match &self.source {
            ModuleSource::Embedded(symbol) => embedded_module(symbol).ok_or_else(|| {
                PluginError::load_failed(
                    &self.module_name,
                    &format!("embedded module '{}' is not registered", symbol),
                )
            })?,
            ModuleSource::Library(path) => {
                let library = unsafe {
                    Library::new(path).map_err(|e| {
                        PluginError::load_failed(
                            &self.module_name,
                            &format!("Failed to load library: {}", e),
                        )
                    })?
                };

                let register = unsafe {
                    let symbol: Symbol<RegisterTypesFn> =
                        library.get(REGISTER_TYPES_SYMBOL.as_bytes()).map_err(|e| {
                            PluginError::load_failed(
                                &self.module_name,
                                &format!("Missing '{}' symbol: {}", REGISTER_TYPES_SYMBOL, e),
                            )
                        })?;
                    *symbol
                };

                self.library = Some(library);
                register
            }
        };

        register(self);
        self.loaded = true;
        debug!(
            module = %self.module_name,
            implementations = self.implementations.len(),
            "Object module loaded"
        );
        Ok(())
    }

    /// 注册接口实现工厂
    pub fn register_extension_factory(
        &mut self,
        interface: &InterfaceInfo,
        accepts_plugin_info: bool,
        factory: ExtensionFactory,
    ) {
        self.implementations.push(Implementation {
            interface: interface.name.to_string(),
            accepts_plugin_info,
            factory,
        });
    }

    /// 注册可直接构造的实现类型
    pub fn register_extension_type<T: ExtensionType>(&mut self, interface: &InterfaceInfo) {
        let factory: ExtensionFactory = Arc::new(|args: ConstructArgs| {
            let object: Arc<dyn ExtensionObject> = Arc::new(T::construct(args)?);
            Ok(object)
        });
        self.register_extension_factory(interface, T::ACCEPTS_PLUGIN_INFO, factory);
    }

    /// 注册加载器工厂
    pub fn register_loader_factory(&mut self, factory: LoaderFactory) {
        self.loader_factory = Some(factory);
    }

    pub fn provides_object(&self, interface: &InterfaceInfo) -> bool {
        self.implementations.iter().any(|i| i.interface == interface.name)
    }

    /// 创建接口实现；未声明 `plugin-info` 的实现不会收到该参数
    pub fn create_object(
        &self,
        interface: &InterfaceInfo,
        mut args: ConstructArgs,
    ) -> Result<Option<Arc<dyn ExtensionObject>>> {
        let Some(implementation) = self
            .implementations
            .iter()
            .find(|i| i.interface == interface.name)
        else {
            return Ok(None);
        };

        if !implementation.accepts_plugin_info {
            args.clear_plugin_info();
        }

        (implementation.factory)(args).map(Some)
    }

    /// 创建加载器实例
    pub fn create_loader(&self) -> Option<Arc<dyn PluginLoader>> {
        self.loader_factory.as_ref().map(|factory| factory())
    }
}

impl Drop for ObjectModule {
    fn drop(&mut self) {
        // 模块常驻，动态库永不关闭
        if let Some(library) = self.library.take() {
            std::mem::forget(library);
        }
    }
}

impl fmt::Debug for ObjectModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectModule")
            .field("module_name", &self.module_name)
            .field("path", &self.path())
            .field("loaded", &self.loaded)
            .field(
                "interfaces",
                &self.implementations.iter().map(|i| i.interface.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
