//! 本地插件加载器
//!
//! 插件代码为 Rust 动态库或进程内注册函数。对象模块按清单路径缓存并常驻，
//! 卸载只解除描述符与模块的关联。

use super::capability::{ConstructArgs, ExtensionObject, InterfaceInfo};
use super::descriptor::PluginDescriptor;
use super::loader::{ensure_loaded, PluginLoader};
use super::object_module::ObjectModule;
use crate::error::{PluginError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// 本地插件加载器
#[derive(Debug, Default)]
pub struct NativeLoader {
    /// 按清单文件路径缓存的模块
    modules: Mutex<HashMap<PathBuf, Arc<ObjectModule>>>,
}

impl NativeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn module_for(info: &PluginDescriptor) -> Result<Arc<ObjectModule>> {
        info.loader_data::<ObjectModule>().ok_or_else(|| {
            PluginError::precondition(&format!(
                "plugin '{}' has no native module attached",
                info.module_name()
            ))
        })
    }
}

impl PluginLoader for NativeLoader {
    fn load(&self, info: &Arc<PluginDescriptor>) -> Result<()> {
        let mut modules = self.modules.lock();

        let module = match modules.get(info.filename()) {
            Some(module) => module.clone(),
            None => {
                let mut module = match info.embedded() {
                    Some(symbol) => ObjectModule::new_embedded(info.module_name(), symbol),
                    None => ObjectModule::new(info.module_name(), info.module_dir()),
                };
                module.load()?;

                let module = Arc::new(module);
                modules.insert(info.filename().to_path_buf(), module.clone());
                module
            }
        };

        debug!(plugin = %info.module_name(), "Native module attached");
        info.set_loader_data(module);
        Ok(())
    }

    fn unload(&self, info: &Arc<PluginDescriptor>) {
        // 模块常驻，仅解除关联
        info.clear_loader_data();
    }

    fn provides_capability(&self, info: &Arc<PluginDescriptor>, iface: &InterfaceInfo) -> Result<bool> {
        ensure_loaded(info)?;
        Ok(Self::module_for(info)?.provides_object(iface))
    }

    fn create_capability(
        &self,
        info: &Arc<PluginDescriptor>,
        iface: &InterfaceInfo,
        mut args: ConstructArgs,
    ) -> Result<Option<Arc<dyn ExtensionObject>>> {
        ensure_loaded(info)?;
        let module = Self::module_for(info)?;

        args.set_plugin_info(info.clone());
        module.create_object(iface, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::capability::MethodInfo;
    use crate::plugins::object_module::{register_embedded_module, ExtensionType};
    use serde_json::Value;
    use std::any::Any;
    use std::path::Path;

    static COUNTER: InterfaceInfo = InterfaceInfo {
        name: "NativeLoaderTestCounter",
        methods: &[MethodInfo { name: "owner", params: &[] }],
        prerequisites: &[],
        properties: &[],
    };

    static PLAIN: InterfaceInfo = InterfaceInfo {
        name: "NativeLoaderTestPlain",
        methods: &[MethodInfo { name: "owner", params: &[] }],
        prerequisites: &[],
        properties: &[],
    };

    struct Owned {
        owner: Option<String>,
    }

    impl ExtensionObject for Owned {
        fn call(&self, _method: &str, _args: Vec<Value>) -> Result<Value> {
            Ok(self.owner.clone().map(Value::String).unwrap_or(Value::Null))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl ExtensionType for Owned {
        const ACCEPTS_PLUGIN_INFO: bool = true;

        fn construct(args: ConstructArgs) -> Result<Self> {
            Ok(Self {
                owner: args.plugin_info().map(|i| i.module_name().to_string()),
            })
        }
    }

    struct Plain;

    impl ExtensionObject for Plain {
        fn call(&self, _method: &str, _args: Vec<Value>) -> Result<Value> {
            Ok(Value::Null)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl ExtensionType for Plain {
        fn construct(args: ConstructArgs) -> Result<Self> {
            if args.plugin_info().is_some() {
                return Err(PluginError::invalid_arguments("construct", "unexpected plugin-info"));
            }
            Ok(Plain)
        }
    }

    fn register(module: &mut ObjectModule) {
        module.register_extension_type::<Owned>(&COUNTER);
        module.register_extension_type::<Plain>(&PLAIN);
    }

    fn descriptor(manifest: &str, embedded: &str) -> Arc<PluginDescriptor> {
        let content = format!("[Plugin]\nModule=counter\nName=Counter\nEmbedded={}\n", embedded);
        Arc::new(
            PluginDescriptor::parse(&content, Path::new(manifest), Path::new("."), Path::new("."), None).unwrap(),
        )
    }

    #[test]
    fn test_load_caches_module_by_manifest() {
        register_embedded_module("native_loader_test_register", register);
        let loader = NativeLoader::new();
        let info = descriptor("/native/counter.plugin", "native_loader_test_register");

        loader.load(&info).unwrap();
        let module = info.loader_data::<ObjectModule>().unwrap();

        loader.unload(&info);
        assert!(!info.has_loader_data());

        loader.load(&info).unwrap();
        assert!(Arc::ptr_eq(&module, &info.loader_data::<ObjectModule>().unwrap()));
        assert!(module.is_loaded());
    }

    #[test]
    fn test_capabilities_require_loaded_descriptor() {
        register_embedded_module("native_loader_test_register", register);
        let loader = NativeLoader::new();
        let info = descriptor("/native/precondition.plugin", "native_loader_test_register");

        assert!(matches!(
            loader.provides_capability(&info, &COUNTER),
            Err(PluginError::PreconditionViolated { .. })
        ));
        assert!(matches!(
            loader.create_capability(&info, &COUNTER, ConstructArgs::new()),
            Err(PluginError::PreconditionViolated { .. })
        ));
    }

    #[test]
    fn test_plugin_info_injection() {
        register_embedded_module("native_loader_test_register", register);
        let loader = NativeLoader::new();
        let info = descriptor("/native/inject.plugin", "native_loader_test_register");
        loader.load(&info).unwrap();
        info.set_loaded(true);

        assert!(loader.provides_capability(&info, &COUNTER).unwrap());

        let owned = loader
            .create_capability(&info, &COUNTER, ConstructArgs::new())
            .unwrap()
            .unwrap();
        assert_eq!(owned.call("owner", vec![]).unwrap(), Value::from("counter"));

        // 未声明 plugin-info 的实现不会收到它
        assert!(loader
            .create_capability(&info, &PLAIN, ConstructArgs::new())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_missing_embedded_function() {
        let loader = NativeLoader::new();
        let info = descriptor("/native/missing.plugin", "native_loader_test_not_registered");
        assert!(matches!(loader.load(&info), Err(PluginError::LoadFailed { .. })));
        assert!(!info.has_loader_data());
    }
}
