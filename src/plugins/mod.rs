//! 插件引擎
//!
//! 版本与依赖解析、插件描述符、加载器协议与注册表、引擎编排、能力代理以及
//! 扩展集合。

pub mod activatable;
pub mod capability;
pub mod dependency;
pub mod descriptor;
pub mod engine;
pub mod extension;
pub mod extension_set;
pub mod keyfile;
pub mod loader;
pub mod loader_registry;
pub mod native_loader;
pub mod object_module;
#[cfg(feature = "python")]
pub mod python_loader;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出核心组件
pub use activatable::{bind_activatable_set, Activatable, ActivatableExtension, ActivatableObject, ACTIVATABLE};
pub use capability::{Capability, ConstructArgs, ExtensionObject, InterfaceInfo, MethodInfo};
pub use dependency::{PluginDependency, VersionConstraint};
pub use descriptor::{ExternalValue, PluginDescriptor};
pub use engine::Engine;
pub use extension::{Extension, ProxyBuilder, ProxyShape};
pub use extension_set::ExtensionSet;
pub use loader::PluginLoader;
pub use loader_registry::LoaderRegistry;
pub use native_loader::NativeLoader;
pub use object_module::{register_embedded_module, ExtensionFactory, ExtensionType, LoaderFactory, ObjectModule};
#[cfg(feature = "python")]
pub use python_loader::PythonLoader;
pub use version::{PluginVersion, VersionOperation};
