//! 能力代理
//!
//! [`ProxyBuilder`] 为每个 (语言, 有序接口列表) 组合构建一次方法转发表
//! ([`ProxyShape`]) 并缓存；每次创建扩展都会得到一个新的 [`Extension`] 实例，
//! 只有转发表是共享的。

use super::capability::{check_arity, ExtensionObject, InterfaceInfo, MethodInfo};
use super::descriptor::PluginDescriptor;
use crate::error::{PluginError, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShapeKey {
    language: String,
    interfaces: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy)]
struct MethodSlot {
    interface: &'static InterfaceInfo,
    method: &'static MethodInfo,
}

/// 方法转发表
#[derive(Debug)]
pub struct ProxyShape {
    language: String,
    /// 请求的接口在前，随后是它们的前置接口
    interfaces: Vec<&'static InterfaceInfo>,
    /// 方法名与 `接口.方法` 两种键
    slots: HashMap<String, MethodSlot>,
}

impl ProxyShape {
    fn build(language: &str, requested: &[&'static InterfaceInfo]) -> Self {
        let mut interfaces: Vec<&'static InterfaceInfo> = Vec::new();
        for iface in requested {
            for candidate in iface.with_prerequisites() {
                if !interfaces.iter().any(|i| i.name == candidate.name) {
                    interfaces.push(candidate);
                }
            }
        }

        let mut slots = HashMap::new();
        for iface in &interfaces {
            for method in iface.methods {
                let slot = MethodSlot {
                    interface: *iface,
                    method,
                };
                slots.insert(format!("{}.{}", iface.name, method.name), slot);
                // 同名方法以先出现的接口为准
                slots.entry(method.name.to_string()).or_insert(slot);
            }
        }

        Self {
            language: language.to_string(),
            interfaces,
            slots,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn interfaces(&self) -> &[&'static InterfaceInfo] {
        &self.interfaces
    }

    /// 主接口（第一个请求的接口）
    pub fn primary(&self) -> &'static InterfaceInfo {
        self.interfaces[0]
    }

    pub fn method(&self, name: &str) -> Option<(&'static InterfaceInfo, &'static MethodInfo)> {
        self.slots.get(name).map(|slot| (slot.interface, slot.method))
    }

    pub fn method_count(&self) -> usize {
        self.interfaces.iter().map(|i| i.methods.len()).sum()
    }
}

/// 代理构建器，转发表缓存可被多个线程上的引擎共享
#[derive(Debug, Default)]
pub struct ProxyBuilder {
    shapes: DashMap<ShapeKey, Arc<ProxyShape>>,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（必要时构建）转发表
    pub fn shape(&self, language: &str, interfaces: &[&'static InterfaceInfo]) -> Result<Arc<ProxyShape>> {
        if interfaces.is_empty() {
            return Err(PluginError::precondition("at least one interface is required"));
        }

        let key = ShapeKey {
            language: language.to_string(),
            interfaces: interfaces.iter().map(|i| i.name).collect(),
        };

        let shape = self
            .shapes
            .entry(key)
            .or_insert_with(|| {
                let shape = ProxyShape::build(language, interfaces);
                debug!(
                    language = %language,
                    interfaces = ?interfaces.iter().map(|i| i.name).collect::<Vec<_>>(),
                    methods = shape.method_count(),
                    "Built proxy shape"
                );
                Arc::new(shape)
            })
            .value()
            .clone();

        Ok(shape)
    }

    /// 用实现对象创建一个新的代理实例
    pub fn build(
        &self,
        plugin: &Arc<PluginDescriptor>,
        interfaces: &[&'static InterfaceInfo],
        target: Arc<dyn ExtensionObject>,
    ) -> Result<Extension> {
        let shape = self.shape(plugin.language(), interfaces)?;
        Ok(Extension {
            shape,
            target,
            plugin: plugin.clone(),
        })
    }

    /// 已缓存的转发表数量
    pub fn cached_shapes(&self) -> usize {
        self.shapes.len()
    }
}

/// 能力代理实例
///
/// 克隆只增加对实现对象的引用；释放代理不会影响插件的加载状态。
#[derive(Clone)]
pub struct Extension {
    shape: Arc<ProxyShape>,
    target: Arc<dyn ExtensionObject>,
    plugin: Arc<PluginDescriptor>,
}

impl Extension {
    /// 调用接口方法，方法名可以是 `method` 或 `Interface.method`
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let (iface, info) = self
            .shape
            .method(method)
            .ok_or_else(|| PluginError::method_not_found(self.shape.primary().name, method))?;

        check_arity(info, &args)?;

        if !self.target.responds_to(info.name) {
            return Err(PluginError::method_not_found(iface.name, info.name));
        }

        self.target.call(info.name, args)
    }

    pub fn interfaces(&self) -> &[&'static InterfaceInfo] {
        self.shape.interfaces()
    }

    /// 代理是否满足某个接口（包含前置接口）
    pub fn implements(&self, name: &str) -> bool {
        self.shape.interfaces().iter().any(|i| i.name == name)
    }

    pub fn shape(&self) -> &Arc<ProxyShape> {
        &self.shape
    }

    /// 所属插件
    pub fn plugin_info(&self) -> &Arc<PluginDescriptor> {
        &self.plugin
    }

    pub fn target(&self) -> &Arc<dyn ExtensionObject> {
        &self.target
    }

    /// 访问具体的实现类型（仅本地实现可用）
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.target.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("plugin", &self.plugin.module_name())
            .field(
                "interfaces",
                &self.shape.interfaces().iter().map(|i| i.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
