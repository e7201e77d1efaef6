//! 能力接口定义
//!
//! 宿主以静态 [`InterfaceInfo`] 描述一个能力接口；插件实现对象通过
//! [`ExtensionObject`] 提供统一的调用原语，跨语言的参数编解码由各加载器负责。

use super::descriptor::PluginDescriptor;
use super::extension::Extension;
use crate::error::{PluginError, Result};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 接口方法签名
#[derive(Debug)]
pub struct MethodInfo {
    pub name: &'static str,
    /// 参数名称，长度即参数个数
    pub params: &'static [&'static str],
}

impl MethodInfo {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// 能力接口描述
#[derive(Debug)]
pub struct InterfaceInfo {
    /// 接口名称，在进程内唯一
    pub name: &'static str,
    pub methods: &'static [MethodInfo],
    /// 前置接口，实现者必须同时实现
    pub prerequisites: &'static [&'static InterfaceInfo],
    /// 接口声明的构造属性
    pub properties: &'static [&'static str],
}

impl InterfaceInfo {
    pub fn method(&self, name: &str) -> Option<&'static MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// 本接口及其全部前置接口，去重并保持深度优先顺序
    pub fn with_prerequisites(&'static self) -> Vec<&'static InterfaceInfo> {
        let mut out = Vec::new();
        collect_interfaces(self, &mut out);
        out
    }
}

fn collect_interfaces(iface: &'static InterfaceInfo, out: &mut Vec<&'static InterfaceInfo>) {
    if out.iter().any(|i| i.name == iface.name) {
        return;
    }
    out.push(iface);
    for prereq in iface.prerequisites {
        collect_interfaces(prereq, out);
    }
}

impl PartialEq for InterfaceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for InterfaceInfo {}

/// 插件实现对象的调用原语
pub trait ExtensionObject: Send + Sync {
    /// 按名称调用方法
    fn call(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    /// 是否实现了某个方法
    fn responds_to(&self, _method: &str) -> bool {
        true
    }

    /// 是否满足某个接口
    fn implements(&self, iface: &InterfaceInfo) -> bool {
        iface.methods.iter().all(|m| self.responds_to(m.name))
    }

    fn as_any(&self) -> &dyn Any;
}

/// 构造参数
///
/// 调用者提供的属性原样传递给加载器；`plugin-info` 由引擎注入。
#[derive(Clone, Default)]
pub struct ConstructArgs {
    properties: Map<String, Value>,
    objects: HashMap<String, Arc<dyn Any + Send + Sync>>,
    plugin_info: Option<Arc<PluginDescriptor>>,
}

impl ConstructArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置一个 JSON 属性
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    /// 设置一个宿主对象属性（例如窗口句柄）
    pub fn with_object(mut self, name: &str, object: Arc<dyn Any + Send + Sync>) -> Self {
        self.objects.insert(name.to_string(), object);
        self
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn object<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.objects.get(name)?.clone().downcast::<T>().ok()
    }

    pub fn has_object(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    /// 所属插件的描述符
    pub fn plugin_info(&self) -> Option<&Arc<PluginDescriptor>> {
        self.plugin_info.as_ref()
    }

    pub(crate) fn set_plugin_info(&mut self, info: Arc<PluginDescriptor>) {
        self.plugin_info = Some(info);
    }

    pub(crate) fn clear_plugin_info(&mut self) {
        self.plugin_info = None;
    }
}

impl fmt::Debug for ConstructArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructArgs")
            .field("properties", &self.properties)
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .field(
                "plugin_info",
                &self.plugin_info.as_ref().map(|i| i.module_name().to_string()),
            )
            .finish()
    }
}

/// 宿主侧的强类型能力门面
pub trait Capability: Sized {
    /// 对应的接口描述
    fn interface() -> &'static InterfaceInfo;

    /// 用通用代理构造门面
    fn from_extension(extension: Extension) -> Self;
}

/// 检查参数个数
pub(crate) fn check_arity(method: &MethodInfo, args: &[Value]) -> Result<()> {
    if args.len() != method.arity() {
        return Err(PluginError::invalid_arguments(
            method.name,
            &format!("expected {} argument(s), got {}", method.arity(), args.len()),
        ));
    }
    Ok(())
}
