//! 可激活能力
//!
//! 宿主最常用的插件接口: 插件在宿主对象（构造属性 `object`）上激活、停用，
//! 并在宿主状态变化时刷新。

use super::capability::{Capability, ExtensionObject, InterfaceInfo, MethodInfo};
use super::extension::Extension;
use super::extension_set::ExtensionSet;
use crate::error::{PluginError, Result};
use crate::events::HandlerId;
use serde_json::Value;
use std::any::Any;
use tracing::warn;

/// 宿主对象构造属性
pub const OBJECT_PROPERTY: &str = "object";

/// 可激活接口
pub static ACTIVATABLE: InterfaceInfo = InterfaceInfo {
    name: "Activatable",
    methods: &[
        MethodInfo { name: "activate", params: &[] },
        MethodInfo { name: "deactivate", params: &[] },
        MethodInfo { name: "update_state", params: &[] },
    ],
    prerequisites: &[],
    properties: &[OBJECT_PROPERTY],
};

/// 可激活插件的实现方接口
pub trait Activatable: Send + Sync + 'static {
    fn activate(&self) -> Result<()>;

    fn deactivate(&self) -> Result<()>;

    fn update_state(&self) -> Result<()> {
        Ok(())
    }
}

/// 把本地实现适配为通用调用原语
pub struct ActivatableObject<T> {
    inner: T,
}

impl<T: Activatable> ActivatableObject<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Activatable> ExtensionObject for ActivatableObject<T> {
    fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value> {
        match method {
            "activate" => self.inner.activate()?,
            "deactivate" => self.inner.deactivate()?,
            "update_state" => self.inner.update_state()?,
            _ => return Err(PluginError::method_not_found(ACTIVATABLE.name, method)),
        }
        Ok(Value::Null)
    }

    fn responds_to(&self, method: &str) -> bool {
        ACTIVATABLE.method(method).is_some()
    }

    /// 向下转型得到的是被包装的实现
    fn as_any(&self) -> &dyn Any {
        &self.inner
    }
}

/// 宿主侧门面
#[derive(Debug, Clone)]
pub struct ActivatableExtension {
    extension: Extension,
}

impl ActivatableExtension {
    pub fn extension(&self) -> &Extension {
        &self.extension
    }

    pub fn activate(&self) -> Result<()> {
        self.extension.call("activate", Vec::new()).map(|_| ())
    }

    pub fn deactivate(&self) -> Result<()> {
        self.extension.call("deactivate", Vec::new()).map(|_| ())
    }

    pub fn update_state(&self) -> Result<()> {
        self.extension.call("update_state", Vec::new()).map(|_| ())
    }
}

impl Capability for ActivatableExtension {
    fn interface() -> &'static InterfaceInfo {
        &ACTIVATABLE
    }

    fn from_extension(extension: Extension) -> Self {
        Self { extension }
    }
}

/// 激活集合中已有的成员，并让之后加入的成员自动激活、移除的成员自动停用
///
/// 返回两个观察者的标识，可用 [`ExtensionSet::disconnect`] 解除。
pub fn bind_activatable_set(set: &ExtensionSet) -> (HandlerId, HandlerId) {
    set.foreach(|info, extension| {
        if let Err(e) = extension.call("activate", Vec::new()) {
            warn!(error = %e, "Failed to activate plugin '{}'", info.module_name());
        }
    });

    let added = set.connect_extension_added(|info, extension| {
        if let Err(e) = extension.call("activate", Vec::new()) {
            warn!(error = %e, "Failed to activate plugin '{}'", info.module_name());
        }
    });

    let removed = set.connect_extension_removed(|info, extension| {
        if let Err(e) = extension.call("deactivate", Vec::new()) {
            warn!(error = %e, "Failed to deactivate plugin '{}'", info.module_name());
        }
    });

    (added, removed)
}
