//! 插件加载器协议
//!
//! 每种实现语言对应一个加载器。引擎只通过本 trait 与加载器交互；加载器把自己的
//! 每插件状态挂在描述符的私有数据槽上。

use super::capability::{ConstructArgs, ExtensionObject, InterfaceInfo};
use super::descriptor::PluginDescriptor;
use crate::error::{PluginError, Result};
use std::sync::Arc;

/// 插件加载器
pub trait PluginLoader: Send + Sync {
    /// 初始化语言运行时；失败时该语言被标记为不可用
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// 全局加载器在进程内只有一个实例，被所有引擎共享
    fn is_global(&self) -> bool {
        true
    }

    /// 加载插件代码单元，对同一描述符重复调用不得重复产生副作用
    fn load(&self, info: &Arc<PluginDescriptor>) -> Result<()>;

    /// 卸载插件；可以只解除描述符与代码单元的关联
    fn unload(&self, info: &Arc<PluginDescriptor>);

    /// 插件是否提供某个接口的实现，要求描述符已加载
    fn provides_capability(&self, info: &Arc<PluginDescriptor>, iface: &InterfaceInfo) -> Result<bool>;

    /// 创建接口实现对象，要求描述符已加载
    fn create_capability(
        &self,
        info: &Arc<PluginDescriptor>,
        iface: &InterfaceInfo,
        args: ConstructArgs,
    ) -> Result<Option<Arc<dyn ExtensionObject>>>;

    /// 释放跨语言引用的提示，不影响正确性
    fn garbage_collect(&self) {}
}

/// 能力查询与创建的前置条件: 描述符必须处于已加载状态
pub fn ensure_loaded(info: &PluginDescriptor) -> Result<()> {
    if !info.is_loaded() {
        return Err(PluginError::precondition(&format!(
            "plugin '{}' is not loaded",
            info.module_name()
        )));
    }
    Ok(())
}
