//! 引擎事件系统
//!
//! 同步的处理器注册表：插件加载/卸载钩子（分前后两个阶段）、已加载插件列表变化
//! 以及插件列表变化通知。发送事件时先复制处理器快照再逐个调用，处理器可以
//! 重入引擎或注册/注销其他处理器。

use crate::plugins::descriptor::PluginDescriptor;
use crate::plugins::engine::Engine;
use crate::types::PluginId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 插件事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginEvent {
    Load,
    Unload,
}

impl fmt::Display for PluginEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginEvent::Load => write!(f, "load-plugin"),
            PluginEvent::Unload => write!(f, "unload-plugin"),
        }
    }
}

/// 钩子阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookStage {
    /// 在实际加载/卸载之前
    Before,
    /// 实际加载/卸载成功之后
    After,
}

/// 处理器标识
pub type HandlerId = u64;

/// 加载/卸载钩子
pub type PluginHook = Arc<dyn Fn(&Engine, &Arc<PluginDescriptor>) + Send + Sync>;

/// 已加载插件列表观察者
pub type LoadedPluginsObserver = Arc<dyn Fn(&[PluginId]) + Send + Sync>;

/// 插件列表观察者
pub type PluginListObserver = Arc<dyn Fn(&[Arc<PluginDescriptor>]) + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Hook {
        event: PluginEvent,
        stage: HookStage,
        hook: PluginHook,
    },
    LoadedPlugins(LoadedPluginsObserver),
    PluginList(PluginListObserver),
}

/// 事件中心
pub struct EventHub {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, Handler)>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, handler: Handler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push((id, handler));
        id
    }

    /// 注册加载/卸载钩子
    pub fn connect_hook(&self, event: PluginEvent, stage: HookStage, hook: PluginHook) -> HandlerId {
        self.add(Handler::Hook { event, stage, hook })
    }

    pub fn connect_loaded_plugins(&self, observer: LoadedPluginsObserver) -> HandlerId {
        self.add(Handler::LoadedPlugins(observer))
    }

    pub fn connect_plugin_list(&self, observer: PluginListObserver) -> HandlerId {
        self.add(Handler::PluginList(observer))
    }

    /// 注销处理器
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    fn snapshot(&self) -> Vec<Handler> {
        self.handlers.read().iter().map(|(_, h)| h.clone()).collect()
    }

    pub(crate) fn emit_hook(
        &self,
        engine: &Engine,
        event: PluginEvent,
        stage: HookStage,
        info: &Arc<PluginDescriptor>,
    ) {
        for handler in self.snapshot() {
            if let Handler::Hook {
                event: e,
                stage: s,
                hook,
            } = handler
            {
                if e == event && s == stage {
                    hook(engine, info);
                }
            }
        }
    }

    pub(crate) fn emit_loaded_plugins(&self, loaded: &[PluginId]) {
        for handler in self.snapshot() {
            if let Handler::LoadedPlugins(observer) = handler {
                observer(loaded);
            }
        }
    }

    pub(crate) fn emit_plugin_list(&self, plugins: &[Arc<PluginDescriptor>]) {
        for handler in self.snapshot() {
            if let Handler::PluginList(observer) = handler {
                observer(plugins);
            }
        }
    }

}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
