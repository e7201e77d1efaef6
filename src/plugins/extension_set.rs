//! 扩展集合
//!
//! 为每个已加载且实现了目标接口的插件保存一个扩展实例，并随引擎的加载/卸载
//! 事件自动更新。
//!
//! 构造时对已加载的插件做一次同步填充，此时还没有观察者，因此不会触发
//! `extension-added`；之后加载的插件通过事件路径加入并通知观察者。需要处理
//! 全部成员的调用者应先用 [`ExtensionSet::foreach`] 处理已有成员，再注册观察者。

use super::capability::{ConstructArgs, InterfaceInfo};
use super::descriptor::PluginDescriptor;
use super::engine::Engine;
use super::extension::Extension;
use crate::error::{PluginError, Result};
use crate::events::{HandlerId, HookStage};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// 成员增删观察者
pub type ExtensionSetObserver = Arc<dyn Fn(&Arc<PluginDescriptor>, &Extension) + Send + Sync>;

#[derive(Clone)]
struct Entry {
    info: Arc<PluginDescriptor>,
    extension: Extension,
}

struct SetInner {
    interfaces: Vec<&'static InterfaceInfo>,
    args: ConstructArgs,
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    added: RwLock<Vec<(HandlerId, ExtensionSetObserver)>>,
    removed: RwLock<Vec<(HandlerId, ExtensionSetObserver)>>,
}

impl SetInner {
    fn primary(&self) -> &'static InterfaceInfo {
        self.interfaces[0]
    }

    fn add_extension(&self, engine: &Engine, info: &Arc<PluginDescriptor>) {
        if !engine.provides_extension(info, self.primary()) {
            return;
        }

        let extension = match engine.create_extension(info, &self.interfaces, self.args.clone()) {
            Ok(Some(extension)) => extension,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to create extension for plugin '{}'", info.module_name());
                return;
            }
        };

        {
            let mut entries = self.entries.lock();
            if entries.iter().any(|e| Arc::ptr_eq(&e.info, info)) {
                return;
            }
            entries.push(Entry {
                info: info.clone(),
                extension: extension.clone(),
            });
        }

        debug!(
            "Extension '{}' added for plugin '{}'",
            self.primary().name,
            info.module_name()
        );
        let observers: Vec<_> = self.added.read().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            observer(info, &extension);
        }
    }

    fn remove_extension(&self, info: &Arc<PluginDescriptor>) {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.iter().position(|e| Arc::ptr_eq(&e.info, info)) {
                Some(index) => entries.remove(index),
                None => return,
            }
        };
        self.notify_removed(&entry);
    }

    fn notify_removed(&self, entry: &Entry) {
        debug!(
            "Extension '{}' removed for plugin '{}'",
            self.primary().name,
            entry.info.module_name()
        );
        let observers: Vec<_> = self.removed.read().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            observer(&entry.info, &entry.extension);
        }
    }
}

/// 扩展集合
pub struct ExtensionSet {
    engine: Arc<Engine>,
    inner: Arc<SetInner>,
    load_handler: HandlerId,
    unload_handler: HandlerId,
}

impl ExtensionSet {
    /// 创建集合并填充已加载插件的扩展
    ///
    /// `args` 在每次创建扩展时被复制传入。
    pub fn new(engine: &Arc<Engine>, interfaces: &[&'static InterfaceInfo], args: ConstructArgs) -> Result<Self> {
        if interfaces.is_empty() {
            return Err(PluginError::precondition("at least one interface is required"));
        }

        let inner = Arc::new(SetInner {
            interfaces: interfaces.to_vec(),
            args,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            added: RwLock::new(Vec::new()),
            removed: RwLock::new(Vec::new()),
        });

        for info in engine.plugin_list() {
            if info.is_loaded() {
                inner.add_extension(engine, &info);
            }
        }

        let weak: Weak<SetInner> = Arc::downgrade(&inner);
        let load_handler = engine.connect_load(HookStage::After, move |engine, info| {
            if let Some(inner) = weak.upgrade() {
                inner.add_extension(engine, info);
            }
        });

        // 在插件真正卸载之前移除，使实例先于代码单元释放
        let weak: Weak<SetInner> = Arc::downgrade(&inner);
        let unload_handler = engine.connect_unload(HookStage::Before, move |_engine, info| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_extension(info);
            }
        });

        Ok(Self {
            engine: engine.clone(),
            inner,
            load_handler,
            unload_handler,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn interfaces(&self) -> &[&'static InterfaceInfo] {
        &self.inner.interfaces
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 某个插件的扩展
    pub fn get_extension(&self, info: &PluginDescriptor) -> Option<Extension> {
        self.inner
            .entries
            .lock()
            .iter()
            .find(|e| std::ptr::eq(Arc::as_ptr(&e.info), info))
            .map(|e| e.extension.clone())
    }

    /// 按加入顺序遍历成员
    pub fn foreach<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<PluginDescriptor>, &Extension),
    {
        let entries = self.inner.entries.lock().clone();
        for entry in &entries {
            f(&entry.info, &entry.extension);
        }
    }

    /// 在每个成员上调用方法；所有成员都会被调用，返回第一个错误
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let entries = self.inner.entries.lock().clone();
        let mut first_error = None;

        for entry in &entries {
            if let Err(e) = entry.extension.call(method, args.clone()) {
                warn!(error = %e, "Call to '{}' failed for plugin '{}'", method, entry.info.module_name());
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> HandlerId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 注册 `extension-added` 观察者
    pub fn connect_extension_added<F>(&self, observer: F) -> HandlerId
    where
        F: Fn(&Arc<PluginDescriptor>, &Extension) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.added.write().push((id, Arc::new(observer)));
        id
    }

    /// 注册 `extension-removed` 观察者
    pub fn connect_extension_removed<F>(&self, observer: F) -> HandlerId
    where
        F: Fn(&Arc<PluginDescriptor>, &Extension) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.removed.write().push((id, Arc::new(observer)));
        id
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut found = false;
        for list in [&self.inner.added, &self.inner.removed] {
            let mut list = list.write();
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            found |= list.len() != before;
        }
        found
    }
}

impl Drop for ExtensionSet {
    fn drop(&mut self) {
        self.engine.disconnect(self.load_handler);
        self.engine.disconnect(self.unload_handler);

        // 逆序移除，依赖者先于其依赖清理
        loop {
            let Some(entry) = self.inner.entries.lock().pop() else {
                break;
            };
            self.inner.notify_removed(&entry);
        }
    }
}

impl fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|e| e.info.module_name().to_string())
            .collect();
        f.debug_struct("ExtensionSet")
            .field("interface", &self.inner.primary().name)
            .field("plugins", &plugins)
            .finish()
    }
}
