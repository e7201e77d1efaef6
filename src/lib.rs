//! MosesPlugin - 多语言插件引擎
//!
//! 发现插件清单、按依赖顺序加载插件，并通过与实现语言无关的能力代理向宿主
//! 提供插件实现的接口。
//!
//! # 组成
//!
//! - **版本与依赖**: `name`、`name OP version`、`name v1-v2` 约束解析
//! - **插件描述符**: `.plugin` 清单解析结果与加载状态
//! - **加载器**: 每种实现语言一个，全局共享或按引擎私有
//! - **引擎**: 有序注册表、依赖解析、加载/卸载编排与钩子
//! - **能力代理**: 按接口组合缓存转发表，每次创建新实例
//! - **扩展集合**: 随加载/卸载自动同步的每插件实例池
//!
//! # 特性
//!
//! - `python`: 基于 pyo3 的 `python3` 加载器

pub mod config;
pub mod error;
pub mod events;
pub mod plugins;
pub mod types;

// 重新导出核心类型
pub use config::{ConfigManager, EngineConfig, LogLevel, LoggingConfig, RegistryOptions};
pub use error::{PluginError, Result};
pub use events::{EventHub, HandlerId, HookStage, PluginEvent};
pub use plugins::*;
pub use types::*;

/// 框架信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FRAMEWORK_NAME: &str = "MosesPlugin";

/// 初始化日志系统
///
/// 重复调用时保留第一次安装的订阅者。
pub fn initialize(logging: &LoggingConfig) -> Result<()> {
    let level: tracing::Level = logging.level.into();
    if tracing_subscriber::fmt().with_max_level(level).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }

    tracing::info!("Initializing {} v{}", FRAMEWORK_NAME, VERSION);
    Ok(())
}
