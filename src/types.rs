//! 插件引擎核心数据类型

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// 插件模块标识
pub type PluginId = String;

/// 插件清单文件扩展名
pub const MANIFEST_EXTENSION: &str = "plugin";

/// 清单主分组名称
pub const MANIFEST_GROUP: &str = "Plugin";

/// 自动注入的插件信息构造参数
pub const PLUGIN_INFO_PROPERTY: &str = "plugin-info";

/// 覆盖加载器模块目录的环境变量
pub const LOADERS_DIR_ENV: &str = "MOSES_PLUGIN_LOADERS_DIR";

/// 本地插件动态库导出的注册符号
pub const REGISTER_TYPES_SYMBOL: &str = "moses_plugin_register_types";

/// 插件搜索路径: 代码目录 + 数据目录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPath {
    /// 模块目录（动态库或脚本所在位置）
    pub module_dir: PathBuf,
    /// 数据目录
    pub data_dir: PathBuf,
}

impl SearchPath {
    /// 数据目录缺省时与模块目录相同
    pub fn new(module_dir: impl AsRef<Path>, data_dir: Option<&Path>) -> Self {
        let module_dir = module_dir.as_ref().to_path_buf();
        let data_dir = data_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| module_dir.clone());
        Self {
            module_dir,
            data_dir,
        }
    }
}

/// 插件状态摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginStatus {
    /// 已加载
    Loaded,
    /// 可加载
    Available,
    /// 不可用（依赖或加载器出错）
    Unavailable,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Loaded => write!(f, "loaded"),
            PluginStatus::Available => write!(f, "available"),
            PluginStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// 面向宿主界面的插件摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: PluginId,
    pub name: String,
    pub version: Option<String>,
    pub language: String,
    pub status: PluginStatus,
    pub builtin: bool,
    pub hidden: bool,
    /// 最近一次错误
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_path_defaults_data_dir() {
        let sp = SearchPath::new("/usr/lib/app/plugins", None);
        assert_eq!(sp.data_dir, PathBuf::from("/usr/lib/app/plugins"));

        let sp = SearchPath::new("/usr/lib/app/plugins", Some(Path::new("/usr/share/app")));
        assert_eq!(sp.data_dir, PathBuf::from("/usr/share/app"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(PluginStatus::Unavailable.to_string(), "unavailable");
    }
}
