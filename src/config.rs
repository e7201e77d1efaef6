//! 插件引擎配置管理
//!
//! 支持 YAML 配置文件驱动的引擎构建

use crate::error::PluginError;
use crate::plugins::loader_registry::language_id;
use crate::types::{SearchPath, LOADERS_DIR_ENV};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 默认安装库目录
const DEFAULT_LIB_DIR: &str = match option_env!("MOSES_PLUGIN_LIBDIR") {
    Some(dir) => dir,
    None => "/usr/local/lib/moses_plugin",
};

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 插件搜索路径
    pub search_paths: Vec<SearchPathConfig>,
    /// 启用的加载器语言（本地语言总是启用）
    pub enabled_languages: Vec<String>,
    /// 启动时加载的插件
    pub loaded_plugins: Vec<String>,
    /// 非全局加载器为每个引擎创建私有实例
    pub nonglobal_loaders: bool,
    /// 清单本地化使用的区域设置
    pub locale: Option<String>,
    /// 扫描子目录的层数
    pub scan_depth: u32,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 搜索路径配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPathConfig {
    /// 模块目录
    pub module_dir: PathBuf,
    /// 数据目录（缺省为模块目录）
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl SearchPathConfig {
    pub fn to_search_path(&self) -> SearchPath {
        SearchPath::new(&self.module_dir, self.data_dir.as_deref())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            enabled_languages: Vec::new(),
            loaded_plugins: Vec::new(),
            nonglobal_loaders: false,
            locale: None,
            scan_depth: 1,
            logging: LoggingConfig::default(),
        }
    }
}

/// 加载器注册表选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryOptions {
    /// 安装库目录，加载器模块位于其下的 `loaders/`
    pub lib_dir: PathBuf,
    /// 允许同时启用相互冲突的语言（仅供测试）
    pub allow_conflicting_loaders: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            lib_dir: PathBuf::from(DEFAULT_LIB_DIR),
            allow_conflicting_loaders: false,
        }
    }
}

impl RegistryOptions {
    /// 加载器模块目录；环境变量设置时整体替换默认位置
    pub fn loaders_dir(&self) -> PathBuf {
        match std::env::var_os(LOADERS_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.lib_dir.join("loaders"),
        }
    }

    /// 某个语言的加载器模块目录
    pub fn loader_dir(&self, language: &str) -> PathBuf {
        self.loaders_dir().join(language)
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: EngineConfig,
}

impl ConfigManager {
    /// 从文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PluginError::config(&format!("Failed to read config file: {}", e)))?;

        let config: EngineConfig = serde_yaml::from_str(&content)
            .map_err(|e| PluginError::config(&format!("Failed to parse config file: {}", e)))?;

        Ok(Self { config })
    }

    /// 创建默认配置
    pub fn new_default() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn from_config(config: EngineConfig) -> Self {
        Self { config }
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(&self.config)
            .map_err(|e| PluginError::config(&format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| PluginError::config(&format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// 获取配置
    pub fn get_config(&self) -> &EngineConfig {
        &self.config
    }

    /// 获取可变配置
    pub fn get_config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        for sp in &self.config.search_paths {
            if sp.module_dir.as_os_str().is_empty() {
                return Err(PluginError::config("Search path module_dir cannot be empty"));
            }
        }

        for language in &self.config.enabled_languages {
            if language_id(language).is_none() {
                return Err(PluginError::config(&format!(
                    "Unknown plugin loader language '{}'",
                    language
                )));
            }
        }

        if self.config.loaded_plugins.iter().any(|p| p.trim().is_empty()) {
            return Err(PluginError::config("Loaded plugin names cannot be empty"));
        }

        tracing::info!("Configuration validation passed");
        Ok(())
    }
}

/// 生成默认配置文件
pub fn generate_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut config = EngineConfig::default();
    config.search_paths.push(SearchPathConfig {
        module_dir: PathBuf::from("plugins"),
        data_dir: None,
    });
    ConfigManager::from_config(config).save_to_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_manager_default() {
        let config_manager = ConfigManager::new_default();
        let config = config_manager.get_config();

        assert!(config.search_paths.is_empty());
        assert_eq!(config.scan_depth, 1);
        assert!(!config.nonglobal_loaders);
        assert!(config_manager.validate().is_ok());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moses_plugin.yaml");

        generate_default_config_file(&path).unwrap();
        let loaded = ConfigManager::load_from_file(&path).unwrap();

        assert_eq!(loaded.get_config().search_paths.len(), 1);
        assert_eq!(
            loaded.get_config().search_paths[0].to_search_path().data_dir,
            PathBuf::from("plugins")
        );
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "enabled_languages: [python3]\nloaded_plugins: [hello]\nlogging:\n  level: debug\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.enabled_languages, vec!["python3".to_string()]);
        assert_eq!(config.scan_depth, 1);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_validate_rejects_unknown_language() {
        let mut manager = ConfigManager::new_default();
        manager.get_config_mut().enabled_languages.push("cobol".to_string());

        let err = manager.validate().unwrap_err();
        assert!(matches!(err, PluginError::Config { .. }));
    }

    #[test]
    fn test_loader_dir_layout() {
        let options = RegistryOptions {
            lib_dir: PathBuf::from("/opt/app/lib"),
            allow_conflicting_loaders: false,
        };
        if std::env::var_os(LOADERS_DIR_ENV).is_none() {
            assert_eq!(options.loader_dir("python3"), PathBuf::from("/opt/app/lib/loaders/python3"));
        }
    }
}
