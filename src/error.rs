//! 插件引擎错误处理系统
//!
//! 统一的错误类型和错误处理机制

use std::sync::Arc;
use thiserror::Error;

/// 插件引擎统一错误类型
///
/// 错误会被记录在描述符上并同时返回给调用者，因此可以克隆。
#[derive(Error, Debug, Clone)]
pub enum PluginError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Error parsing manifest '{path}': {message}")]
    ManifestParse { path: String, message: String },

    #[error("Invalid version '{input}': {message}")]
    InvalidVersion { input: String, message: String },

    #[error("Invalid dependency '{input}': {message}")]
    InvalidDependency { input: String, message: String },

    #[error("Dependency '{dependency}' was not found for plugin '{plugin}'")]
    DependencyNotFound { plugin: String, dependency: String },

    #[error("Dependency '{dependency}' failed to load for plugin '{plugin}'")]
    DependencyLoadFailed { plugin: String, dependency: String },

    #[error("Dependency '{dependency}' of plugin '{plugin}' requires '{required}' but version {found} is installed")]
    DependencyVersionMismatch {
        plugin: String,
        dependency: String,
        required: String,
        found: String,
    },

    #[error("Loader '{language}' is unavailable: {message}")]
    LoaderUnavailable { language: String, message: String },

    #[error("Failed to load plugin '{plugin}': {message}")]
    LoadFailed { plugin: String, message: String },

    #[error("Precondition violated: {message}")]
    PreconditionViolated { message: String },

    #[error("Unknown plugin loader language '{language}'")]
    UnknownLanguage { language: String },

    #[error("Cannot enable loader '{language}' as it conflicts with the '{active}' loader")]
    LoaderConflict { language: String, active: String },

    #[error("Method '{method}' is not part of interface '{interface}'")]
    MethodNotFound { interface: String, method: String },

    #[error("Invalid arguments for '{method}': {message}")]
    InvalidArguments { method: String, message: String },

    #[error("Call to '{method}' failed: {message}")]
    Call { method: String, message: String },
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(e))
    }
}

impl PluginError {
    /// 创建配置相关错误
    pub fn config(message: &str) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    /// 创建清单解析错误
    pub fn manifest(path: &str, message: &str) -> Self {
        Self::ManifestParse {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    pub fn invalid_version(input: &str, message: &str) -> Self {
        Self::InvalidVersion {
            input: input.to_string(),
            message: message.to_string(),
        }
    }

    pub fn invalid_dependency(input: &str, message: &str) -> Self {
        Self::InvalidDependency {
            input: input.to_string(),
            message: message.to_string(),
        }
    }

    /// 创建加载器不可用错误
    pub fn loader_unavailable(language: &str, message: &str) -> Self {
        Self::LoaderUnavailable {
            language: language.to_string(),
            message: message.to_string(),
        }
    }

    /// 创建插件加载失败错误
    pub fn load_failed(plugin: &str, message: &str) -> Self {
        Self::LoadFailed {
            plugin: plugin.to_string(),
            message: message.to_string(),
        }
    }

    /// 创建前置条件错误（编程错误，而非运行时状况）
    pub fn precondition(message: &str) -> Self {
        Self::PreconditionViolated {
            message: message.to_string(),
        }
    }

    pub fn method_not_found(interface: &str, method: &str) -> Self {
        Self::MethodNotFound {
            interface: interface.to_string(),
            method: method.to_string(),
        }
    }

    pub fn invalid_arguments(method: &str, message: &str) -> Self {
        Self::InvalidArguments {
            method: method.to_string(),
            message: message.to_string(),
        }
    }

    /// 创建调用失败错误
    pub fn call(method: &str, message: &str) -> Self {
        Self::Call {
            method: method.to_string(),
            message: message.to_string(),
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = PluginError::load_failed("helloworld", "library not found");
        assert!(matches!(error, PluginError::LoadFailed { .. }));
        assert_eq!(
            error.to_string(),
            "Failed to load plugin 'helloworld': library not found"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let plugin_error = PluginError::from(io_error);
        assert!(matches!(plugin_error, PluginError::Io(_)));

        let copy = plugin_error.clone();
        assert_eq!(copy.to_string(), "IO error: File not found");
    }

    #[test]
    fn test_conflict_message() {
        let error = PluginError::LoaderConflict {
            language: "python3".to_string(),
            active: "python".to_string(),
        };
        assert!(error.to_string().contains("conflicts with the 'python' loader"));
    }
}
