//! 插件依赖约束
//!
//! 支持三种形式:
//! - `name`：任意版本
//! - `name OP version`：`==`、`!=`、`<`、`>`、`<=`、`>=`
//! - `name low-high`：闭区间，要求 `low < high`

use super::version::{PluginVersion, VersionOperation};
use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 版本约束
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionConstraint {
    /// 任意版本
    Any,
    /// 单一比较
    Single {
        op: VersionOperation,
        version: PluginVersion,
    },
    /// 闭区间
    Range {
        low: PluginVersion,
        high: PluginVersion,
    },
}

/// 插件依赖
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    /// 被依赖的模块名
    pub name: String,
    /// 版本约束
    pub constraint: VersionConstraint,
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-' || c == b'_'
}

impl PluginDependency {
    /// 不带版本约束的依赖
    pub fn any(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constraint: VersionConstraint::Any,
        }
    }

    /// 解析依赖字符串
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |message: String| Err(PluginError::invalid_dependency(input, &message));
        let bytes = input.as_bytes();

        let name_len = bytes.iter().take_while(|c| is_name_char(**c)).count();
        if name_len == 0 {
            return match bytes.first() {
                Some(c) => invalid(format!("invalid character '{}'", *c as char)),
                None => invalid("empty dependency string".to_string()),
            };
        }

        let name = input[..name_len].to_string();
        let rest = &input[name_len..];

        if rest.is_empty() {
            return Ok(Self::any(&name));
        }

        let Some(rest) = rest.strip_prefix(' ') else {
            return invalid(format!("invalid character '{}'", bytes[name_len] as char));
        };

        if rest.starts_with(|c: char| c.is_ascii_digit()) {
            let Some((low, high)) = rest.split_once('-') else {
                return invalid("missing '-' in version range".to_string());
            };
            let low = PluginVersion::parse(low)?;
            let high = PluginVersion::parse(high)?;

            if !low.check(&high, VersionOperation::Lt) {
                return invalid("invalid version range".to_string());
            }

            return Ok(Self {
                name,
                constraint: VersionConstraint::Range { low, high },
            });
        }

        let (op, op_len) = match rest.as_bytes() {
            [b'=', b'=', ..] => (VersionOperation::Eq, 2),
            [b'=', ..] => return invalid("missing '=' after '='".to_string()),
            [b'!', b'=', ..] => (VersionOperation::Ne, 2),
            [b'!', ..] => return invalid("missing '=' after '!'".to_string()),
            [b'>', b'=', ..] => (VersionOperation::Ge, 2),
            [b'>', ..] => (VersionOperation::Gt, 1),
            [b'<', b'=', ..] => (VersionOperation::Le, 2),
            [b'<', ..] => (VersionOperation::Lt, 1),
            [c, ..] => return invalid(format!("invalid operator '{}'", *c as char)),
            [] => return invalid("missing operator".to_string()),
        };

        let Some(version) = rest[op_len..].strip_prefix(' ') else {
            return invalid("missing space after operator".to_string());
        };

        Ok(Self {
            name,
            constraint: VersionConstraint::Single {
                op,
                version: PluginVersion::parse(version)?,
            },
        })
    }

    /// 使用版本字符串检查依赖；任意版本依赖总是通过
    pub fn check(&self, version: Option<&str>) -> bool {
        if self.constraint == VersionConstraint::Any {
            return true;
        }

        match version {
            Some(s) if !s.is_empty() => match PluginVersion::parse(s) {
                Ok(parsed) => self.check_version(Some(&parsed)),
                Err(e) => {
                    tracing::warn!(dependency = %self, error = %e, "cannot check dependency");
                    false
                }
            },
            _ => false,
        }
    }

    /// 使用已解析的版本检查依赖
    pub fn check_version(&self, version: Option<&PluginVersion>) -> bool {
        match (&self.constraint, version) {
            (VersionConstraint::Any, _) => true,
            (_, None) => false,
            (VersionConstraint::Single { op, version: required }, Some(v)) => v.check(required, *op),
            (VersionConstraint::Range { low, high }, Some(v)) => {
                v.check(low, VersionOperation::Ge) && v.check(high, VersionOperation::Le)
            }
        }
    }
}

impl FromStr for PluginDependency {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PluginDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            VersionConstraint::Any => write!(f, "{}", self.name),
            VersionConstraint::Single { op, version } => write!(f, "{} {} {}", self.name, op, version),
            VersionConstraint::Range { low, high } => write!(f, "{} {}-{}", self.name, low, high),
        }
    }
}
