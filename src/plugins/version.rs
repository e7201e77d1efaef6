//! 插件版本号
//!
//! 版本格式为 `major[.minor[.micro]]`，次版本与修订号可以使用 `*` 通配

use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// 版本号组成部分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionComponent {
    Number(u32),
    /// `*`，与任意值相等
    Any,
}

impl VersionComponent {
    fn is_any(self) -> bool {
        matches!(self, VersionComponent::Any)
    }

    fn is_zero(self) -> bool {
        matches!(self, VersionComponent::Number(0))
    }

    fn number(self) -> u32 {
        match self {
            VersionComponent::Number(n) => n,
            VersionComponent::Any => 0,
        }
    }
}

/// 版本比较操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionOperation {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl VersionOperation {
    /// 比较结果是否满足该操作
    pub fn accepts(self, ordering: Ordering) -> bool {
        match self {
            VersionOperation::Eq => ordering == Ordering::Equal,
            VersionOperation::Ne => ordering != Ordering::Equal,
            VersionOperation::Lt => ordering == Ordering::Less,
            VersionOperation::Gt => ordering == Ordering::Greater,
            VersionOperation::Le => ordering != Ordering::Greater,
            VersionOperation::Ge => ordering != Ordering::Less,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VersionOperation::Eq => "==",
            VersionOperation::Ne => "!=",
            VersionOperation::Lt => "<",
            VersionOperation::Gt => ">",
            VersionOperation::Le => "<=",
            VersionOperation::Ge => ">=",
        }
    }
}

impl fmt::Display for VersionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 插件版本
///
/// 派生的 `PartialEq` 是结构相等；通配语义下的相等请使用 [`PluginVersion::compare`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginVersion {
    /// 主版本号（不允许通配）
    pub major: u32,
    /// 次版本号
    pub minor: VersionComponent,
    /// 修订号
    pub micro: VersionComponent,
}

impl PluginVersion {
    /// 创建新版本
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor: VersionComponent::Number(minor),
            micro: VersionComponent::Number(micro),
        }
    }

    /// 解析版本字符串
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |message: String| Err(PluginError::invalid_version(input, &message));

        if input.is_empty() {
            return invalid("empty version string".to_string());
        }

        let bytes = input.as_bytes();
        let mut parts = [VersionComponent::Number(0); 3];
        let mut section = 0usize;
        let mut section_has_digits = false;
        let mut i = 0usize;

        while i < bytes.len() {
            let c = bytes[i];

            if !c.is_ascii_digit() && c != b'*' {
                return invalid(format!("invalid character '{}'", c as char));
            }

            if c == b'*' {
                if section == 0 {
                    return invalid("cannot use star for major version".to_string());
                }
                if section_has_digits {
                    return invalid("cannot use star in number".to_string());
                }
                if i + 1 != bytes.len() {
                    return invalid("star does not end version string".to_string());
                }
                parts[section] = VersionComponent::Any;
                break;
            }

            let digit = u32::from(c - b'0');
            let value = parts[section]
                .number()
                .checked_mul(10)
                .and_then(|n| n.checked_add(digit));
            match value {
                Some(n) => parts[section] = VersionComponent::Number(n),
                None => return invalid("version component is too large".to_string()),
            }
            section_has_digits = true;

            i += 1;
            if i < bytes.len() && bytes[i] == b'.' {
                i += 1;
                section += 1;
                section_has_digits = false;

                if section > 2 {
                    return invalid("too many dots".to_string());
                }

                match bytes.get(i) {
                    Some(c) if c.is_ascii_digit() || *c == b'*' => {}
                    _ => return invalid("number missing after dot".to_string()),
                }
            }
        }

        let version = Self {
            major: parts[0].number(),
            minor: parts[1],
            micro: parts[2],
        };

        if version.major == 0 && version.minor.is_zero() && version.micro.is_zero() {
            return invalid("0.0.0 is not a version".to_string());
        }

        Ok(version)
    }

    /// 比较两个版本，`*` 与同一位置的任意值相等
    pub fn compare(&self, other: &Self) -> Ordering {
        if self.major == other.major
            && (self.minor.is_any()
                || other.minor.is_any()
                || (self.minor == other.minor && (self.micro.is_any() || other.micro.is_any())))
        {
            return Ordering::Equal;
        }

        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.number().cmp(&other.minor.number()))
            .then_with(|| self.micro.number().cmp(&other.micro.number()))
    }

    /// `self op other` 是否成立
    pub fn check(&self, other: &Self, op: VersionOperation) -> bool {
        op.accepts(self.compare(other))
    }
}

impl FromStr for PluginVersion {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use VersionComponent::{Any, Number};

        match (self.minor, self.micro) {
            (Any, _) => write!(f, "{}.*", self.major),
            (Number(minor), Any) => write!(f, "{}.{}.*", self.major, minor),
            (Number(0), Number(0)) => write!(f, "{}", self.major),
            (Number(minor), Number(0)) => write!(f, "{}.{}", self.major, minor),
            (Number(minor), Number(micro)) => write!(f, "{}.{}.{}", self.major, minor, micro),
        }
    }
}
