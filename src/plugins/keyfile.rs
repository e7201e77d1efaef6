//! 插件清单键值文件解析
//!
//! 格式为分组的 `key=value` 文本，支持 `#` 注释、`key[locale]` 本地化键、
//! 转义序列以及以 `;` 分隔的字符串列表。

use crate::error::{PluginError, Result};
use std::collections::HashMap;
use std::path::Path;

/// 单个分组内的条目，保持文件中的顺序
#[derive(Debug, Clone, Default)]
pub struct KeyFileGroup {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl KeyFileGroup {
    fn insert(&mut self, key: String, value: String) {
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// 原始值（未反转义）
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&pos| self.entries[pos].1.as_str())
    }

    /// 所有键，按出现顺序
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

/// 键值文件
#[derive(Debug, Clone, Default)]
pub struct KeyFile {
    groups: HashMap<String, KeyFileGroup>,
}

impl KeyFile {
    /// 从文件读取
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|message| {
            PluginError::manifest(&path.display().to_string(), &message)
        })
    }

    /// 解析文本内容
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut groups: HashMap<String, KeyFileGroup> = HashMap::new();
        let mut current: Option<String> = None;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim_start();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let Some(name) = header.trim_end().strip_suffix(']') else {
                    return Err(format!("line {}: malformed group header", lineno + 1));
                };
                groups.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("line {}: expected key=value", lineno + 1));
            };

            let Some(group) = current.as_ref() else {
                return Err(format!("line {}: key outside of any group", lineno + 1));
            };

            let key = key.trim_end();
            if key.is_empty() {
                return Err(format!("line {}: empty key", lineno + 1));
            }

            if let Some(group) = groups.get_mut(group) {
                group.insert(key.to_string(), value.trim_start().to_string());
            }
        }

        Ok(Self { groups })
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn group(&self, group: &str) -> Option<&KeyFileGroup> {
        self.groups.get(group)
    }

    /// 反转义后的字符串值
    pub fn string(&self, group: &str, key: &str) -> Option<String> {
        self.group(group)?.raw(key).map(unescape)
    }

    /// 按区域设置查找本地化字符串，回退到未本地化的值
    pub fn locale_string(&self, group: &str, key: &str, locale: Option<&str>) -> Option<String> {
        let g = self.group(group)?;

        if let Some(locale) = locale {
            for variant in locale_variants(locale) {
                if let Some(value) = g.raw(&format!("{}[{}]", key, variant)) {
                    return Some(unescape(value));
                }
            }
        }

        g.raw(key).map(unescape)
    }

    /// 以 `;` 分隔的字符串列表
    pub fn string_list(&self, group: &str, key: &str) -> Option<Vec<String>> {
        self.group(group)?.raw(key).map(split_list)
    }

    /// 布尔值；值存在但无法解析时返回错误信息
    pub fn boolean(&self, group: &str, key: &str) -> Option<std::result::Result<bool, String>> {
        self.group(group)?.raw(key).map(|raw| {
            parse_bool(raw).ok_or_else(|| format!("value '{}' for key '{}' is not a boolean", raw, key))
        })
    }
}

/// 解析布尔值
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim_end() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

fn split_list(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&';') => {
                current.push(';');
                chars.next();
            }
            ';' => items.push(unescape(&std::mem::take(&mut current))),
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        items.push(unescape(&current));
    }

    items
}

/// `lang_COUNTRY.encoding@modifier` 的查找顺序
fn locale_variants(locale: &str) -> Vec<String> {
    let (rest, modifier) = match locale.split_once('@') {
        Some((rest, modifier)) => (rest, Some(modifier)),
        None => (locale, None),
    };
    let rest = rest.split('.').next().unwrap_or(rest);
    let (lang, country) = match rest.split_once('_') {
        Some((lang, country)) => (lang, Some(country)),
        None => (rest, None),
    };

    let mut variants = Vec::new();
    if let (Some(country), Some(modifier)) = (country, modifier) {
        variants.push(format!("{}_{}@{}", lang, country, modifier));
    }
    if let Some(country) = country {
        variants.push(format!("{}_{}", lang, country));
    }
    if let Some(modifier) = modifier {
        variants.push(format!("{}@{}", lang, modifier));
    }
    variants.push(lang.to_string());
    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
[Plugin]
Module=hello
Name=Hello
Name[fr]=Bonjour
Name[pt_BR]=Olá
Description=Line\\nbreak\\sand\\\\slash
Depends=foo;bar >= 1.2;
Authors=A\\;B;C
Builtin=true
Hidden=maybe
";

    #[test]
    fn test_parse_groups_and_values() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert!(kf.has_group("Plugin"));
        assert_eq!(kf.string("Plugin", "Module").as_deref(), Some("hello"));
        assert_eq!(
            kf.string("Plugin", "Description").as_deref(),
            Some("Line\nbreak and\\slash")
        );
        assert!(kf.string("Plugin", "Missing").is_none());
        assert!(kf.string("Other", "Module").is_none());
    }

    #[test]
    fn test_string_lists() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(
            kf.string_list("Plugin", "Depends").unwrap(),
            vec!["foo".to_string(), "bar >= 1.2".to_string()]
        );
        assert_eq!(
            kf.string_list("Plugin", "Authors").unwrap(),
            vec!["A;B".to_string(), "C".to_string()]
        );
    }

    #[test]
    fn test_locale_lookup() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(kf.locale_string("Plugin", "Name", Some("fr_FR.UTF-8")).unwrap(), "Bonjour");
        assert_eq!(kf.locale_string("Plugin", "Name", Some("pt_BR")).unwrap(), "Olá");
        assert_eq!(kf.locale_string("Plugin", "Name", Some("de")).unwrap(), "Hello");
        assert_eq!(kf.locale_string("Plugin", "Name", None).unwrap(), "Hello");
    }

    #[test]
    fn test_booleans() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(kf.boolean("Plugin", "Builtin"), Some(Ok(true)));
        assert!(matches!(kf.boolean("Plugin", "Hidden"), Some(Err(_))));
        assert_eq!(kf.boolean("Plugin", "Embedded"), None);
    }

    #[test]
    fn test_malformed_input() {
        assert!(KeyFile::parse("Module=x\n").is_err());
        assert!(KeyFile::parse("[Plugin\nModule=x\n").is_err());
        assert!(KeyFile::parse("[Plugin]\njust text\n").is_err());
    }

    #[test]
    fn test_locale_variants_order() {
        assert_eq!(
            locale_variants("sr_RS.UTF-8@latin"),
            vec!["sr_RS@latin", "sr_RS", "sr@latin", "sr"]
        );
    }
}
