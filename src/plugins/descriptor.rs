//! 插件描述符
//!
//! 由一个 `.plugin` 清单文件解析而来。除加载状态外的所有字段在创建后不可变，
//! 描述符通过 `Arc` 共享，宿主可以在插件卸载后继续持有。

use super::dependency::PluginDependency;
use super::keyfile::{parse_bool, KeyFile};
use super::version::PluginVersion;
use crate::error::{PluginError, Result};
use crate::types::{PluginId, PluginStatus, PluginSummary, MANIFEST_GROUP};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 本地（编译型）语言的加载器名称
pub const NATIVE_LANGUAGE: &str = "native";

/// 清单中由描述符直接解析的键，其余键作为扩展数据保存
const KNOWN_KEYS: &[&str] = &[
    "Module",
    "Name",
    "Description",
    "Icon",
    "Depends",
    "Loader",
    "Authors",
    "Copyright",
    "Website",
    "Version",
    "Help",
    "Builtin",
    "Hidden",
    "Embedded",
];

/// 扩展数据值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalValue {
    Bool(bool),
    String(String),
}

/// 正在进行的状态迁移，用于打断依赖环
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Loading,
    Unloading,
}

#[derive(Debug)]
struct DescriptorState {
    loaded: bool,
    available: bool,
    transition: Option<Transition>,
    error: Option<Arc<PluginError>>,
}

/// 插件描述符
pub struct PluginDescriptor {
    filename: PathBuf,
    module_name: PluginId,
    module_dir: PathBuf,
    data_dir: PathBuf,
    language: String,
    embedded: Option<String>,
    dependencies: Vec<PluginDependency>,
    name: String,
    description: Option<String>,
    icon_name: Option<String>,
    authors: Vec<String>,
    copyright: Option<String>,
    website: Option<String>,
    version: Option<String>,
    help_uri: Option<String>,
    builtin: bool,
    hidden: bool,
    external_data: HashMap<String, ExternalValue>,
    state: Mutex<DescriptorState>,
    loader_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// 规范化加载器名称: 不区分大小写，`c` 视为本地语言
pub fn canonical_language(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "c" | "" => NATIVE_LANGUAGE.to_string(),
        _ => lower,
    }
}

impl PluginDescriptor {
    /// 读取并解析清单文件
    ///
    /// `module_dir` 是清单所在的模块目录，`data_dir` 是搜索路径的数据目录；
    /// 插件自身的数据目录为 `data_dir/<Module>`。
    pub fn from_file(
        filename: &Path,
        module_dir: &Path,
        data_dir: &Path,
        locale: Option<&str>,
    ) -> Result<Self> {
        let keyfile = KeyFile::load(filename)?;
        Self::from_keyfile(&keyfile, filename, module_dir, data_dir, locale)
    }

    /// 从内存中的清单文本解析
    pub fn parse(
        content: &str,
        filename: &Path,
        module_dir: &Path,
        data_dir: &Path,
        locale: Option<&str>,
    ) -> Result<Self> {
        let path = filename.display().to_string();
        let keyfile = KeyFile::parse(content).map_err(|message| PluginError::manifest(&path, &message))?;
        Self::from_keyfile(&keyfile, filename, module_dir, data_dir, locale)
    }

    fn from_keyfile(
        keyfile: &KeyFile,
        filename: &Path,
        module_dir: &Path,
        data_dir: &Path,
        locale: Option<&str>,
    ) -> Result<Self> {
        let path = filename.display().to_string();
        let fail = |message: &str| PluginError::manifest(&path, message);

        if !keyfile.has_group(MANIFEST_GROUP) {
            return Err(fail(&format!("missing [{}] group", MANIFEST_GROUP)));
        }

        let module_name = keyfile
            .string(MANIFEST_GROUP, "Module")
            .filter(|m| !m.is_empty())
            .ok_or_else(|| fail("missing required key 'Module'"))?;

        let name = keyfile
            .locale_string(MANIFEST_GROUP, "Name", locale)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| fail("missing required key 'Name'"))?;

        let dependencies = keyfile
            .string_list(MANIFEST_GROUP, "Depends")
            .unwrap_or_default()
            .iter()
            .map(|d| PluginDependency::parse(d.trim()))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| fail(&e.to_string()))?;

        let version = keyfile.string(MANIFEST_GROUP, "Version");
        if let Some(v) = &version {
            PluginVersion::parse(v).map_err(|e| fail(&e.to_string()))?;
        }

        let flag = |key: &str| -> Result<bool> {
            match keyfile.boolean(MANIFEST_GROUP, key) {
                Some(Ok(b)) => Ok(b),
                Some(Err(message)) => Err(fail(&message)),
                None => Ok(false),
            }
        };
        let builtin = flag("Builtin")?;
        let hidden = flag("Hidden")?;

        let language = keyfile
            .string(MANIFEST_GROUP, "Loader")
            .map(|l| canonical_language(&l))
            .unwrap_or_else(|| NATIVE_LANGUAGE.to_string());

        let mut external_data = HashMap::new();
        if let Some(group) = keyfile.group(MANIFEST_GROUP) {
            for key in group.keys() {
                // 本地化变体 `Key[locale]` 不作为独立的扩展数据
                if key.contains('[') || KNOWN_KEYS.contains(&key) {
                    continue;
                }
                let raw = group.raw(key).unwrap_or_default();
                let value = match parse_bool(raw) {
                    Some(b) => ExternalValue::Bool(b),
                    None => ExternalValue::String(keyfile.string(MANIFEST_GROUP, key).unwrap_or_default()),
                };
                external_data.insert(key.to_string(), value);
            }
        }

        let non_empty = |key: &str| keyfile.string(MANIFEST_GROUP, key).filter(|s| !s.is_empty());

        Ok(Self {
            filename: filename.to_path_buf(),
            data_dir: data_dir.join(&module_name),
            module_dir: module_dir.to_path_buf(),
            module_name,
            language,
            embedded: non_empty("Embedded"),
            dependencies,
            name,
            description: keyfile.locale_string(MANIFEST_GROUP, "Description", locale),
            icon_name: non_empty("Icon"),
            authors: keyfile.string_list(MANIFEST_GROUP, "Authors").unwrap_or_default(),
            copyright: non_empty("Copyright"),
            website: non_empty("Website"),
            version,
            help_uri: non_empty("Help"),
            builtin,
            hidden,
            external_data,
            state: Mutex::new(DescriptorState {
                loaded: false,
                available: true,
                transition: None,
                error: None,
            }),
            loader_data: Mutex::new(None),
        })
    }

    /// 清单文件路径
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// 模块标识（注册表主键）
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// 规范化后的实现语言
    pub fn language(&self) -> &str {
        &self.language
    }

    /// 进程内注册函数名称
    pub fn embedded(&self) -> Option<&str> {
        self.embedded.as_deref()
    }

    pub fn dependencies(&self) -> &[PluginDependency] {
        &self.dependencies
    }

    /// 是否声明了对 `module_name` 的依赖
    pub fn has_dependency(&self, module_name: &str) -> bool {
        self.dependencies.iter().any(|d| d.name == module_name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn icon_name(&self) -> Option<&str> {
        self.icon_name.as_deref()
    }

    pub fn authors(&self) -> &[String] {
        &self.authors
    }

    pub fn copyright(&self) -> Option<&str> {
        self.copyright.as_deref()
    }

    pub fn website(&self) -> Option<&str> {
        self.website.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn help_uri(&self) -> Option<&str> {
        self.help_uri.as_deref()
    }

    /// 由宿主管理生命周期，不出现在用户启用/禁用界面
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    /// 不出现在任何界面
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// 扩展数据；`X-` 前缀的键也可以用去掉前缀的名称查询
    pub fn external_data(&self, key: &str) -> Option<&ExternalValue> {
        self.external_data
            .get(&format!("X-{}", key))
            .or_else(|| self.external_data.get(key))
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    /// 最近一次导致插件不可用的错误
    pub fn error(&self) -> Option<Arc<PluginError>> {
        self.state.lock().error.clone()
    }

    pub fn status(&self) -> PluginStatus {
        let state = self.state.lock();
        if state.loaded {
            PluginStatus::Loaded
        } else if state.available {
            PluginStatus::Available
        } else {
            PluginStatus::Unavailable
        }
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.module_name.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            language: self.language.clone(),
            status: self.status(),
            builtin: self.builtin,
            hidden: self.hidden,
            error: self.error().map(|e| e.to_string()),
        }
    }

    /// 读取加载器附加的私有数据
    pub fn loader_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.loader_data.lock().clone()?;
        data.downcast::<T>().ok()
    }

    pub fn has_loader_data(&self) -> bool {
        self.loader_data.lock().is_some()
    }

    /// 附加加载器私有数据，引擎从不检查其内容
    pub fn set_loader_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.loader_data.lock() = Some(data);
    }

    pub fn clear_loader_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.loader_data.lock().take()
    }

    pub(crate) fn transition(&self) -> Option<Transition> {
        self.state.lock().transition
    }

    pub(crate) fn set_transition(&self, transition: Option<Transition>) {
        self.state.lock().transition = transition;
    }

    pub(crate) fn set_loaded(&self, loaded: bool) {
        let mut state = self.state.lock();
        state.loaded = loaded && state.available;
    }

    /// 记录错误并标记为不可用
    pub(crate) fn mark_unavailable(&self, error: PluginError) {
        let mut state = self.state.lock();
        state.loaded = false;
        state.available = false;
        state.error = Some(Arc::new(error));
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("module_name", &self.module_name)
            .field("language", &self.language)
            .field("filename", &self.filename)
            .field("dependencies", &self.dependencies)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<PluginDescriptor> {
        PluginDescriptor::parse(
            content,
            Path::new("/plugins/test.plugin"),
            Path::new("/plugins"),
            Path::new("/data"),
            None,
        )
    }

    const FULL: &str = "\
[Plugin]
Module=full-info
Loader=Python3
Name=Full Info
Description=Has full info
Icon=new-icon
Depends=something;something-else >= 1.2
Authors=Garrett;Steve
Copyright=Copyright © 2010 Garrett
Website=https://example.org
Version=1.0
Help=https://example.org/help
Builtin=true
Hidden=false
X-Bool=true
X-String=str
Custom=1
";

    #[test]
    fn test_full_manifest() {
        let info = parse(FULL).unwrap();

        assert_eq!(info.module_name(), "full-info");
        assert_eq!(info.language(), "python3");
        assert_eq!(info.name(), "Full Info");
        assert_eq!(info.description(), Some("Has full info"));
        assert_eq!(info.icon_name(), Some("new-icon"));
        assert_eq!(info.authors(), &["Garrett".to_string(), "Steve".to_string()]);
        assert_eq!(info.version(), Some("1.0"));
        assert_eq!(info.help_uri(), Some("https://example.org/help"));
        assert!(info.is_builtin());
        assert!(!info.is_hidden());
        assert_eq!(info.data_dir(), Path::new("/data/full-info"));
        assert_eq!(info.module_dir(), Path::new("/plugins"));

        assert!(info.has_dependency("something"));
        assert!(info.has_dependency("something-else"));
        assert!(!info.has_dependency("does-not-exist"));
        assert!(info.dependencies()[1].check(Some("1.3")));
    }

    #[test]
    fn test_external_data() {
        let info = parse(FULL).unwrap();

        assert_eq!(info.external_data("Bool"), Some(&ExternalValue::Bool(true)));
        assert_eq!(info.external_data("X-Bool"), Some(&ExternalValue::Bool(true)));
        assert_eq!(
            info.external_data("String"),
            Some(&ExternalValue::String("str".to_string()))
        );
        assert_eq!(info.external_data("Custom"), Some(&ExternalValue::Bool(true)));
        assert!(info.external_data("Name").is_none());
        assert!(info.external_data("Missing").is_none());
    }

    #[test]
    fn test_localized_external_keys_are_skipped() {
        let info = parse("[Plugin]\nModule=m\nName=M\nX-Greeting=hello\nX-Greeting[de]=hallo\nX-Flag[fr]=true\n").unwrap();

        assert_eq!(
            info.external_data("Greeting"),
            Some(&ExternalValue::String("hello".to_string()))
        );
        assert!(info.external_data("X-Greeting[de]").is_none());
        assert!(info.external_data("Greeting[de]").is_none());
        assert!(info.external_data("Flag").is_none());
        assert!(info.external_data("X-Flag[fr]").is_none());
    }

    #[test]
    fn test_minimal_manifest_defaults() {
        let info = parse("[Plugin]\nModule=min\nName=Min\n").unwrap();

        assert_eq!(info.language(), NATIVE_LANGUAGE);
        assert!(info.dependencies().is_empty());
        assert!(info.description().is_none());
        assert!(info.version().is_none());
        assert!(!info.is_builtin());
        assert!(info.is_available());
        assert!(!info.is_loaded());
        assert_eq!(info.status(), PluginStatus::Available);
    }

    #[test]
    fn test_c_loader_alias() {
        let info = parse("[Plugin]\nModule=m\nName=M\nLoader=C\n").unwrap();
        assert_eq!(info.language(), NATIVE_LANGUAGE);
    }

    #[test]
    fn test_missing_required_keys() {
        let err = parse("[Plugin]\nName=No module\n").unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse { .. }));
        assert!(err.to_string().contains("Module"));

        let err = parse("[Plugin]\nModule=no-name\n").unwrap_err();
        assert!(err.to_string().contains("Name"));

        assert!(parse("[Other]\nModule=x\nName=x\n").is_err());
    }

    #[test]
    fn test_malformed_values() {
        assert!(parse("[Plugin]\nModule=m\nName=M\nDepends=bad dep\n").is_err());
        assert!(parse("[Plugin]\nModule=m\nName=M\nVersion=1..2\n").is_err());
        assert!(parse("[Plugin]\nModule=m\nName=M\nBuiltin=sometimes\n").is_err());
    }

    #[test]
    fn test_localized_name() {
        let info = PluginDescriptor::parse(
            "[Plugin]\nModule=m\nName=Hello\nName[de]=Hallo\n",
            Path::new("m.plugin"),
            Path::new("."),
            Path::new("."),
            Some("de_DE.UTF-8"),
        )
        .unwrap();
        assert_eq!(info.name(), "Hallo");
    }

    #[test]
    fn test_state_and_loader_data() {
        let info = parse("[Plugin]\nModule=m\nName=M\n").unwrap();

        info.set_loaded(true);
        assert!(info.is_loaded());

        info.set_loader_data(Arc::new(42u32));
        assert_eq!(info.loader_data::<u32>().as_deref(), Some(&42));
        assert!(info.loader_data::<String>().is_none());

        info.mark_unavailable(PluginError::load_failed("m", "boom"));
        assert!(!info.is_loaded());
        assert!(!info.is_available());
        assert_eq!(info.status(), PluginStatus::Unavailable);
        assert!(info.error().unwrap().to_string().contains("boom"));

        // 不可用的描述符不能被标记为已加载
        info.set_loaded(true);
        assert!(!info.is_loaded());
    }
}
