//! Python 插件加载器
//!
//! 插件是 `module_dir` 下与模块同名的 Python 模块或包。解释器在进程内只能
//! 初始化一次，因此加载器总是全局的。实现类通过基类名称或
//! `__moses_interfaces__` 列表声明自己实现的接口；构造属性经 `pythonize`
//! 转换为关键字参数，方法调用的参数和返回值同样经 JSON 值中转。

use super::capability::{ConstructArgs, ExtensionObject, InterfaceInfo};
use super::descriptor::PluginDescriptor;
use super::loader::{ensure_loaded, PluginLoader};
use crate::error::{PluginError, Result};
use crate::types::PLUGIN_INFO_PROPERTY;
use parking_lot::Mutex;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyTuple, PyType};
use pythonize::{depythonize, pythonize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

const LANGUAGE: &str = "python3";

/// 实现类声明接口的属性
const INTERFACES_ATTRIBUTE: &str = "__moses_interfaces__";

/// Python 中接收描述符摘要的关键字参数
const PLUGIN_INFO_KWARG: &str = "plugin_info";

/// 挂在描述符上的已导入模块
struct PythonModule {
    filename: PathBuf,
    module: Py<PyModule>,
}

/// Python 插件加载器
#[derive(Default)]
pub struct PythonLoader {
    /// 按清单路径缓存的导入结果，导入失败记为 `None`
    modules: Mutex<HashMap<PathBuf, Option<Py<PyModule>>>>,
    /// (清单路径, 接口名) 对应的实现类
    types: Mutex<HashMap<(PathBuf, String), Option<Py<PyType>>>>,
}

fn failed(plugin: &str, e: impl Display) -> PluginError {
    PluginError::load_failed(plugin, &e.to_string())
}

impl PythonLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn import(&self, py: Python<'_>, info: &PluginDescriptor) -> Result<Py<PyModule>> {
        let name = info.module_name();

        let sys = py.import("sys").map_err(|e| failed(name, e))?;
        let modules: &PyDict = sys
            .getattr("modules")
            .and_then(|m| m.downcast::<PyDict>().map_err(PyErr::from))
            .map_err(|e| failed(name, e))?;
        if modules.contains(name).map_err(|e| failed(name, e))? {
            return Err(PluginError::load_failed(
                name,
                &format!("module name '{}' has already been used", name),
            ));
        }

        let path: &PyList = sys
            .getattr("path")
            .and_then(|p| p.downcast::<PyList>().map_err(PyErr::from))
            .map_err(|e| failed(name, e))?;
        let dir = info.module_dir().to_string_lossy().to_string();
        let present = path
            .iter()
            .any(|p| p.extract::<String>().map_or(false, |p| p == dir));
        if !present {
            path.insert(0, &dir).map_err(|e| failed(name, e))?;
        }

        let module = py.import(name).map_err(|e| {
            failed(
                name,
                format!("Error importing plugin '{}': {}", name, e),
            )
        })?;
        Ok(module.into())
    }

    fn find_extension_type(
        &self,
        py: Python<'_>,
        data: &PythonModule,
        iface: &InterfaceInfo,
    ) -> Result<Option<Py<PyType>>> {
        let key = (data.filename.clone(), iface.name.to_string());
        if let Some(cached) = self.types.lock().get(&key) {
            return Ok(cached.clone());
        }

        let module = data.module.as_ref(py);
        let mut found = None;
        for (_, value) in module.dict() {
            let Ok(class) = value.downcast::<PyType>() else {
                continue;
            };
            if class_implements(class, iface.name) {
                found = Some(Py::<PyType>::from(class));
                break;
            }
        }

        self.types.lock().insert(key, found.clone());
        Ok(found)
    }

    fn module_for(info: &PluginDescriptor) -> Result<Arc<PythonModule>> {
        info.loader_data::<PythonModule>().ok_or_else(|| {
            PluginError::precondition(&format!(
                "plugin '{}' has no Python module attached",
                info.module_name()
            ))
        })
    }
}

/// 类是否声明或继承了某个接口；与接口同名的类本身视为接口定义
fn class_implements(class: &PyType, iface: &str) -> bool {
    if class.name().map_or(true, |name| name == iface) {
        return false;
    }

    if let Ok(declared) = class.getattr(INTERFACES_ATTRIBUTE) {
        if let Ok(names) = declared.extract::<Vec<String>>() {
            if names.iter().any(|n| n == iface) {
                return true;
            }
        }
    }

    let Ok(mro) = class.getattr("__mro__") else {
        return false;
    };
    let Ok(mro) = mro.downcast::<PyTuple>() else {
        return false;
    };
    mro.iter().any(|base| {
        base.getattr("__name__")
            .and_then(|n| n.extract::<String>())
            .map_or(false, |n| n == iface)
    })
}

/// 构造函数是否声明了 `plugin_info` 参数
fn accepts_plugin_info(py: Python<'_>, class: &PyType) -> bool {
    py.import("inspect")
        .and_then(|inspect| inspect.call_method1("signature", (class,)))
        .and_then(|sig| sig.getattr("parameters"))
        .and_then(|params| params.call_method1("__contains__", (PLUGIN_INFO_KWARG,)))
        .and_then(|contains| contains.extract::<bool>())
        .unwrap_or(false)
}

impl PluginLoader for PythonLoader {
    fn initialize(&self) -> Result<()> {
        Python::with_gil(|py| {
            py.import("gc")
                .map(|_| ())
                .map_err(|e| PluginError::loader_unavailable(LANGUAGE, &e.to_string()))
        })?;
        debug!("Python interpreter ready");
        Ok(())
    }

    fn load(&self, info: &Arc<PluginDescriptor>) -> Result<()> {
        let cached = self.modules.lock().get(info.filename()).cloned();

        let module = match cached {
            Some(Some(module)) => module,
            Some(None) => {
                return Err(PluginError::load_failed(
                    info.module_name(),
                    "the module failed to import previously",
                ))
            }
            None => {
                let imported = Python::with_gil(|py| self.import(py, info));
                self.modules
                    .lock()
                    .insert(info.filename().to_path_buf(), imported.as_ref().ok().cloned());
                imported?
            }
        };

        info.set_loader_data(Arc::new(PythonModule {
            filename: info.filename().to_path_buf(),
            module,
        }));
        Ok(())
    }

    fn unload(&self, info: &Arc<PluginDescriptor>) {
        // 模块保留在 sys.modules 中
        info.clear_loader_data();
    }

    fn provides_capability(&self, info: &Arc<PluginDescriptor>, iface: &InterfaceInfo) -> Result<bool> {
        ensure_loaded(info)?;
        let data = Self::module_for(info)?;
        Python::with_gil(|py| Ok(self.find_extension_type(py, &data, iface)?.is_some()))
    }

    fn create_capability(
        &self,
        info: &Arc<PluginDescriptor>,
        iface: &InterfaceInfo,
        args: ConstructArgs,
    ) -> Result<Option<Arc<dyn ExtensionObject>>> {
        ensure_loaded(info)?;
        let data = Self::module_for(info)?;
        let name = info.module_name();

        Python::with_gil(|py| {
            let Some(class) = self.find_extension_type(py, &data, iface)? else {
                return Ok(None);
            };
            let class = class.as_ref(py);

            let kwargs = PyDict::new(py);
            for (key, value) in args.properties() {
                let value = pythonize(py, value).map_err(|e| failed(name, e))?;
                kwargs.set_item(key, value).map_err(|e| failed(name, e))?;
            }
            if let Some(owner) = args.plugin_info() {
                if accepts_plugin_info(py, class) {
                    let summary = pythonize(py, &owner.summary()).map_err(|e| failed(name, e))?;
                    kwargs.set_item(PLUGIN_INFO_KWARG, summary).map_err(|e| failed(name, e))?;
                } else {
                    debug!("'{}' does not take '{}'", iface.name, PLUGIN_INFO_PROPERTY);
                }
            }

            let instance = class.call((), Some(kwargs)).map_err(|e| {
                warn!(error = %e, "Failed to create '{}' for plugin '{}'", iface.name, name);
                failed(name, e)
            })?;

            let object: Arc<dyn ExtensionObject> = Arc::new(PythonObject {
                object: instance.into(),
            });
            Ok(Some(object))
        })
    }

    fn garbage_collect(&self) {
        Python::with_gil(|py| {
            if let Err(e) = py.import("gc").and_then(|gc| gc.call_method0("collect")) {
                warn!(error = %e, "Python garbage collection failed");
            }
        });
    }
}

/// Python 实现对象
pub struct PythonObject {
    object: PyObject,
}

impl ExtensionObject for PythonObject {
    fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        Python::with_gil(|py| {
            let mut py_args = Vec::with_capacity(args.len());
            for arg in &args {
                py_args.push(pythonize(py, arg).map_err(|e| PluginError::invalid_arguments(method, &e.to_string()))?);
            }

            let result = self
                .object
                .as_ref(py)
                .call_method1(method, PyTuple::new(py, py_args))
                .map_err(|e| PluginError::call(method, &e.to_string()))?;

            if result.is_none() {
                return Ok(Value::Null);
            }
            depythonize(result).map_err(|e| PluginError::call(method, &e.to_string()))
        })
    }

    fn responds_to(&self, method: &str) -> bool {
        Python::with_gil(|py| self.object.as_ref(py).hasattr(method).unwrap_or(false))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::capability::MethodInfo;
    use std::path::Path;

    static GREETER: InterfaceInfo = InterfaceInfo {
        name: "PythonTestGreeter",
        methods: &[MethodInfo { name: "greet", params: &["who"] }],
        prerequisites: &[],
        properties: &[],
    };

    const MODULE: &str = r#"
class PythonTestGreeter:
    pass

class Greeter(PythonTestGreeter):
    def __init__(self, prefix="Hello", plugin_info=None):
        self.prefix = prefix
        self.owner = plugin_info["id"] if plugin_info else None

    def greet(self, who):
        return "%s, %s (%s)" % (self.prefix, who, self.owner)
"#;

    fn descriptor(dir: &Path, module: &str) -> Arc<PluginDescriptor> {
        let content = format!("[Plugin]\nModule={}\nName=Py\nLoader=python3\n", module);
        Arc::new(
            PluginDescriptor::parse(
                &content,
                &dir.join(format!("{}.plugin", module)),
                dir,
                dir,
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_python_plugin_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("moses_py_greeter.py"), MODULE).unwrap();

        let loader = PythonLoader::new();
        loader.initialize().unwrap();
        let info = descriptor(dir.path(), "moses_py_greeter");

        loader.load(&info).unwrap();
        info.set_loaded(true);
        assert!(loader.provides_capability(&info, &GREETER).unwrap());

        let mut args = ConstructArgs::new().with("prefix", "Hi");
        args.set_plugin_info(info.clone());
        let object = loader.create_capability(&info, &GREETER, args).unwrap().unwrap();

        assert!(object.responds_to("greet"));
        assert!(!object.responds_to("missing"));
        assert_eq!(
            object.call("greet", vec![Value::from("you")]).unwrap(),
            Value::from("Hi, you (moses_py_greeter)")
        );

        loader.garbage_collect();
        loader.unload(&info);
        assert!(!info.has_loader_data());
    }

    #[test]
    fn test_import_failure_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("moses_py_broken.py"), "raise RuntimeError('nope')\n").unwrap();

        let loader = PythonLoader::new();
        let info = descriptor(dir.path(), "moses_py_broken");

        assert!(matches!(loader.load(&info), Err(PluginError::LoadFailed { .. })));
        let err = loader.load(&info).unwrap_err();
        assert!(err.to_string().contains("previously"));
    }
}
