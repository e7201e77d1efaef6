//! MosesPlugin 主程序 - 配置驱动运行
//!
//! 按 YAML 配置构建插件引擎并列出发现的插件

use anyhow::{bail, Context};
use moses_plugin::{
    config::{generate_default_config_file, ConfigManager},
    Engine, PluginStatus,
};
use std::env;
use std::path::Path;

const DEFAULT_CONFIG_FILE: &str = "moses_plugin.yaml";

/// 程序入口点
fn main() {
    match run_main() {
        Ok(_) => {}
        Err(e) => {
            tracing::error!("❌ 程序运行失败: {:#}", e);
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// 主要逻辑函数
fn run_main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.len() {
        1 => run_with_config(ConfigManager::new_default()),
        2 => match args[1].as_str() {
            "init" => generate_config_file(),
            "-h" | "--help" | "help" => {
                print_usage();
                Ok(())
            }
            path => {
                if !Path::new(path).exists() {
                    bail!("配置文件不存在: {} (使用 'moses_plugin init' 生成默认配置文件)", path);
                }
                let manager = ConfigManager::load_from_file(path)
                    .with_context(|| format!("无法加载配置文件 {}", path))?;
                run_with_config(manager)
            }
        },
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// 构建引擎并显示插件
fn run_with_config(manager: ConfigManager) -> anyhow::Result<()> {
    let config = manager.get_config();
    moses_plugin::initialize(&config.logging)?;
    manager.validate()?;

    tracing::info!("🚀 启动 {} v{}", moses_plugin::FRAMEWORK_NAME, moses_plugin::VERSION);
    for sp in &config.search_paths {
        tracing::info!("📂 搜索路径: {}", sp.module_dir.display());
    }

    let engine = Engine::from_config(config).context("无法构建插件引擎")?;
    display_plugins(&engine);

    tracing::info!("🎉 共发现 {} 个插件，已加载 {} 个", engine.plugin_list().len(), engine.get_loaded_plugins().len());
    Ok(())
}

/// 显示插件列表
fn display_plugins(engine: &Engine) {
    let plugins = engine.plugin_list();
    if plugins.is_empty() {
        println!("(no plugins found)");
        return;
    }

    for info in plugins {
        let summary = info.summary();
        let marker = match summary.status {
            PluginStatus::Loaded => "●",
            PluginStatus::Available => "○",
            PluginStatus::Unavailable => "✗",
        };
        println!(
            "{} {:<24} {:<10} {:<8} {}{}",
            marker,
            summary.id,
            summary.version.as_deref().unwrap_or("-"),
            summary.language,
            summary.status,
            if summary.builtin { " [builtin]" } else { "" }
        );
        if let Some(error) = summary.error {
            println!("    {}", error);
        }
    }
}

/// 生成默认配置文件
fn generate_config_file() -> anyhow::Result<()> {
    generate_default_config_file(DEFAULT_CONFIG_FILE)?;
    println!("✅ 已生成默认配置文件: {}", DEFAULT_CONFIG_FILE);
    Ok(())
}

fn print_usage() {
    println!("用法:");
    println!("  moses_plugin                 使用默认配置运行");
    println!("  moses_plugin init            生成默认配置文件 {}", DEFAULT_CONFIG_FILE);
    println!("  moses_plugin <config.yaml>   使用指定配置文件运行");
}
