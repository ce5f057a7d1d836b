use crate::models::config::{LogConfig, LogFormat, LogLevel, LogOutput};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// 全局日志级别 reload handle
static LOG_LEVEL_HANDLE: OnceLock<Handle<EnvFilter, Registry>> = OnceLock::new();

/// 文件输出的后台写线程 guard，进程存活期间不能释放
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "entity-cache";

/// 初始化日志系统
///
/// - 日志级别（trace/debug/info/warn/error），可通过 `update_log_level` 热更新
/// - 输出格式（JSON/纯文本）
/// - 输出目标（控制台/文件/both），文件按天滚动
///
/// 设置了 `RUST_LOG` 时以环境变量为准。
pub fn init_logger(config: &LogConfig) -> anyhow::Result<()> {
    let filter = create_env_filter(&config.level);
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    if LOG_LEVEL_HANDLE.set(reload_handle).is_err() {
        anyhow::bail!("日志系统已初始化，不能重复初始化");
    }

    let registry = Registry::default().with(filter_layer);
    let result = match (&config.output, &config.format) {
        (LogOutput::Console, LogFormat::Text) => {
            registry.with(create_console_text_layer()).try_init()
        }
        (LogOutput::Console, LogFormat::Json) => {
            registry.with(create_console_json_layer()).try_init()
        }
        (LogOutput::File, format) => {
            let file_layer = create_file_layer(config.file_path.as_deref(), *format)?;
            registry.with(file_layer).try_init()
        }
        (LogOutput::Both, LogFormat::Text) => {
            let file_layer = create_file_layer(config.file_path.as_deref(), LogFormat::Text)?;
            registry
                .with(create_console_text_layer())
                .with(file_layer)
                .try_init()
        }
        (LogOutput::Both, LogFormat::Json) => {
            let file_layer = create_file_layer(config.file_path.as_deref(), LogFormat::Json)?;
            registry
                .with(create_console_json_layer())
                .with(file_layer)
                .try_init()
        }
    };
    result.map_err(|e| anyhow::anyhow!("设置全局日志订阅器失败: {e}"))?;

    tracing::info!(
        level = config.level.as_str(),
        format = ?config.format,
        output = ?config.output,
        file_path = ?config.file_path,
        "日志系统初始化完成"
    );

    Ok(())
}

/// 创建环境过滤器
fn create_env_filter(level: &LogLevel) -> EnvFilter {
    // RUST_LOG=entity_cache=trace,reqwest=debug
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "entity_cache={},hyper=warn,reqwest=warn,h2=warn,tokio=warn",
            level.as_str()
        ))
    })
}

fn create_console_text_layer<S>() -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(cfg!(debug_assertions))
        .with_thread_ids(false)
        .with_ansi(true)
        .with_span_events(if cfg!(debug_assertions) {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .boxed()
}

fn create_console_json_layer<S>() -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_thread_ids(false)
        .boxed()
}

/// 文件输出层（文本或 JSON）
fn create_file_layer<S>(
    file_path: Option<&str>,
    format: LogFormat,
) -> anyhow::Result<Box<dyn Layer<S> + Send + Sync + 'static>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let log_dir = get_log_dir(file_path)?;
    let file_appender = rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = non_blocking(file_appender);

    if FILE_GUARD.set(guard).is_err() {
        anyhow::bail!("文件日志已初始化");
    }

    let layer = match format {
        LogFormat::Text => fmt::layer()
            .with_writer(writer)
            .with_target(cfg!(debug_assertions))
            .with_thread_ids(false)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .boxed(),
    };
    Ok(layer)
}

/// 日志目录：配置值，或 ~/.entity-cache/logs
fn get_log_dir(file_path: Option<&str>) -> anyhow::Result<std::path::PathBuf> {
    let dir = match file_path {
        Some(path) => std::path::PathBuf::from(path),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("无法获取用户主目录"))?
            .join(".entity-cache")
            .join("logs"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// 动态更新日志级别（热重载）
///
/// 仅调整级别，格式和输出目标的变更需要重新启动进程。
pub fn update_log_level(new_level: LogLevel) -> anyhow::Result<()> {
    let handle = LOG_LEVEL_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("日志系统未初始化"))?;

    let new_filter = create_env_filter(&new_level);
    handle
        .reload(new_filter)
        .map_err(|e| anyhow::anyhow!("重载日志级别失败: {}", e))?;

    tracing::info!(new_level = new_level.as_str(), "日志级别已动态更新");
    Ok(())
}
