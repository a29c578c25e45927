use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::PathBuf;
use std::fs;

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("hive_crawler={}", level).parse()?)
        .add_directive("warn".parse()?);

    let fmt_layer = fmt::layer().with_target(true);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create log directory: {}", parent.display()))?;
        }

        // Reconnecting workers and restarted hosts keep one running log
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context(format!("Failed to open log file: {}", log_file.display()))?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Default log file for a process role (`host`, `worker`, `crawl`)
pub fn default_log_file(role: &str) -> PathBuf {
    let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "hive-crawler", "hive-crawler") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from(".")
    };

    path.push("logs");
    path.push(format!("{}.log", role));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_role_gets_its_own_log_file() {
        let host = default_log_file("host");
        let worker = default_log_file("worker");

        assert_eq!(host.file_name().and_then(|name| name.to_str()), Some("host.log"));
        assert_ne!(host, worker);
        assert_eq!(host.parent(), worker.parent());
    }
}
