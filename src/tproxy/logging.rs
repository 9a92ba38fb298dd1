use std::{fs, io, path::Path};

use anyhow::Context;
use tracing_subscriber::{
    fmt::writer::BoxMakeWriter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use super::config::LoggingConfig;

/// Install the global subscriber.
///
/// The writer is deliberately synchronous: the master forks workers after
/// this runs, and children must keep logging through the inherited
/// subscriber without depending on a helper thread.
pub fn init(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(logging)?;

    let file = logging.file.trim();
    let (writer, ansi) = if file == "-" {
        (BoxMakeWriter::new(io::stderr), true)
    } else {
        let path = Path::new(file);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("logging: mkdir {}", parent.display()))?;
            }
        }
        let out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("logging: open {}", path.display()))?;
        (BoxMakeWriter::new(std::sync::Arc::new(out)), false)
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

fn build_filter(logging: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let directive = match logging.level.trim().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warning" | "warn" => "warn",
        "error" => "error",
        "critical" => "error",
        _ => "info",
    };

    let mut spec = directive.to_string();
    if let Some(path) = &logging.config {
        let extra = fs::read_to_string(path)
            .with_context(|| format!("logging: read {}", path.display()))?;
        for line in extra.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            spec.push(',');
            spec.push_str(line);
        }
    }

    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&spec))
        .context("logging: init filter")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_directives() {
        for (level, _expected) in [
            ("debug", "debug"),
            ("warning", "warn"),
            ("critical", "error"),
            ("bogus", "info"),
        ] {
            let cfg = LoggingConfig {
                level: level.into(),
                file: "-".into(),
                config: None,
            };
            assert!(build_filter(&cfg).is_ok());
        }
    }

    #[test]
    fn filter_file_directives_are_layered() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("tproxy-logcfg-{}", std::process::id()));
        fs::write(&path, "# comment\ntproxy::worker=debug\n").unwrap();
        let cfg = LoggingConfig {
            level: "info".into(),
            file: "-".into(),
            config: Some(path.clone()),
        };
        assert!(build_filter(&cfg).is_ok());
        let _ = fs::remove_file(&path);
    }
}
