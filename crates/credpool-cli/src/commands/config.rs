use std::path::Path;

use credpool_core::PoolFileConfig;
use credpool_core::descriptor::format_duration;
use serde::Serialize;

use super::descriptor::DescriptorView;

#[derive(Debug, Serialize)]
struct ConfigReport {
    path: String,
    descriptor: DescriptorView,
    sweep_interval: Option<String>,
}

/// Load and resolve `path`, using `env` for `password_env` lookups.
fn render_check(
    path: &Path,
    format: &str,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<String> {
    let config = PoolFileConfig::from_file(path)?;
    let resolved = config.resolve_with(env)?;
    tracing::debug!(path = %path.display(), descriptor = %resolved.descriptor, "configuration resolved");

    let report = ConfigReport {
        path: path.display().to_string(),
        descriptor: DescriptorView::new(&resolved.descriptor, false),
        sweep_interval: resolved.sweep_interval.map(format_duration),
    };
    match format {
        "json" => Ok(serde_json::to_string_pretty(&report)?),
        "text" => Ok(format!(
            "✓ {} is valid\n{}\nsweep interval:   {}",
            report.path,
            report.descriptor.to_text(),
            report.sweep_interval.as_deref().unwrap_or("off"),
        )),
        other => anyhow::bail!("unknown format `{other}`; expected text or json"),
    }
}

pub fn check(path: &str, format: &str) -> anyhow::Result<()> {
    let out = render_check(Path::new(path), format, |name| std::env::var(name).ok())?;
    println!("{out}");
    Ok(())
}

/// Write a scaffold `credpool.toml` into `dir`.
fn write_scaffold(dir: &Path, connect_string: &str, user: &str, force: bool) -> anyhow::Result<std::path::PathBuf> {
    let output = dir.join("credpool.toml");
    if output.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", output.display());
    }
    let config = PoolFileConfig::scaffold(connect_string, user);
    std::fs::write(&output, config.to_toml_string()?)?;
    Ok(output)
}

pub fn init(path: &str, connect_string: &str, user: &str, force: bool) -> anyhow::Result<()> {
    let output = write_scaffold(Path::new(path), connect_string, user, force)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
