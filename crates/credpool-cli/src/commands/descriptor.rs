use credpool_core::descriptor::format_duration;
use credpool_core::{ConnectionDescriptor, SerializeMode};
use serde::Serialize;

/// Flat view of a descriptor for printing.
#[derive(Debug, Serialize)]
pub struct DescriptorView {
    pub connect_string: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub proxy_user: Option<String>,
    pub connection_class: Option<String>,
    pub heterogeneous: bool,
    pub max_idle: usize,
    pub max_open: usize,
    pub idle_timeout: String,
    pub wait_timeout: String,
    pub ping_interval: String,
    /// Canonical text form, redacted unless the password was requested.
    pub canonical: String,
}

impl DescriptorView {
    pub fn new(descriptor: &ConnectionDescriptor, show_password: bool) -> Self {
        let identity = &descriptor.identity;
        let mode = if show_password {
            SerializeMode::WithPassword
        } else {
            SerializeMode::Redacted
        };
        Self {
            connect_string: descriptor.connect_string.clone(),
            user: identity.username().to_string(),
            password: (show_password && !identity.password().is_empty())
                .then(|| identity.password().to_string()),
            proxy_user: identity.proxy_target().map(str::to_string),
            connection_class: identity.connection_class().map(str::to_string),
            heterogeneous: descriptor.heterogeneous,
            max_idle: descriptor.pool.max_idle,
            max_open: descriptor.pool.max_open,
            idle_timeout: format_duration(descriptor.pool.idle_timeout),
            wait_timeout: format_duration(descriptor.pool.wait_timeout),
            ping_interval: descriptor
                .pool
                .ping_interval
                .map(format_duration)
                .unwrap_or_else(|| "off".to_string()),
            canonical: descriptor.serialize(mode),
        }
    }

    pub fn to_text(&self) -> String {
        let or_none = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        let max_open = if self.max_open == 0 {
            "unlimited".to_string()
        } else {
            self.max_open.to_string()
        };
        let mut lines = vec![
            format!("connect string:   {}", self.connect_string),
            format!("user:             {}", self.user),
        ];
        if let Some(password) = &self.password {
            lines.push(format!("password:         {password}"));
        }
        lines.extend([
            format!("proxy user:       {}", or_none(&self.proxy_user)),
            format!("connection class: {}", or_none(&self.connection_class)),
            format!("heterogeneous:    {}", self.heterogeneous),
            format!("max idle:         {}", self.max_idle),
            format!("max open:         {max_open}"),
            format!("idle timeout:     {}", self.idle_timeout),
            format!("wait timeout:     {}", self.wait_timeout),
            format!("ping interval:    {}", self.ping_interval),
        ]);
        lines.join("\n")
    }
}

pub fn render(text: &str, format: &str, show_password: bool) -> anyhow::Result<String> {
    let descriptor = ConnectionDescriptor::parse(text)?;
    let view = DescriptorView::new(&descriptor, show_password);
    match format {
        "json" => Ok(serde_json::to_string_pretty(&view)?),
        "text" => Ok(view.to_text()),
        other => anyhow::bail!("unknown format `{other}`; expected text or json"),
    }
}

pub fn parse(text: &str, format: &str, show_password: bool) -> anyhow::Result<()> {
    println!("{}", render(text, format, show_password)?);
    Ok(())
}

pub fn redact(text: &str) -> anyhow::Result<()> {
    let descriptor = ConnectionDescriptor::parse(text)?;
    println!("{descriptor}");
    Ok(())
}
