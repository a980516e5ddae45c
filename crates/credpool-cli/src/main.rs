use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "credpool",
    about = "credpool — inspect connection descriptors and pool configuration",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and render connection descriptors
    Descriptor {
        #[command(subcommand)]
        action: DescriptorAction,
    },
    /// Validate or scaffold a credpool.toml
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum DescriptorAction {
    /// Parse a descriptor and print its fields
    Parse {
        /// Descriptor text, e.g. 'user=scott connectString=db:1521/svc'
        text: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Include the password in the output
        #[arg(long)]
        show_password: bool,
    },
    /// Print the descriptor in canonical form without its password
    Redact {
        text: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load a credpool.toml, apply overrides and validate the result.
    ///
    /// The password named by `password_env` is read from the environment.
    Check {
        #[arg(default_value = "credpool.toml")]
        path: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Generate a credpool.toml scaffold
    Init {
        /// Directory to write credpool.toml into
        #[arg(short, long, default_value = ".")]
        path: String,
        #[arg(long, default_value = "localhost:1521/FREEPDB1")]
        connect_string: String,
        #[arg(short, long, default_value = "app")]
        user: String,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("credpool=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Descriptor { action } => match action {
            DescriptorAction::Parse {
                text,
                format,
                show_password,
            } => commands::descriptor::parse(&text, &format, show_password),
            DescriptorAction::Redact { text } => commands::descriptor::redact(&text),
        },
        Commands::Config { action } => match action {
            ConfigAction::Check { path, format } => commands::config::check(&path, &format),
            ConfigAction::Init {
                path,
                connect_string,
                user,
                force,
            } => commands::config::init(&path, &connect_string, &user, force),
        },
    }
}
