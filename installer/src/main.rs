// SPDX-License-Identifier: AGPL-3.0-or-later
//! kc-radius: installs the RADIUS plugin into a Keycloak host
//!
//! Thin CLI over the reconciler. Logs go to stderr (or a file); stdout only
//! carries what the operator asked for.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use keycloak_radius_installer::{
    command::SystemRunner,
    config::{LoggingConfig, SourceKind},
    host::{ServiceHost, SystemdKeycloak},
    input,
    plugin_config::{self, ConfigChange, DesiredConfig, SecretOrigin},
    release::GithubReleases,
    secret::SharedSecret,
    verify, ArtifactSource, InstallError, InstallerConfig, ReconcileReport, Reconciler,
    RunOptions,
};

/// Attempts at an interactive secret before giving up
const PROMPT_ATTEMPTS: usize = 3;

/// kc-radius: Keycloak RADIUS plugin installer
///
/// Fetches the RADIUS plugin, installs it into Keycloak's providers
/// directory, writes its configuration and restarts the service.
#[derive(Parser, Debug)]
#[command(name = "kc-radius")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kc-radius/installer.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Dry run mode (log commands and writes instead of performing them)
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install or update the plugin and converge the service
    Install(InstallArgs),

    /// Show which artifacts would be installed
    Resolve(SourceArgs),

    /// Only merge the plugin configuration and fix its permissions
    Configure(PluginArgs),

    /// Check that the RADIUS listeners are bound
    Verify {
        /// Authentication port (default: configured or 1812)
        #[arg(long)]
        auth_port: Option<String>,

        /// Accounting port (default: configured or 1813)
        #[arg(long)]
        account_port: Option<String>,
    },

    /// Show recent service log lines
    Logs {
        /// Case-insensitive substring to keep
        #[arg(short, long, default_value = "radius")]
        filter: String,

        /// Number of journal lines to search
        #[arg(short = 'n', long)]
        lines: Option<u32>,
    },

    /// Generate a shared secret and print it
    Secret,

    /// Initialize a new installer configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Show version information
    Version,
}

/// Where to take the plugin from
#[derive(Args, Debug, Default)]
struct SourceArgs {
    /// Artifact source
    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    /// Release tag to install instead of the latest
    #[arg(long)]
    tag: Option<String>,

    /// Jar, zip or directory for the local source
    #[arg(long)]
    artifact: Option<PathBuf>,

    /// Also install the bundled rad-sec plugin
    #[arg(long)]
    with_secondary: bool,
}

/// Values merged into the plugin configuration
#[derive(Args, Debug, Default)]
struct PluginArgs {
    /// Shared secret; kept from the existing file or generated when omitted
    #[arg(long, env = "RADIUS_SHARED_SECRET", hide_env_values = true)]
    shared_secret: Option<String>,

    /// Prompt for the shared secret
    #[arg(long, conflicts_with = "shared_secret")]
    prompt_secret: bool,

    /// Authentication port (default: configured or 1812)
    #[arg(long)]
    auth_port: Option<String>,

    /// Accounting port (default: configured or 1813)
    #[arg(long)]
    account_port: Option<String>,

    /// Worker threads, used when the file is created
    #[arg(long)]
    threads: Option<String>,

    /// FreeRADIUS dictionary file to load
    #[arg(long)]
    external_dictionary: Option<String>,
}

#[derive(Args, Debug, Default)]
struct InstallArgs {
    #[command(flatten)]
    source: SourceArgs,

    #[command(flatten)]
    plugin: PluginArgs,

    /// Do not install OS packages
    #[arg(long)]
    skip_packages: bool,

    /// Keep placed artifacts when a later phase fails
    #[arg(long)]
    no_rollback: bool,

    /// Rebuild and restart even when nothing changed
    #[arg(long)]
    force_restart: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let phase = error
                .chain()
                .find_map(|cause| cause.downcast_ref::<InstallError>())
                .and_then(InstallError::phase);

            match phase {
                Some(phase) => {
                    eprintln!("error: [{}] {:#}", phase, error);
                    ExitCode::from(phase.exit_code())
                }
                None => {
                    eprintln!("error: {:#}", error);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = load_config(&cli.config);
    let logging = loaded
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    let _log_guard = init_logging(&cli, &logging)?;

    match cli.command {
        Commands::Version => {
            println!("kc-radius v{}", env!("CARGO_PKG_VERSION"));
            println!("Keycloak RADIUS plugin installer");
            Ok(())
        }

        Commands::Secret => {
            println!("{}", SharedSecret::generate().expose());
            Ok(())
        }

        Commands::Init { force } => init_config(&cli.config, force),

        Commands::Config => {
            let config = loaded?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }

        Commands::Install(args) => install(loaded?, args, cli.dry_run).await,

        Commands::Resolve(args) => resolve(loaded?, &args, cli.dry_run).await,

        Commands::Configure(args) => configure(loaded?, &args, cli.dry_run).await,

        Commands::Verify {
            auth_port,
            account_port,
        } => verify_listeners(loaded?, auth_port, account_port, cli.dry_run).await,

        Commands::Logs { filter, lines } => show_logs(loaded?, &filter, lines).await,
    }
}

/// File, then environment
fn load_config(path: &Path) -> anyhow::Result<InstallerConfig> {
    let config = InstallerConfig::load_or_default(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?
        .with_process_env();
    config.validate()?;
    Ok(config)
}

fn init_logging(cli: &Cli, logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let (writer, guard) = match &logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Log file has no name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(writer);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(guard)
}

/// Apply `--source`, `--tag`, `--artifact` and `--with-secondary`
fn apply_source_args(mut config: InstallerConfig, args: &SourceArgs) -> anyhow::Result<InstallerConfig> {
    if let Some(kind) = args.source {
        config.source.kind = kind;
    }
    if let Some(tag) = &args.tag {
        config.source.tag = Some(tag.clone());
        config.source.git_ref = Some(tag.clone());
    }
    if let Some(artifact) = &args.artifact {
        config.source.local_artifact = Some(artifact.clone());
        if args.source.is_none() {
            config.source.kind = SourceKind::Local;
        }
    }
    if args.with_secondary {
        config.artifacts.install_secondary = true;
    }
    config.validate()?;
    Ok(config)
}

/// Build the desired managed values from flags, prompting if asked
fn desired_config(args: &PluginArgs, config_path: &Path) -> Result<DesiredConfig, InstallError> {
    let defaults = DesiredConfig::default();
    let (current_auth, current_account) = plugin_config::existing_ports(config_path)
        .unwrap_or((defaults.auth_port, defaults.account_port));

    let auth_port = match &args.auth_port {
        Some(raw) => input::parse_port("authPort", raw)?,
        None => current_auth,
    };
    let account_port = match &args.account_port {
        Some(raw) => input::parse_port("accountPort", raw)?,
        None => current_account,
    };
    input::check_port_pair(auth_port, account_port)?;

    let number_threads = args
        .threads
        .as_deref()
        .map(|raw| input::parse_thread_count("numberThreads", raw))
        .transpose()?;

    let external_dictionary = args
        .external_dictionary
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string);

    let shared_secret = if args.prompt_secret {
        Some(input::prompt_secret(PROMPT_ATTEMPTS)?)
    } else {
        args.shared_secret.clone().map(SharedSecret::new).transpose()?
    };

    Ok(DesiredConfig {
        shared_secret,
        auth_port,
        account_port,
        external_dictionary,
        number_threads,
    })
}

/// Cancel `token` on Ctrl-C
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            trigger.cancel();
        }
    });
    token
}

async fn install(config: InstallerConfig, args: InstallArgs, dry_run: bool) -> anyhow::Result<()> {
    let config = apply_source_args(config, &args.source)?;
    let desired = desired_config(&args.plugin, &config.plugin_config_path)?;
    let source = ArtifactSource::from_config(&config)?;

    let runner = SystemRunner::new(dry_run);
    let releases = GithubReleases::new(&config.source, &config.fetch)?;
    let host = SystemdKeycloak::new(&runner, &config);

    let options = RunOptions {
        preflight: true,
        skip_packages: args.skip_packages,
        rollback: config.rollback_on_failure && !args.no_rollback,
        force_restart: args.force_restart,
    };

    if dry_run {
        println!("[DRY RUN] No files will be written and no commands executed");
    }

    let report = Reconciler::new(&config, &runner, &releases, &host)
        .with_options(options)
        .with_cancellation(cancel_on_interrupt())
        .reconcile(
            &desired,
            &source,
            &config.providers_dir(),
            &config.plugin_config_path,
        )
        .await?;

    print_report(&report, &config);
    Ok(())
}

fn print_report(report: &ReconcileReport, config: &InstallerConfig) {
    let prefix = if report.dry_run { "[DRY RUN] " } else { "" };

    println!("{}Plugin source: {}", prefix, report.origin);
    for artifact in &report.artifacts {
        println!("  Artifact: {}", artifact);
    }
    println!(
        "  Providers: {} ({})",
        config.providers_dir().display(),
        if report.providers_changed { "updated" } else { "unchanged" }
    );
    for path in &report.removed {
        println!("  Removed: {}", path.display());
    }

    let change = match report.config_change {
        ConfigChange::Create => "created",
        ConfigChange::Update => "updated",
        ConfigChange::Unchanged => "unchanged",
    };
    println!(
        "  Configuration: {} ({})",
        config.plugin_config_path.display(),
        change
    );

    match report.secret_origin {
        SecretOrigin::Supplied => println!("  Shared secret: as supplied"),
        SecretOrigin::Existing => println!("  Shared secret: kept from existing configuration"),
        SecretOrigin::Generated => println!(
            "  Shared secret: generated; read it from {} and configure it on every RADIUS client",
            config.plugin_config_path.display()
        ),
    }

    if report.restarted {
        println!("  Service: {} rebuilt and restarted", config.service.name);
    } else {
        println!("  Service: not restarted");
    }

    for warning in &report.verification.warnings {
        println!("  Warning: {}", warning);
    }
}

async fn resolve(config: InstallerConfig, args: &SourceArgs, dry_run: bool) -> anyhow::Result<()> {
    let config = apply_source_args(config, args)?;
    let source = ArtifactSource::from_config(&config)?;

    let runner = SystemRunner::new(dry_run);
    let releases = GithubReleases::new(&config.source, &config.fetch)?;
    let host = SystemdKeycloak::new(&runner, &config);

    let names = Reconciler::new(&config, &runner, &releases, &host)
        .plan_artifacts(&source)
        .await?;

    for name in names {
        println!("{}", name);
    }
    Ok(())
}

async fn configure(config: InstallerConfig, args: &PluginArgs, dry_run: bool) -> anyhow::Result<()> {
    let desired = desired_config(args, &config.plugin_config_path)?;

    let runner = SystemRunner::new(dry_run);
    let releases = GithubReleases::new(&config.source, &config.fetch)?;
    let host = SystemdKeycloak::new(&runner, &config);

    let plan = Reconciler::new(&config, &runner, &releases, &host)
        .with_cancellation(cancel_on_interrupt())
        .configure(&desired, &config.plugin_config_path)
        .await?;

    let prefix = if dry_run { "[DRY RUN] " } else { "" };
    let action = match plan.change {
        ConfigChange::Create => "Created",
        ConfigChange::Update => "Updated",
        ConfigChange::Unchanged => "Unchanged",
    };
    println!("{}{}: {}", prefix, action, config.plugin_config_path.display());
    if plan.secret_origin == SecretOrigin::Generated {
        println!("A new shared secret was generated; it is stored in the file above.");
    }
    Ok(())
}

async fn verify_listeners(
    config: InstallerConfig,
    auth_port: Option<String>,
    account_port: Option<String>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let args = PluginArgs {
        auth_port,
        account_port,
        ..PluginArgs::default()
    };
    let desired = desired_config(&args, &config.plugin_config_path)?;

    let runner = SystemRunner::new(dry_run);
    let listeners = verify::radius_listeners(desired.auth_port, desired.account_port);
    let grace = std::time::Duration::from_secs(config.service.listener_grace_secs);
    let report = verify::probe(&runner, &listeners, grace).await;

    if report.skipped {
        println!("[DRY RUN] Listener probe skipped");
    } else if report.is_clean() {
        println!(
            "Listeners bound on UDP {} and {}",
            desired.auth_port, desired.account_port
        );
    }
    for warning in &report.warnings {
        println!("Warning: {}", warning);
    }
    Ok(())
}

async fn show_logs(config: InstallerConfig, filter: &str, lines: Option<u32>) -> anyhow::Result<()> {
    let runner = SystemRunner::new(false);
    let host = SystemdKeycloak::new(&runner, &config);
    let lines = lines.unwrap_or(config.service.log_lines);

    let matching = host
        .recent_logs(filter, lines)
        .await
        .with_context(|| format!("Failed to read logs of {}", config.service.name))?;

    if matching.is_empty() {
        info!(filter = %filter, "No matching log lines");
        println!("No log lines matching '{}' in the last {} entries", filter, lines);
    }
    for line in matching {
        println!("{}", line);
    }
    Ok(())
}

/// Initialize a new configuration file
fn init_config(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let default_config = r#"# SPDX-License-Identifier: AGPL-3.0-or-later
# kc-radius installer configuration

keycloak_home = "/opt/keycloak"
# providers_dir = "/opt/keycloak/providers"
plugin_config_path = "/config/radius.config"
lock_path = "/run/kc-radius/install.lock"
rollback_on_failure = true

[source]
kind = "release"
repository = "vzakharchenko/keycloak-radius-plugin"
# tag = "v1.4.12"
git_url = "https://github.com/vzakharchenko/keycloak-radius-plugin.git"
checkout_dir = "/var/cache/kc-radius/src"
build_command = "mvn -B -q -DskipTests package"
# local_artifact = "/tmp/radius-plugin.jar"

[artifacts]
primary_pattern = '^radius-plugin-.*\.jar$'
secondary_pattern = '^rad-sec-plugin-.*\.jar$'
install_secondary = false

[packages]
# manager = "apt"
names = ["curl", "unzip", "git", "maven", "iproute2"]

[service]
name = "keycloak"
listener_grace_secs = 10

[fetch]
retries = 3
backoff_ms = 500
timeout_secs = 60

[logging]
level = "info"
format = "text"
# file = "/var/log/kc-radius.log"
"#;

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(config_path, default_config)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    info!("Created configuration file: {}", config_path.display());
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["kc-radius", "version"]).unwrap();
        match cli.command {
            Commands::Version => {}
            _ => panic!("Expected Version command"),
        }
    }

    #[test]
    fn test_cli_install_command() {
        let cli = Cli::try_parse_from([
            "kc-radius",
            "--dry-run",
            "install",
            "--tag",
            "v1.4.12",
            "--auth-port",
            "11812",
            "--with-secondary",
            "--skip-packages",
        ])
        .unwrap();
        assert!(cli.dry_run);
        match cli.command {
            Commands::Install(args) => {
                assert_eq!(args.source.tag.as_deref(), Some("v1.4.12"));
                assert_eq!(args.plugin.auth_port.as_deref(), Some("11812"));
                assert!(args.source.with_secondary);
                assert!(args.skip_packages);
                assert!(!args.no_rollback);
            }
            _ => panic!("Expected Install command"),
        }
    }

    #[test]
    fn test_cli_non_numeric_port_reaches_validation() {
        let cli = Cli::try_parse_from(["kc-radius", "configure", "--auth-port", "abc"]).unwrap();
        match cli.command {
            Commands::Configure(args) => {
                let error = desired_config(&args, Path::new("/nonexistent/radius.config"))
                    .unwrap_err();
                assert!(matches!(error, InstallError::InvalidInput { ref field, .. } if field == "authPort"));
            }
            _ => panic!("Expected Configure command"),
        }
    }

    #[test]
    fn test_cli_source_value_enum() {
        let cli = Cli::try_parse_from(["kc-radius", "resolve", "--source", "git"]).unwrap();
        match cli.command {
            Commands::Resolve(args) => assert_eq!(args.source, Some(SourceKind::Git)),
            _ => panic!("Expected Resolve command"),
        }
        assert!(Cli::try_parse_from(["kc-radius", "resolve", "--source", "svn"]).is_err());
    }

    #[test]
    fn test_secret_flags_conflict() {
        assert!(Cli::try_parse_from([
            "kc-radius",
            "install",
            "--shared-secret",
            "abc",
            "--prompt-secret"
        ])
        .is_err());
    }

    #[test]
    fn test_artifact_implies_local_source() {
        let args = SourceArgs {
            artifact: Some(PathBuf::from("/tmp/radius-plugin-1.2.jar")),
            ..SourceArgs::default()
        };
        let config = apply_source_args(InstallerConfig::default(), &args).unwrap();
        assert_eq!(config.source.kind, SourceKind::Local);
        assert_eq!(
            ArtifactSource::from_config(&config).unwrap(),
            ArtifactSource::Local {
                path: PathBuf::from("/tmp/radius-plugin-1.2.jar")
            }
        );
    }

    #[test]
    fn test_desired_config_defaults() {
        let desired =
            desired_config(&PluginArgs::default(), Path::new("/nonexistent/radius.config")).unwrap();
        assert_eq!(desired.auth_port, 1812);
        assert_eq!(desired.account_port, 1813);
        assert!(desired.shared_secret.is_none());
    }
}
