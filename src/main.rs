use std::future::Future;
use std::io::IsTerminal;
use std::sync::Arc;

use clap::Parser;

use cfdev::analytics::{self, Analytics, AnalyticsToggle, InquirePrompt, SpoolSink};
use cfdev::cache::fetch::HttpFetcher;
use cfdev::cli::{Cli, Command, OutputFormat};
use cfdev::config::{self, SystemConfig};
use cfdev::daemon::{self, DaemonRunner, ProcessDaemonRunner};
use cfdev::driver::{self, HostPlatform};
use cfdev::error::CfdevError;
use cfdev::lifecycle::{Collaborators, Lifecycle, StartOptions};
use cfdev::observer::{self, OutputMode};
use cfdev::provision::HttpProvisioner;
use cfdev::{logging, paths};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let mode = resolve_output_mode(cli.output);
    let file_log = logging::init(mode, cli.verbose);

    let sys_config = config::load_config(cli.config.as_deref(), paths::home_dir())?;

    if !matches!(cli.command, Command::Telemetry { .. }) {
        let log_path = paths::log_file(&sys_config.home);
        if let Err(e) = file_log.set_file(&log_path) {
            tracing::warn!(path = %log_path.display(), error = %e, "file logging disabled");
        }
    }
    tracing::debug!(home = %sys_config.home.display(), command = ?cli.command, "cfdev starting");

    match cli.command {
        Command::Analyticsd => analytics::daemon::run(&sys_config).await?,
        Command::Telemetry { on, off } => telemetry(&sys_config, on, off).await?,
        Command::Start {
            cpus,
            memory,
            no_provision,
        } => {
            let lc = build_lifecycle(&sys_config, mode, cli.quiet)?;
            let opts = StartOptions {
                cpus,
                memory_mb: memory,
                provision: !no_provision,
            };
            interruptible(&lc, lc.start(&opts)).await?;
        }
        Command::Stop => {
            let lc = build_lifecycle(&sys_config, mode, cli.quiet)?;
            interruptible(&lc, lc.stop()).await?;
        }
        Command::Destroy => {
            let lc = build_lifecycle(&sys_config, mode, cli.quiet)?;
            interruptible(&lc, lc.destroy()).await?;
        }
        Command::Provision => {
            let lc = build_lifecycle(&sys_config, mode, cli.quiet)?;
            interruptible(&lc, lc.provision()).await?;
        }
        Command::Download => {
            let lc = build_lifecycle(&sys_config, mode, cli.quiet)?;
            let report = interruptible(&lc, lc.download()).await?;
            let summary = match mode {
                OutputMode::Json => {
                    observer::json::download_summary(report.paths.len(), &report.pruned, report.bytes)
                }
                _ => observer::plain::download_summary(
                    report.paths.len(),
                    &report.pruned,
                    report.bytes,
                ),
            };
            println!("{summary}");
        }
    }

    Ok(())
}

/// Run a command body, turning Ctrl-C into an `Interrupted` error for the
/// step in progress. Dropping the body abandons any `.part` download.
async fn interruptible<T>(
    lc: &Lifecycle,
    body: impl Future<Output = Result<T, CfdevError>>,
) -> Result<T, CfdevError> {
    tokio::select! {
        result = body => result,
        _ = tokio::signal::ctrl_c() => {
            let stage = lc.current_stage();
            tracing::warn!(%stage, "interrupted");
            Err(CfdevError::Interrupted { stage })
        }
    }
}

fn build_lifecycle(
    sys_config: &SystemConfig,
    mode: OutputMode,
    quiet: bool,
) -> Result<Lifecycle, CfdevError> {
    let home = &sys_config.home;
    let daemons: Arc<dyn DaemonRunner> =
        Arc::new(ProcessDaemonRunner::new(paths::daemons_dir(home)));

    let toggle = AnalyticsToggle::load(&paths::toggle_file(home))?;
    let analytics = Arc::new(Analytics::new(
        toggle,
        Box::new(InquirePrompt),
        Arc::new(SpoolSink::new(paths::spool_file(home))),
        sys_config.analytics_timeout(),
    ));
    let analytics_daemon = match daemon::analytics_spec(sys_config) {
        Ok(spec) => Some(spec),
        Err(e) => {
            tracing::warn!(error = %e, "analytics daemon unavailable");
            None
        }
    };

    let platform = HostPlatform::current();
    tracing::debug!(?platform, "selecting driver");

    Ok(Lifecycle::new(
        sys_config,
        Collaborators {
            fetcher: Arc::new(HttpFetcher::default()),
            driver: driver::select_driver(platform, sys_config, daemons.clone()),
            provisioner: Box::new(HttpProvisioner::new(sys_config.config.provision.port)),
            daemons,
            analytics,
            observer: observer::make_observer(mode, quiet),
            analytics_daemon,
        },
    ))
}

async fn telemetry(sys_config: &SystemConfig, on: bool, off: bool) -> Result<(), CfdevError> {
    let mut toggle = AnalyticsToggle::load(&paths::toggle_file(&sys_config.home))?;
    if on {
        toggle.set_cf_analytics_enabled(true)?;
    } else if off {
        toggle.set_cf_analytics_enabled(false)?;
        let runner = ProcessDaemonRunner::new(paths::daemons_dir(&sys_config.home));
        runner.stop(daemon::ANALYTICS_LABEL).await?;
    }
    println!("{}", analytics::status_line(&toggle));
    Ok(())
}

fn resolve_output_mode(format: OutputFormat) -> OutputMode {
    match format {
        OutputFormat::Auto => {
            if std::io::stdout().is_terminal() && std::io::stderr().is_terminal() {
                OutputMode::Interactive
            } else {
                OutputMode::Plain
            }
        }
        OutputFormat::Interactive => OutputMode::Interactive,
        OutputFormat::Plain => OutputMode::Plain,
        OutputFormat::Json => OutputMode::Json,
    }
}
