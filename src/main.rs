//! Binary entry point for the prevue CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use serde::Serialize;
use serde_json::{Map, Value};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use prevue::backend::DeleteOptions;
use prevue::compose::{ComposeError, ComposeProject};
use prevue::config::{ConfigError, ExecConfig, PrevueConfig, TunnelConfig};
use prevue::driver::{DeletionReport, MachineDriver, ProjectContext};
use prevue::environment::{EnvironmentOrchestrator, UpError, UpRequest};
use prevue::error::DriverError;
use prevue::exec::{ExecError, ExecutionRequest, ExecutionResult, ExecutionRouter, InteractiveExec};
use prevue::resource::{EnvironmentId, ResourceKinds, ResourceRow, SizingHints};
use prevue::telemetry::TelemetrySink;
use prevue::tunnel::{ServicePort, SessionRegistry, TunnelClient, TunnelError, TunnelSession};

mod cli;

use cli::{
    Cli, Command, DownCommand, EnvironmentArgs, ExecCommand, KindArgs, LsCommand, OutputFormat,
    PurgeCommand, SnapshotCommand, UpCommand,
};

const TELEMETRY_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Up(#[from] UpError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error("{failed} deletion(s) failed")]
    PartialDeletion { failed: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        Self::Output(err.to_string())
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PREVUE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = PrevueConfig::load_without_cli_args()?;
    config.validate()?;
    let telemetry = TelemetrySink::from_config(&config);
    let mut properties = Map::new();
    properties.insert(String::from("driver"), Value::from(config.driver.clone()));
    telemetry.capture(command_name(&cli.command), properties);

    let result = run(cli, &config).await;
    telemetry.shutdown(TELEMETRY_GRACE).await;
    result
}

const fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Up(_) => "up",
        Command::Down(_) => "down",
        Command::Ls(_) => "ls",
        Command::Purge(_) => "purge",
        Command::Exec(_) => "exec",
        Command::Snapshot(_) => "snapshot",
    }
}

async fn run(cli: Cli, config: &PrevueConfig) -> Result<i32, CliError> {
    let driver = MachineDriver::from_config(config)?;
    let format = cli.output;
    match cli.command {
        Command::Up(args) => up(driver, args, format).await,
        Command::Down(args) => down(driver, &args, format).await,
        Command::Ls(args) => ls(&driver, &args, format).await,
        Command::Purge(args) => purge(&driver, &args, format).await,
        Command::Exec(args) => exec(&driver, args, format).await,
        Command::Snapshot(args) => snapshot(&driver, &args, format).await,
    }
}

fn current_dir() -> Result<Utf8PathBuf, CliError> {
    let cwd = std::env::current_dir().map_err(|err| CliError::Config(err.to_string()))?;
    Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| CliError::Config(format!("non UTF-8 working directory: {}", path.display())))
}

fn load_compose(dir: &Utf8Path, explicit: Option<&str>) -> Result<Option<ComposeProject>, CliError> {
    let path = match explicit {
        Some(path) => Some(Utf8PathBuf::from(path)),
        None => ComposeProject::locate(dir),
    };
    path.map(|found| ComposeProject::load(&found))
        .transpose()
        .map_err(CliError::from)
}

/// Resolves the environment id. Without a compose file there is no project
/// to derive a name from, so detection falls back to live machines.
async fn resolve(
    driver: &MachineDriver,
    args: &EnvironmentArgs,
) -> Result<(EnvironmentId, Option<ComposeProject>), CliError> {
    let cwd = current_dir()?;
    let compose = load_compose(&cwd, args.compose_file.as_deref())?;
    let context = compose.as_ref().map_or_else(ProjectContext::default, |project| {
        ProjectContext::discover(&cwd, project.name.clone(), args.include_branch)
    });
    let environment_id = driver
        .resolve_environment_id(args.id.as_deref(), &context)
        .await?;
    Ok((environment_id, compose))
}

fn parse_port_flag(raw: &str) -> Result<ServicePort, CliError> {
    let invalid = || CliError::InvalidArgument(format!("expected SERVICE:PORT, got '{raw}'"));
    let (service, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().ok().filter(|port| *port != 0).ok_or_else(invalid)?;
    if service.trim().is_empty() {
        return Err(invalid());
    }
    Ok(ServicePort::new(service.trim(), port))
}

async fn up(driver: MachineDriver, args: UpCommand, format: OutputFormat) -> Result<i32, CliError> {
    let (environment_id, compose) = resolve(&driver, &args.environment).await?;
    let mut ports = compose.map(|project| project.ports).unwrap_or_default();
    for raw in &args.ports {
        ports.push(parse_port_flag(raw)?);
    }
    ports.sort();
    ports.dedup();

    let router = ExecutionRouter::new(ExecConfig::load_without_cli_args()?)?;
    let tunnel_config = TunnelConfig::load_without_cli_args()?;
    let exposes_ports = tunnel_config.relay_url.is_some() && !ports.is_empty();
    if args.detach && exposes_ports {
        return Err(CliError::InvalidArgument(String::from(
            "--detach cannot be combined with a relay: the tunnel lives in this process, \
             so its URLs would stop working as soon as it exits",
        )));
    }
    let mut orchestrator = EnvironmentOrchestrator::new(driver, router);
    if tunnel_config.relay_url.is_some() {
        let client = TunnelClient::new(&tunnel_config)?;
        orchestrator = orchestrator.with_tunnel(client, tunnel_config.target_host.clone());
    }

    let outcome = orchestrator
        .up(UpRequest {
            environment_id: Some(environment_id),
            sizing: SizingHints {
                instance_type: args.instance_type,
                image: args.image,
            },
            ports,
            setup_commands: args.setup,
        })
        .await?;

    let urls: Vec<UrlView> = outcome
        .urls()
        .into_iter()
        .map(|((service, port), url)| UrlView { service, port, url })
        .collect();
    let mut out = io::stdout().lock();
    match format {
        OutputFormat::Json => write_json(&mut out, &UpView {
            environment_id: outcome.environment_id.as_str(),
            machine_id: &outcome.machine.id,
            urls: &urls,
        })?,
        OutputFormat::Text => {
            writeln!(
                out,
                "environment {} is up on machine {}",
                outcome.environment_id, outcome.machine.id
            )?;
            for view in &urls {
                writeln!(out, "{}:{}\t{}", view.service, view.port, view.url)?;
            }
        }
    }
    out.flush()?;
    drop(out);

    let Some(session) = outcome.session else {
        return Ok(0);
    };
    let registry = SessionRegistry::from_config(&tunnel_config);
    hold_tunnel(session, &registry, &outcome.environment_id).await?;
    Ok(0)
}

/// Keeps the tunnel open until Ctrl-C, a `down` from another shell, or
/// the session failing for good.
async fn hold_tunnel(
    mut session: TunnelSession,
    registry: &SessionRegistry,
    environment_id: &EnvironmentId,
) -> Result<(), CliError> {
    let listener = registry.register(environment_id).await?;
    info!(environment = %environment_id, "tunnel open; press Ctrl-C or run `prevue down` to close it");
    let request = tokio::select! {
        ended = session.wait() => {
            listener.unregister();
            return ended.map_err(CliError::from);
        }
        request = listener.next_close() => Some(request),
        _ = tokio::signal::ctrl_c() => None,
    };
    let closed = session.close().await;
    listener.unregister();
    if let Some(pending) = request {
        pending.acknowledge().await;
    }
    closed.map_err(CliError::from)
}

fn close_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

async fn down(driver: MachineDriver, args: &DownCommand, format: OutputFormat) -> Result<i32, CliError> {
    let (environment_id, _compose) = resolve(&driver, &args.environment).await?;
    let router = ExecutionRouter::new(ExecConfig::load_without_cli_args()?)?;
    let tunnel_config = TunnelConfig::load_without_cli_args()?;
    let registry = SessionRegistry::from_config(&tunnel_config);
    if registry
        .request_close(&environment_id, tunnel_config.handshake_timeout())
        .await?
    {
        info!(environment = %environment_id, "tunnel closed before teardown");
    }
    let orchestrator = EnvironmentOrchestrator::new(driver, router);
    let options = DeleteOptions {
        wait: !args.no_wait,
        force: args.force,
    };
    let report = orchestrator.down(&environment_id, None, options).await?;
    write_report(&report, format)
}

const fn selected_kinds(args: &KindArgs) -> ResourceKinds {
    if args.all {
        return ResourceKinds::all();
    }
    ResourceKinds {
        machines: args.machines,
        snapshots: args.snapshots,
        key_pairs: args.key_pairs,
    }
}

async fn ls(driver: &MachineDriver, args: &LsCommand, format: OutputFormat) -> Result<i32, CliError> {
    let mut kinds = selected_kinds(&args.kinds);
    if kinds.is_empty() {
        kinds.machines = true;
    }
    let rows = driver.rows(kinds).await?;
    let mut out = io::stdout().lock();
    match format {
        OutputFormat::Json => write_json(&mut out, &rows)?,
        OutputFormat::Text => out.write_all(render_table(&rows).as_bytes())?,
    }
    out.flush()?;
    Ok(0)
}

async fn purge(
    driver: &MachineDriver,
    args: &PurgeCommand,
    format: OutputFormat,
) -> Result<i32, CliError> {
    let options = DeleteOptions {
        wait: !args.no_wait,
        force: args.force,
    };
    let report = driver.purge(selected_kinds(&args.kinds), options).await?;
    write_report(&report, format)
}

async fn exec(driver: &MachineDriver, args: ExecCommand, format: OutputFormat) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let (environment_id, _compose) = resolve(driver, &args.environment).await?;
    let (_machine, params) = driver.connection_params(&environment_id).await?;
    let router = ExecutionRouter::new(ExecConfig::load_without_cli_args()?)?;
    let command = render_remote_command(&args.command);
    let timeout = args.timeout.map(Duration::from_secs);

    if !args.batch {
        let cancel = CancellationToken::new();
        close_on_interrupt(cancel.clone());
        let request = ExecutionRequest::Interactive(InteractiveExec {
            command,
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            cancel,
            timeout,
        });
        return Ok(router.execute(&params, request).await?.exit_code());
    }

    let mut request = ExecutionRequest::batch(command);
    if let Some(limit) = timeout {
        request = request.with_timeout(limit);
    }
    let (exit_code, output) = match router.execute(&params, request).await? {
        ExecutionResult::Batch { exit_code, output } => (exit_code, output),
        ExecutionResult::Interactive { exit_code } => return Ok(exit_code),
    };
    let mut out = io::stdout().lock();
    match format {
        OutputFormat::Json => write_json(&mut out, &BatchView {
            exit_code,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
        })?,
        OutputFormat::Text => {
            out.write_all(&output.stdout)?;
            io::stderr().write_all(&output.stderr)?;
        }
    }
    out.flush()?;
    Ok(exit_code)
}

async fn snapshot(
    driver: &MachineDriver,
    args: &SnapshotCommand,
    format: OutputFormat,
) -> Result<i32, CliError> {
    let (environment_id, _compose) = resolve(driver, &args.environment).await?;
    let snapshot = driver.snapshot(&environment_id).await?;
    let mut out = io::stdout().lock();
    match format {
        OutputFormat::Json => write_json(&mut out, &snapshot)?,
        OutputFormat::Text => writeln!(out, "snapshot {} created for {environment_id}", snapshot.id)?,
    }
    out.flush()?;
    Ok(0)
}

#[derive(Serialize)]
struct UrlView {
    service: String,
    port: u16,
    url: String,
}

#[derive(Serialize)]
struct UpView<'a> {
    environment_id: &'a str,
    machine_id: &'a str,
    urls: &'a [UrlView],
}

#[derive(Serialize)]
struct BatchView {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

fn write_json(target: &mut impl Write, value: &impl Serialize) -> Result<(), CliError> {
    serde_json::to_writer_pretty(&mut *target, value)
        .map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(target)?;
    Ok(())
}

fn write_report(report: &DeletionReport, format: OutputFormat) -> Result<i32, CliError> {
    let mut out = io::stdout().lock();
    match format {
        OutputFormat::Json => write_json(&mut out, report)?,
        OutputFormat::Text => out.write_all(render_report(report).as_bytes())?,
    }
    out.flush()?;
    if report.failed.is_empty() {
        Ok(0)
    } else {
        Err(CliError::PartialDeletion {
            failed: report.failed.len(),
        })
    }
}

fn render_report(report: &DeletionReport) -> String {
    let mut text = String::new();
    for resource in &report.deleted {
        text.push_str(&format!("deleted {resource}\n"));
    }
    for failure in &report.failed {
        text.push_str(&format!("failed  {}: {}\n", failure.resource, failure.error));
    }
    for skipped in &report.skipped {
        text.push_str(&format!("skipped {}: {}\n", skipped.resource, skipped.reason));
    }
    text.push_str(&format!("{} resource(s) affected\n", report.affected()));
    text
}

fn render_table(rows: &[ResourceRow]) -> String {
    const HEADER: [&str; 6] = ["KIND", "ID", "ENVIRONMENT", "CREATED", "REGION", "STATUS"];
    let cells: Vec<[String; 6]> = rows
        .iter()
        .map(|row| {
            [
                row.kind.to_string(),
                row.id.clone(),
                row.environment_id.clone(),
                row.created_at.clone().unwrap_or_else(|| String::from("-")),
                row.region.clone(),
                row.status.clone(),
            ]
        })
        .collect();
    let mut widths = HEADER.map(str::len);
    for line in &cells {
        for (width, cell) in widths.iter_mut().zip(line) {
            *width = (*width).max(cell.len());
        }
    }
    let mut text = String::new();
    let header = HEADER.map(str::to_owned);
    for line in std::iter::once(&header).chain(&cells) {
        let padded: Vec<String> = line
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        text.push_str(padded.join("  ").trim_end());
        text.push('\n');
    }
    text
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    if args
        .iter()
        .any(|arg| arg.chars().any(|ch| ch.is_ascii_control()))
    {
        return Err(CliError::InvalidArgument(String::from(concat!(
            "command arguments must not contain control characters (ASCII ",
            "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
        ))));
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "prevue: {err}").ok();
}
