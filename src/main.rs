/*!
 * xingest CLI
 *
 * `xingest stage` builds per-session bundles from a source directory,
 * `xingest upload` sends staged bundles to the remote repository.
 * Settings come from `--config FILE` (TOML); explicit flags override them.
 */

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use tracing::{info, warn};

use xingest::{
    config::{AssociatedFilesConfig, Config, LogLevel, StageConfig, UploadConfig},
    core::{classify::Classifier, placement::LinkMode, run_stage, Bundler, LinkOrCopyPlacer},
    error::{IngestError, Result},
    logging,
    output::OutputWriter,
    upload::{package::PackagingMethod, ColumnSet, UploadOptions, Uploader, XnatClient},
};

#[derive(Parser)]
#[command(name = "xingest")]
#[command(version, about = "Stage clinical imaging acquisitions into session bundles and upload them", long_about = None)]
struct Cli {
    /// Logging level
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevelArg,

    /// Also write JSON logs to this file
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Path to a TOML config file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Group source files into one staged bundle per session
    Stage(StageArgs),

    /// Upload staged bundles to the remote repository
    Upload(UploadArgs),
}

#[derive(Args)]
struct StageArgs {
    /// Directory holding the primary acquisition files
    #[arg(value_name = "SOURCE_DIR")]
    source_dir: PathBuf,

    /// Root directory bundles are staged under
    #[arg(value_name = "STAGING_ROOT")]
    staging_root: PathBuf,

    /// Auxiliary file definition: logical type, glob template and regex with
    /// `id` and `resource` named groups (repeatable)
    #[arg(
        long = "associated-files",
        num_args = 3,
        value_names = ["TYPE", "GLOB", "PATTERN"],
        action = ArgAction::Append
    )]
    associated_files: Vec<String>,

    /// Subject naming template
    #[arg(long, value_name = "TEMPLATE")]
    subject: Option<String>,

    /// Session naming template
    #[arg(long, value_name = "TEMPLATE")]
    session: Option<String>,

    /// Project recorded in bundle manifests
    #[arg(long, env = "XINGEST_PROJECT")]
    project: Option<String>,

    /// Remove source files once their staged copies are verified
    #[arg(long = "delete")]
    delete: bool,

    /// Stop at the first failed session
    #[arg(long)]
    fail_fast: bool,

    /// Plan and check for conflicts without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Sessions staged in parallel (0 = available parallelism)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Always copy instead of hard linking
    #[arg(long)]
    copy: bool,

    /// Record SHA-256 digests of staged files in the manifest
    #[arg(long)]
    checksums: bool,
}

impl StageArgs {
    fn apply(&self, config: &mut StageConfig) -> Result<()> {
        if self.associated_files.len() % 3 != 0 {
            return Err(IngestError::Config(
                "--associated-files takes TYPE GLOB PATTERN".to_string(),
            ));
        }
        for spec in self.associated_files.chunks(3) {
            config.associated_files.push(AssociatedFilesConfig {
                logical_type: spec[0].clone(),
                glob: spec[1].clone(),
                pattern: spec[2].clone(),
            });
        }
        if let Some(subject) = &self.subject {
            config.subject_template = subject.clone();
        }
        if let Some(session) = &self.session {
            config.session_template = session.clone();
        }
        if self.project.is_some() {
            config.project = self.project.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.copy {
            config.link_mode = LinkMode::Copy;
        }
        config.delete_source |= self.delete;
        config.fail_fast |= self.fail_fast;
        config.dry_run |= self.dry_run;
        config.checksums |= self.checksums;
        Ok(())
    }
}

#[derive(Args)]
struct UploadArgs {
    /// Root directory holding staged bundles
    #[arg(value_name = "STAGING_ROOT")]
    staging_root: PathBuf,

    /// Repository base URL
    #[arg(long, env = "XINGEST_HOST")]
    server: Option<String>,

    #[arg(long, env = "XINGEST_USER")]
    user: Option<String>,

    #[arg(long, env = "XINGEST_PASS", hide_env_values = true)]
    password: Option<String>,

    /// Project overriding the one recorded in bundle manifests
    #[arg(long, env = "XINGEST_PROJECT")]
    project: Option<String>,

    /// TOML file with `[[columns]]` definitions
    #[arg(long, value_name = "FILE")]
    columns: Option<PathBuf>,

    /// Upload units of this logical type even without a matching column
    #[arg(long, value_name = "TYPE", action = ArgAction::Append)]
    always_include: Vec<String>,

    /// Abort the run at the first failed unit
    #[arg(long)]
    fail_fast: bool,

    /// Exit successfully even when some units failed
    #[arg(long)]
    allow_partial: bool,

    /// Archive format for transfer units
    #[arg(long, value_enum)]
    method: Option<MethodArg>,

    /// Seconds to wait before checking remote processing
    #[arg(long, value_name = "SECS")]
    wait_period: Option<u64>,

    /// Attempts per unit before it is marked failed
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,

    /// Bundles uploaded concurrently
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Delete each bundle once all of its units are uploaded or skipped
    #[arg(long)]
    remove: bool,
}

impl UploadArgs {
    fn apply(&self, config: &mut UploadConfig) {
        if self.server.is_some() {
            config.server = self.server.clone();
        }
        if self.user.is_some() {
            config.user = self.user.clone();
        }
        if let Some(password) = &self.password {
            config.password = Some(SecretString::new(password.clone().into_boxed_str()));
        }
        if self.project.is_some() {
            config.project = self.project.clone();
        }
        if self.columns.is_some() {
            config.columns_file = self.columns.clone();
        }
        config.always_include.extend(self.always_include.iter().cloned());
        if let Some(method) = self.method {
            config.packaging = method.into();
        }
        if let Some(secs) = self.wait_period {
            config.wait_period_secs = secs;
        }
        if let Some(n) = self.max_attempts {
            config.retry.max_attempts = n;
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        config.fail_fast |= self.fail_fast;
        config.remove_after_upload |= self.remove;
        if self.allow_partial {
            config.partial_failure_is_error = false;
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum MethodArg {
    Tar,
    TarGz,
}

impl From<MethodArg> for PackagingMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Tar => PackagingMethod::Tar,
            MethodArg::TarGz => PackagingMethod::TarGz,
        }
    }
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();
    let output = OutputWriter::new(cli.json);
    match execute(cli, &output) {
        Ok(code) => code,
        Err(e) => {
            output.error(&e.to_string());
            e.exit_code()
        }
    }
}

fn execute(cli: Cli, output: &OutputWriter) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if cli.log_level != LogLevelArg::Info {
        config.logging.level = cli.log_level.into();
    }
    if cli.log.is_some() {
        config.logging.log_file = cli.log.clone();
    }
    config.logging.verbose |= cli.verbose;
    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Stage(args) => handle_stage(args, config.stage, output),
        Commands::Upload(args) => handle_upload(args, config.upload, output),
    }
}

fn handle_stage(args: StageArgs, mut config: StageConfig, output: &OutputWriter) -> Result<i32> {
    args.apply(&mut config)?;
    config.validate()?;

    let extractor = config.extractor()?;
    let associated = config.associated()?;
    let classifier = classifier(&config)?;
    let bundler = Bundler::new(args.staging_root.clone(), config.stage_options())
        .with_placer(Arc::new(LinkOrCopyPlacer::new(config.link_mode)));

    info!(
        source = %args.source_dir.display(),
        staging_root = %args.staging_root.display(),
        dry_run = config.dry_run,
        "staging"
    );
    let summary = run_stage(
        &args.source_dir,
        classifier.as_ref(),
        &extractor,
        &associated,
        &bundler,
    )?;

    output.stage_summary(&summary);
    Ok(summary.exit_code())
}

#[cfg(feature = "dicom")]
fn classifier(config: &StageConfig) -> Result<Box<dyn Classifier>> {
    use xingest::core::DicomClassifier;
    Ok(Box::new(
        DicomClassifier::new().with_fields(config.extra_fields.clone()),
    ))
}

#[cfg(not(feature = "dicom"))]
fn classifier(_config: &StageConfig) -> Result<Box<dyn Classifier>> {
    Err(IngestError::Config(
        "built without the `dicom` feature; no acquisition classifier available".to_string(),
    ))
}

fn handle_upload(args: UploadArgs, mut config: UploadConfig, output: &OutputWriter) -> Result<i32> {
    args.apply(&mut config);
    config.validate()?;

    let columns = match &config.columns_file {
        Some(path) => ColumnSet::from_file(path, &config.always_include)?,
        None => ColumnSet::new(Vec::new(), &config.always_include)?,
    };
    if columns.is_empty() && config.always_include.is_empty() {
        warn!("no columns or always-include types configured, every unit will be skipped");
    }

    let server = config.server.clone().unwrap_or_default();
    let user = config.user.clone().unwrap_or_default();
    let password = config
        .password
        .take()
        .ok_or_else(|| IngestError::Config("credentials are required for upload".to_string()))?;
    let client = XnatClient::new(
        &server,
        &user,
        password,
        config.request_timeout(),
        config.connect_timeout(),
    )
    .map_err(|e| IngestError::Config(format!("cannot create client: {}", e)))?;

    let uploader = Uploader::new(Arc::new(client), columns, UploadOptions::from_config(&config));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let manifest = runtime.block_on(async {
        let cancel = uploader.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, letting in-flight transfers finish");
                cancel.cancel();
            }
        });
        uploader.run(&args.staging_root).await
    })?;

    output.upload_summary(&manifest);
    Ok(manifest.exit_code(config.partial_failure_is_error))
}
