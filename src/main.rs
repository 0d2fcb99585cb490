/*!
 * hive-proxy CLI - run commands and move files on hive nodes
 */

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use hive_proxy::{
    config::{default_hive_path, HiveConfig, LogFormat},
    error::{ProxyError, EXIT_FATAL, EXIT_REMOTE_FAILURE, EXIT_SUCCESS},
    logging, CommandArg, CommandBundle, CommandResponse, NodeProxy, OperationLog, RunOptions,
    SshSessionFactory, TransferOptions,
};

#[derive(Parser)]
#[command(name = "hive-proxy")]
#[command(version, about = "Run commands and move files on hive nodes over SSH", long_about = None)]
struct Cli {
    /// Hive file (defaults to ~/.config/hive-proxy/hive.toml)
    #[arg(long = "hive", value_name = "FILE", global = true)]
    hive: Option<PathBuf>,

    /// Node to operate on
    #[arg(short = 'n', long = "node", value_name = "NAME", global = true)]
    node: Option<String>,

    /// Log level
    #[arg(long = "log-level", value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write diagnostic logs to a file
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Folder for per-node operation logs
    #[arg(long = "oplog-dir", value_name = "DIR", global = true)]
    oplog_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevelArg {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevelArg::Error => "error",
            LogLevelArg::Warn => "warn",
            LogLevelArg::Info => "info",
            LogLevelArg::Debug => "debug",
            LogLevelArg::Trace => "trace",
        }
    }
}

#[derive(clap::Args)]
struct ExecArgs {
    /// Command to run
    command: String,

    /// Command arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Fault the node and exit non-zero when the command fails
    #[arg(long)]
    fault_on_error: bool,

    /// Hide the command line in logs and output
    #[arg(long)]
    redact: bool,

    /// Do not prepend the configured PATH
    #[arg(long)]
    no_remote_path: bool,
}

impl ExecArgs {
    fn options(&self) -> RunOptions {
        let mut options = RunOptions::default();
        options.fault_on_error = self.fault_on_error;
        options.redact = self.redact;
        options.no_remote_path = self.no_remote_path;
        options
    }

    fn command_args(&self) -> Vec<CommandArg> {
        self.args.iter().map(CommandArg::from).collect()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command as the login user
    Exec(ExecArgs),

    /// Run a command with sudo
    Sudo(ExecArgs),

    /// Upload a local file
    Upload {
        local: PathBuf,
        remote: String,

        /// Place the file with sudo
        #[arg(long)]
        elevated: bool,

        /// chmod mode applied after upload, e.g. 640
        #[arg(long)]
        mode: Option<String>,

        /// chown owner applied after upload, e.g. root:root
        #[arg(long)]
        owner: Option<String>,
    },

    /// Download a remote file
    Download {
        remote: String,
        local: PathBuf,

        /// Read the file with sudo
        #[arg(long)]
        elevated: bool,
    },

    /// Package a local folder and run a command inside it
    Bundle {
        /// Folder whose files are shipped
        dir: PathBuf,

        /// Entry command, relative to the bundle folder
        command: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Run with sudo
        #[arg(long)]
        elevated: bool,
    },

    /// Reboot the node
    Reboot {
        /// Return once the reboot is sent
        #[arg(long)]
        no_wait: bool,
    },

    /// Connect and report the node state
    Status,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<ProxyError>()
                .map(ProxyError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let hive_path = cli
        .hive
        .clone()
        .or_else(default_hive_path)
        .ok_or_else(|| anyhow!("no hive file given and no config folder available"))?;
    let mut hive = HiveConfig::from_file(&hive_path)
        .with_context(|| format!("loading {}", hive_path.display()))?;

    if let Some(level) = cli.log_level {
        hive.log.level = level.as_str().to_string();
    }
    if cli.log.is_some() {
        hive.log.file = cli.log.clone();
    }
    if cli.oplog_dir.is_some() {
        hive.log.operation_log_dir = cli.oplog_dir.clone();
    }

    if let Err(e) = logging::init_logging(&hive.log) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let name = match cli.node.as_deref() {
        Some(name) => name.to_string(),
        None if hive.nodes.len() == 1 => hive.nodes[0].identity.name.clone(),
        None => return Err(anyhow!("--node is required when the hive has several nodes")),
    };
    let definition = hive
        .node(&name)
        .ok_or_else(|| anyhow!("node '{}' is not in {}", name, hive_path.display()))?;

    let operation_log = match &hive.log.operation_log_dir {
        Some(dir) => {
            let extension = match hive.log.operation_log_format {
                LogFormat::Json => "jsonl",
                LogFormat::Text => "log",
            };
            OperationLog::to_file(
                &dir.join(format!("{}.{}", name, extension)),
                hive.log.operation_log_format,
            )?
        }
        None => OperationLog::discard(),
    };

    let mut proxy = NodeProxy::new(
        definition.identity.clone(),
        definition.credentials()?,
        hive.proxy.clone(),
        Arc::new(SshSessionFactory::new()),
    )
    .with_operation_log(operation_log);

    let code = match cli.command {
        Commands::Exec(exec) => {
            let response = proxy.run_command_with(exec.options(), &exec.command, &exec.command_args())?;
            print_response(&response)?
        }
        Commands::Sudo(exec) => {
            let response = proxy.sudo_command_with(exec.options(), &exec.command, &exec.command_args())?;
            print_response(&response)?
        }
        Commands::Upload {
            local,
            remote,
            elevated,
            mode,
            owner,
        } => {
            let data = std::fs::read(&local).with_context(|| format!("reading {}", local.display()))?;
            let options = TransferOptions {
                elevated,
                permissions: mode,
                owner,
                tab_stop: None,
            };
            proxy.upload_bytes(&remote, &data, &options)?;
            println!("{} -> {}:{} ({} bytes)", local.display(), name, remote, data.len());
            EXIT_SUCCESS
        }
        Commands::Download {
            remote,
            local,
            elevated,
        } => {
            let options = TransferOptions {
                elevated,
                ..Default::default()
            };
            let data = proxy.download_bytes(&remote, &options)?;
            std::fs::write(&local, &data).with_context(|| format!("writing {}", local.display()))?;
            println!("{}:{} -> {} ({} bytes)", name, remote, local.display(), data.len());
            EXIT_SUCCESS
        }
        Commands::Bundle {
            dir,
            command,
            args,
            elevated,
        } => {
            let args = args.iter().map(CommandArg::from).collect();
            let bundle = CommandBundle::from_directory(&dir, command, args)?;
            let response = if elevated {
                proxy.sudo_bundle(&bundle)?
            } else {
                proxy.run_bundle(&bundle)?
            };
            print_response(&response)?
        }
        Commands::Reboot { no_wait } => {
            proxy.reboot(!no_wait)?;
            println!("{}: {}", name, proxy.status());
            EXIT_SUCCESS
        }
        Commands::Status => {
            proxy.connect()?;
            println!("{}: {} ({})", name, proxy.state(), proxy.status());
            EXIT_SUCCESS
        }
    };

    proxy.disconnect();
    Ok(code)
}

fn print_response(response: &CommandResponse) -> anyhow::Result<i32> {
    let mut stdout = std::io::stdout().lock();
    if let Some(text) = response.output_text() {
        stdout.write_all(text.as_bytes())?;
    }
    stdout.flush()?;
    eprint!("{}", response.error_text());

    Ok(match response.exit_code() {
        0 => EXIT_SUCCESS,
        code if code > 0 => code,
        _ => EXIT_REMOTE_FAILURE,
    })
}
