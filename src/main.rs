use clap::Parser;
use k_backup_pipe::backup::backup_config::BackupConfig;
use k_backup_pipe::backup::logging::{init_tracing, RunLog};
use k_backup_pipe::backup::orchestrator::{Orchestrator, RunReport};
use k_backup_pipe::backup::result_error::result::Result;
use k_backup_pipe::backup::signal::CancelToken;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info};

/// Back up one project: archive, dump, compress, encrypt, upload, prune
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
}

fn run(args: &Args, run_log: &RunLog) -> Result<RunReport> {
    let config = BackupConfig::load(&args.config)?;

    let cancel = CancelToken::default();
    cancel.install_signal_handler()?;

    Orchestrator::builder()
        .config(&config)
        .notifier(config.notifier()?)
        .cancel(cancel)
        .run_log(run_log.clone())
        .build()
        .run()
}

fn main() {
    let args = Args::parse();
    let run_log = RunLog::new();
    if let Err(e) = init_tracing(&run_log) {
        eprintln!("{e}");
    }

    match run(&args, &run_log) {
        Ok(report) => {
            info!("Backup written to {:?}", report.run_dir());
            exit(0);
        }
        Err(e) => {
            error!("{e}");
            exit(e.exit_code());
        }
    }
}
