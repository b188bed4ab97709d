use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;

use mail_import::config::ImportConfig;
use mail_import::mailbox::read_mailbox_list;
use mail_import::run_import;

#[derive(Parser, Debug)]
#[command(
    name = "mail-import",
    about = "Import mailbox archives into a relational mail store"
)]
struct Args {
    /// TOML configuration file.
    config: PathBuf,

    /// File listing one mailbox name per line.
    mailbox_list: PathBuf,

    /// Maximum number of mailboxes imported concurrently.
    #[arg(long)]
    threads: Option<usize>,

    /// Import into an in-memory store instead of the database.
    #[arg(long)]
    dry_run: bool,
}

fn init_logger(filter: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(filter)).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match ImportConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            init_logger("info");
            log::error!("{}", err);
            return ExitCode::from(2);
        }
    };
    init_logger(config.log_filter());

    if let Some(threads) = args.threads {
        config.max_concurrent_mailboxes = threads.max(1);
    }
    log::info!(
        "configuration: mail_root={}, workers={}, autocommit={}, ignorable codes={:?}",
        config.mail_root.display(),
        config.max_concurrent_mailboxes,
        config.autocommit,
        config.ignorable_error_codes
    );

    let names = match read_mailbox_list(&args.mailbox_list) {
        Ok(names) => names,
        Err(err) => {
            log::error!("{}", err);
            return ExitCode::from(2);
        }
    };

    match run_import(&config, &names, args.dry_run).await {
        Ok(summary) => {
            println!("{}", summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{}", err);
            ExitCode::from(2)
        }
    }
}
