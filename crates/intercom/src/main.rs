#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use eyre::Context as _;
use secrecy::ExposeSecret as _;
use serde_json::json;
use tracing_subscriber::prelude::*;

mod background;
mod cli_output;
mod config;
mod errors;
mod fsutil;
mod intercom;
mod keyring;
mod paths;
mod queue;
mod storage;

use intercom::{client::IntercomClient, transport::SocketTransport};

#[derive(Parser, Debug)]
#[command(name = "intercom", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background daemon that owns storage and the unlocked session.
    Daemon {
        /// Exit after this many seconds with no connected clients.
        #[arg(long)]
        idle_exit_seconds: Option<u64>,
    },

    /// Print resolved config/data/log paths as JSON.
    Paths,

    /// Print the wallet status and, when unlocked, its accounts.
    State,

    /// Create the wallet. Prints the generated recovery phrase once.
    Init {
        /// Restore from an existing recovery phrase instead of generating one.
        #[arg(long, default_value_t = false)]
        import: bool,
    },

    Unlock,

    Lock,

    #[command(subcommand)]
    Account(AccountCommand),

    /// Sign hex-encoded bytes with an account key.
    Sign { address: String, hex: String },

    /// Show the recovery phrase (requires the password).
    RevealMnemonic,

    /// Erase the wallet from this machine (requires the password).
    Reset,
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// Derive the next account from the recovery phrase.
    Create {
        #[arg(long)]
        name: Option<String>,
    },
    Rename { address: String, name: String },
    /// Remove an account (requires the password).
    Remove { address: String },
    RevealKey { address: String },
}

fn init_logging(paths: &paths::IntercomPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("intercom.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

async fn client(paths: &paths::IntercomPaths) -> eyre::Result<IntercomClient<SocketTransport>> {
    let cfg = config::ConfigStore::new(paths).load_or_init_default()?;
    let transport = intercom::transport::connect(paths, &cfg).await?;
    Ok(IntercomClient::new(transport))
}

async fn run_wallet_command(cmd: Command, paths: &paths::IntercomPaths) -> eyre::Result<()> {
    // Prompt before connecting, so a missing terminal fails without starting the daemon.
    let init_input = match &cmd {
        Command::Init { import } => {
            let mnemonic = if *import {
                Some(cli_output::read_mnemonic()?.expose_secret().to_owned())
            } else {
                None
            };
            Some((mnemonic, cli_output::read_password("New password: ", true)?))
        }
        Command::Daemon { .. }
        | Command::Paths
        | Command::State
        | Command::Unlock
        | Command::Lock
        | Command::Account(_)
        | Command::Sign { .. }
        | Command::RevealMnemonic
        | Command::Reset => None,
    };
    let c = client(paths).await?;
    match cmd {
        Command::State => cli_output::print_json(&c.state().await?),
        Command::Init { .. } => {
            let Some((mnemonic, pw)) = init_input else {
                eyre::bail!("init input missing");
            };
            let generated = c
                .new_wallet(pw.expose_secret().to_owned(), mnemonic)
                .await?;
            if let Some(phrase) = generated.as_deref() {
                cli_output::notice(
                    "Write down this recovery phrase. It is the only way to restore the wallet.",
                );
                cli_output::print_json(&json!({ "mnemonic": phrase }))?;
            }
            cli_output::print_json(&c.state().await?)
        }
        Command::Unlock => {
            let pw = cli_output::read_password("Password: ", false)?;
            c.unlock(pw.expose_secret().to_owned()).await?;
            cli_output::print_json(&c.state().await?)
        }
        Command::Lock => {
            c.lock().await?;
            cli_output::print_json(&c.state().await?)
        }
        Command::Account(sub) => match sub {
            AccountCommand::Create { name } => {
                cli_output::print_json(&c.create_account(name).await?)
            }
            AccountCommand::Rename { address, name } => {
                cli_output::print_json(&c.rename_account(address, name).await?)
            }
            AccountCommand::Remove { address } => {
                let pw = cli_output::read_password("Password: ", false)?;
                c.remove_account(address.clone(), pw.expose_secret().to_owned())
                    .await?;
                cli_output::print_json(&json!({ "removed": address }))
            }
            AccountCommand::RevealKey { address } => {
                let public_key = c.reveal_public_key(address.clone()).await?;
                cli_output::print_json(&json!({ "address": address, "public_key": public_key }))
            }
        },
        Command::Sign { address, hex } => {
            let signature = c.sign(address, hex).await?;
            cli_output::print_json(&json!({ "signature": signature }))
        }
        Command::RevealMnemonic => {
            let pw = cli_output::read_password("Password: ", false)?;
            let mnemonic = c.reveal_mnemonic(pw.expose_secret().to_owned()).await?;
            cli_output::print_json(&json!({ "mnemonic": mnemonic }))
        }
        Command::Reset => {
            let pw = cli_output::read_password("Password: ", false)?;
            c.reset(pw.expose_secret().to_owned()).await?;
            cli_output::notice("Wallet erased.");
            cli_output::print_json(&c.state().await?)
        }
        Command::Daemon { .. } | Command::Paths => {
            eyre::bail!("not a wallet command")
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = paths::IntercomPaths::discover()?;
    paths.ensure_private_dirs()?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Daemon { idle_exit_seconds } => intercom::server::run_daemon(idle_exit_seconds)
            .await
            .context("daemon failed"),
        Command::Paths => cli_output::print_json(&json!({
            "config_dir": paths.config_dir,
            "data_dir": paths.data_dir,
            "log_file": paths.log_file,
        })),
        cmd @ (Command::State
        | Command::Init { .. }
        | Command::Unlock
        | Command::Lock
        | Command::Account(_)
        | Command::Sign { .. }
        | Command::RevealMnemonic
        | Command::Reset) => run_wallet_command(cmd, &paths)
            .await
            .context("wallet command failed"),
    }
}
