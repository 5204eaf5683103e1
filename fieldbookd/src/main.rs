use fieldbookd::daemon::{self, DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    ResetLocalData,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--reset-local-data" => mode = CliMode::ResetLocalData,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "fieldbookd=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: fieldbookd [--status | --reset-local-data]");
        println!("  --status             Print the local action queue and exit");
        println!("  --reset-local-data   Delete the local store (unsynced actions are lost) and exit");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    match mode {
        CliMode::Status => {
            print!("{}", daemon::status_report(&config.db_path).await?);
            Ok(())
        }
        CliMode::ResetLocalData => {
            let lost = daemon::reset_local_data(&config.db_path).await?;
            if lost > 0 {
                eprintln!("warning: {lost} unsynced action(s) were discarded");
            }
            println!("local data reset: {}", config.db_path.display());
            Ok(())
        }
        CliMode::Run | CliMode::Help => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await
        }
    }
}
