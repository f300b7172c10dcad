use clap::Parser;
use dockhand::{run_cli, Cli};
use dockhand_models::DockhandError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run_cli(cli).await {
        match err.downcast_ref::<DockhandError>() {
            Some(build_err) => eprintln!("error [{}]: {}", build_err.phase(), build_err),
            None => eprintln!("error: {err:#}"),
        }
        std::process::exit(1);
    }
}
