use clap::Parser;
use npshell_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    npshell_cli::init_tracing();
    npshell_cli::run(cli).await
}
