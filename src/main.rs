use agentflow::cli::Cli;
use agentflow::settings::Settings;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;

    // Initialize logging
    cli.init_logging(&settings)?;

    // Execute command
    cli.execute(settings).await?;

    Ok(())
}
