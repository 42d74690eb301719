use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sor_bot::{App, BotConfig};
use sor_delivery::PostOutcome;

#[derive(Debug, Parser)]
#[command(name = "sor-cli")]
#[command(about = "Scholarship Opportunity Relay command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon: scheduled triggers plus the command loop.
    Run,
    /// Deliver the next opportunity for one category.
    Post {
        category: String,
        #[arg(long)]
        destination: Option<i64>,
    },
    /// Deliver one opportunity per configured category, in order.
    PostAll {
        #[arg(long)]
        destination: Option<i64>,
    },
    /// Retire expired rows without delivering anything.
    Sweep,
}

fn destination_or_default(app: &App, flag: Option<i64>) -> Result<i64> {
    flag.or(app.config.default_destination)
        .context("no destination: pass --destination or set GROUP_CHAT_ID")
}

fn describe(outcome: &PostOutcome) -> String {
    match outcome {
        PostOutcome::Delivered {
            position,
            title,
            recorded,
        } => format!(
            "delivered row {position} ({title}){}",
            if *recorded { "" } else { " [NOT RECORDED]" }
        ),
        PostOutcome::NoneAvailable => "nothing available".to_string(),
        PostOutcome::SendFailed { position, reason } => {
            format!("send failed for row {position}: {reason}")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BotConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            App::from_config(config)?.run().await?;
        }
        Commands::Post {
            category,
            destination,
        } => {
            let app = App::from_config(config)?;
            let destination = destination_or_default(&app, destination)?;
            let outcome = app.engine.post_next(&category, destination).await?;
            println!("post {category}: {}", describe(&outcome));
        }
        Commands::PostAll { destination } => {
            let app = App::from_config(config)?;
            let destination = destination_or_default(&app, destination)?;
            for report in app.engine.post_all(destination).await {
                match report.outcome {
                    Ok(outcome) => println!("post {}: {}", report.category, describe(&outcome)),
                    Err(err) => println!("post {}: failed: {err}", report.category),
                }
            }
        }
        Commands::Sweep => {
            let app = App::from_config(config)?;
            let swept = app.engine.sweep_now().await?;
            println!("sweep complete: {} expired rows retired", swept.len());
            for row in swept {
                println!("  row {} (deadline {})", row.position, row.deadline);
            }
        }
    }

    Ok(())
}
