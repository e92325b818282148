use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use validation_core::{
    ledger::Ledger,
    lite::{pgledger::PgLedger, pgqueue::PgQueue},
};
use validation_orchestrator::{
    apptainer::ApptainerSandbox,
    config::OrchestratorConfig,
    migrate,
    serve::{self, Role},
    submit::{self, SubmitRequest},
};
use validation_prep::sda_client::SdaClient;

#[derive(Parser, Debug)]
#[command(name = "validation-orchestrator")]
#[command(about = "Runs validators over submitted files in isolated sandboxes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run state DB migrations.
    Migrate,

    /// Run the job preparation pool.
    Prepare,

    /// Run the job execution pool.
    Execute,

    /// Run both pools in one process.
    Run,

    /// Register a validation for a user's files and request its preparation.
    Submit {
        #[arg(long)]
        user: String,

        /// Who asked for the validation (defaults to the user).
        #[arg(long)]
        triggered_by: Option<String>,

        /// Validator id; repeat for several.
        #[arg(long = "validator", required = true)]
        validators: Vec<String>,

        /// File path as listed upstream; repeat for several.
        #[arg(long = "file", required = true)]
        files: Vec<String>,
    },

    /// Print the recorded results of a validation as JSON.
    Result {
        #[arg(long)]
        validation_id: String,

        /// Only rows submitted by this user.
        #[arg(long)]
        user: Option<String>,
    },

    /// Describe every configured validator image.
    Validators,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,validation_orchestrator=debug")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = OrchestratorConfig::from_env().context("load orchestrator config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Prepare => serve::run(&cfg, Role::Prepare).await,
        Command::Execute => serve::run(&cfg, Role::Execute).await,
        Command::Run => serve::run(&cfg, Role::All).await,
        Command::Submit {
            user,
            triggered_by,
            validators,
            files,
        } => {
            let db = migrate::connect(&cfg).await?;
            let req = SubmitRequest {
                triggered_by: triggered_by.unwrap_or_else(|| user.clone()),
                user,
                validator_ids: validators,
                file_paths: files,
            };
            let validation_id = submit::submit(
                &PgLedger::new(db.clone()),
                &PgQueue::new(db),
                &SdaClient::new(cfg.sda_api_url.clone(), cfg.sda_api_token.clone()),
                &cfg.preparation_queue,
                &req,
            )
            .await?;
            println!("{validation_id}");
            Ok(())
        }
        Command::Result {
            validation_id,
            user,
        } => {
            let ledger = PgLedger::new(migrate::connect(&cfg).await?);
            let result = ledger
                .read_validation_result(&validation_id, user.as_deref())
                .await?
                .ok_or_else(|| anyhow!("validation {validation_id} not found"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("encode validation result")?
            );
            Ok(())
        }
        Command::Validators => {
            let sandbox = ApptainerSandbox::from_config(&cfg);
            let registry = serve::load_registry(&cfg, &sandbox).await?;
            for descriptor in registry.iter() {
                println!(
                    "{}",
                    serde_json::json!({
                        "validator_id": descriptor.validator_id,
                        "name": descriptor.name,
                        "version": descriptor.version,
                        "mode": descriptor.mode,
                        "image": descriptor.image.display().to_string(),
                    })
                );
            }
            Ok(())
        }
    }
}
