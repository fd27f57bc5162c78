//! # credvault operator CLI
//!
//! Thin command-line caller of [`ConnectionService`] for operators: apply the
//! schema, fetch (and refresh) credentials, list or delete connections.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use credvault::{
    ApiError, ConnectionKey, ConnectionService, Credentials,
    config::ConfigLoader,
    db,
    providers::TemplateRegistry,
    telemetry::{self, TraceContext},
};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "credvault", version, about = "Encrypted OAuth credential manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Print a connection's credentials as JSON, refreshing them if needed
    Get(ConnectionArgs),
    /// Print only the access token of a connection
    Token(ConnectionArgs),
    /// List an account's connections (no secrets)
    List {
        #[arg(long)]
        account: Uuid,
    },
    /// Delete a connection
    Delete(ConnectionArgs),
    /// List the provider templates this deployment knows
    Templates,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    #[arg(long)]
    account: Uuid,
    #[arg(long = "provider-config-key")]
    provider_config_key: String,
    #[arg(long = "connection-id")]
    connection_id: String,
    /// Refresh even if the access token is still fresh
    #[arg(long, default_value_t = false)]
    refresh: bool,
}

impl ConnectionArgs {
    fn key(&self) -> ConnectionKey {
        ConnectionKey::new(
            self.account,
            self.provider_config_key.clone(),
            self.connection_id.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = ConfigLoader::new()
        .load()
        .context("Failed to load configuration")?;
    telemetry::init_tracing(&config).context("Failed to initialise tracing")?;
    tracing::debug!(config = %config.redacted_json()?, "Loaded configuration");

    if let Command::Templates = cli.command {
        let templates = TemplateRegistry::from_config(&config)?;
        for provider in templates.providers() {
            if let Some(template) = templates.get(provider) {
                println!("{}\t{}", template.name, template.auth_mode);
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let db = Arc::new(db::init_pool(&config).await?);
    if let Command::Migrate = cli.command {
        db::run_migrations(&db).await?;
        println!("Migrations applied");
        return Ok(ExitCode::SUCCESS);
    }

    let service = ConnectionService::from_config(&config, db)?;
    telemetry::with_trace_context(TraceContext::generate(), execute(&service, cli.command)).await
}

async fn execute(service: &ConnectionService, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Get(args) => {
            let fetched = match fetch(service, &args).await {
                Ok(fetched) => fetched,
                Err(error) => return print_error(error),
            };
            println!("{}", serde_json::to_string_pretty(&fetched)?);
        }
        Command::Token(args) => {
            let fetched = match fetch(service, &args).await {
                Ok(fetched) => fetched,
                Err(error) => return print_error(error),
            };
            match &fetched.connection.credentials {
                Credentials::OAuth2(credentials) => println!("{}", credentials.access_token),
                Credentials::OAuth1(credentials) => println!("{}", credentials.oauth_token),
            }
            if let Some(condition) = &fetched.condition {
                eprintln!("warning: {}", condition.code());
            }
        }
        Command::List { account } => {
            let connections = service.list_connections(account).await?;
            println!("{}", serde_json::to_string_pretty(&connections)?);
        }
        Command::Delete(args) => {
            let key = args.key();
            if !service.delete_connection(&key).await? {
                eprintln!("connection {key} not found");
                return Ok(ExitCode::FAILURE);
            }
            println!("Deleted {key}");
        }
        Command::Migrate | Command::Templates => {}
    }
    Ok(ExitCode::SUCCESS)
}

async fn fetch(
    service: &ConnectionService,
    args: &ConnectionArgs,
) -> Result<credvault::FetchedCredentials, ApiError> {
    service
        .get_credentials(
            args.account,
            &args.provider_config_key,
            &args.connection_id,
            args.refresh,
        )
        .await
        .map_err(ApiError::from)
}

fn print_error(error: ApiError) -> anyhow::Result<ExitCode> {
    eprintln!("{}", serde_json::to_string_pretty(&error)?);
    Ok(ExitCode::FAILURE)
}
