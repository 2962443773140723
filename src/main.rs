use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notifier::clock::{Clock, SystemClock};
use notifier::config::{self, Config, StoreBackend, TransportKind};
use notifier::directory::postgres::PgDirectory;
use notifier::dispatch::Dispatcher;
use notifier::errors::AppError;
use notifier::models::event::NotificationEvent;
use notifier::notification::log::LogTransport;
use notifier::notification::render::HtmlRenderer;
use notifier::notification::webhook::WebhookTransport;
use notifier::notification::Transport;
use notifier::store::memory::MemoryTokenStore;
use notifier::store::postgres::PgTokenStore;
use notifier::store::redis::RedisTokenStore;
use notifier::store::TokenStore;
use notifier::token::consumer::TokenConsumer;
use notifier::token::issuer::TokenIssuer;
use notifier::workflow::{ActionLinkHandler, PgWorkflowEffect};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "rbox-notifier"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    // Command output goes to stdout, so logs go to stderr.
    let json_logs = std::env::var("RBOX_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    let (json_layer, text_layer) = if json_logs {
        (Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "notifier=debug,rbox_notifier=debug".into()),
        ))
        .with(json_layer)
        .with(text_layer)
        .with(telemetry_layer)
        .init();

    let args = cli::Cli::parse();
    let cfg = config::load()?;

    let result = run(args.command, &cfg).await;
    opentelemetry::global::shutdown_tracer_provider();

    if let Err(e) = result {
        let body = serde_json::to_string(&e.to_body())?;
        eprintln!("{}", body);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: cli::Commands, cfg: &Config) -> Result<(), AppError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match command {
        cli::Commands::Migrate => {
            let db = PgTokenStore::connect(&cfg.database_url, cfg.store_timeout).await?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            println!("Migrations applied.");
        }
        cli::Commands::Dispatch { file } => {
            let body = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read event from stdin")?;
                    buf
                }
            };
            let event = NotificationEvent::from_json(&body)?;

            let pool = expense_db(cfg).await?;
            let store = build_store(cfg, Some(&pool)).await?;
            let dispatcher = Dispatcher::new(
                Arc::new(PgDirectory::new(pool, cfg.store_timeout)),
                TokenIssuer::new(store, clock, cfg.store_timeout),
                Arc::new(HtmlRenderer::default()),
                build_transport(cfg)?,
                cfg.app_url.clone(),
                cfg.token_ttl,
            );
            print_json(&dispatcher.dispatch(&event).await?)?;
        }
        cli::Commands::Consume { token, action } => {
            let consumer = TokenConsumer::new(build_store(cfg, None).await?, clock, cfg.store_timeout);
            print_json(&consumer.consume(&token, action).await?)?;
        }
        cli::Commands::Redeem { url } => {
            let pool = expense_db(cfg).await?;
            let store = build_store(cfg, Some(&pool)).await?;
            let consumer = TokenConsumer::new(store, clock, cfg.store_timeout);
            let handler = ActionLinkHandler::new(
                consumer,
                Arc::new(PgWorkflowEffect::new(pool, cfg.store_timeout)),
            );
            let redemption = handler.redeem(&url).await?;
            tracing::info!("{}", redemption.summary());
            print_json(&redemption)?;
        }
        cli::Commands::Status { token } => {
            let consumer = TokenConsumer::new(build_store(cfg, None).await?, clock, cfg.store_timeout);
            let status = consumer.status(&token).await?;
            print_json(&serde_json::json!({ "status": status }))?;
        }
        cli::Commands::Revoke { subject, principal } => {
            let consumer = TokenConsumer::new(build_store(cfg, None).await?, clock, cfg.store_timeout);
            let revoked = consumer.revoke(&subject, &principal).await?;
            print_json(&serde_json::json!({ "revoked": revoked }))?;
        }
    }
    Ok(())
}

/// The expense app's database: profiles, expenses, and (by default) tokens.
async fn expense_db(cfg: &Config) -> anyhow::Result<sqlx::PgPool> {
    tracing::debug!("Connecting to database...");
    let db = PgTokenStore::connect(&cfg.database_url, cfg.store_timeout).await?;
    Ok(db.pool().clone())
}

/// Build the configured token store, reusing `pool` for Postgres if given.
async fn build_store(
    cfg: &Config,
    pool: Option<&sqlx::PgPool>,
) -> anyhow::Result<Arc<dyn TokenStore>> {
    let store: Arc<dyn TokenStore> = match (cfg.store, pool) {
        (StoreBackend::Postgres, Some(pool)) => Arc::new(PgTokenStore::from_pool(pool.clone())),
        (StoreBackend::Postgres, None) => {
            tracing::debug!("Connecting to database...");
            Arc::new(PgTokenStore::connect(&cfg.database_url, cfg.store_timeout).await?)
        }
        (StoreBackend::Redis, _) => {
            tracing::debug!("Connecting to Redis...");
            Arc::new(RedisTokenStore::connect(&cfg.redis_url).await?)
        }
        (StoreBackend::Memory, _) => {
            tracing::warn!("using in-memory token store: tokens do not outlive this process");
            Arc::new(MemoryTokenStore::new())
        }
    };
    Ok(store)
}

fn build_transport(cfg: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match &cfg.transport {
        TransportKind::Log => Arc::new(LogTransport),
        TransportKind::Webhook {
            url,
            signing_secret,
        } => Arc::new(WebhookTransport::new(url, &cfg.mail_from, signing_secret.clone())?),
    };
    Ok(transport)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
