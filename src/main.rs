use std::{process, sync::Arc};

use tokio::{sync::watch, try_join};
use tollgate::{
    application::{
        admission::Governor,
        error::AppError,
        quota::{DEFAULT_TOP_N, QuotaService},
        repos::{BucketsRepo, UsageRepo},
    },
    cache::{CacheConfig, ResponseCache},
    config,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, AdminState, PublicState},
        memory::MemoryRepositories,
        sweeper::Sweepers,
        telemetry,
    },
    util::clock::{Clock, SystemClock},
};
use tollgate_api_types::{PurgeResponse, UsageAnalyticsResponse};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Analytics(args) => run_analytics(settings, args).await,
        config::Command::PurgeUsage(_) => run_purge_usage(settings).await,
    }
}

/// Repositories selected by configuration.
struct Repositories {
    buckets: Arc<dyn BucketsRepo>,
    usage: Arc<dyn UsageRepo>,
    postgres: Option<Arc<PostgresRepositories>>,
}

async fn init_repositories(settings: &config::Settings) -> Result<Repositories, AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        warn!(
            target = "tollgate::bootstrap",
            "no database url configured; quota state is kept in memory"
        );
        let memory = Arc::new(MemoryRepositories::new());
        return Ok(Repositories {
            buckets: memory.clone(),
            usage: memory,
            postgres: None,
        });
    };

    let postgres = Arc::new(connect_postgres(database_url, settings).await?);
    Ok(Repositories {
        buckets: postgres.clone(),
        usage: postgres.clone(),
        postgres: Some(postgres),
    })
}

async fn connect_postgres(
    database_url: &str,
    settings: &config::Settings,
) -> Result<PostgresRepositories, AppError> {
    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(PostgresRepositories::new(pool))
}

fn build_quota(settings: &config::Settings, repos: &Repositories) -> Arc<QuotaService> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Arc::new(QuotaService::new(
        repos.buckets.clone(),
        repos.usage.clone(),
        settings.quota.policy.clone(),
        clock,
    ))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repos = init_repositories(&settings).await?;
    let quota = build_quota(&settings, &repos);

    let cache_config = CacheConfig::from(&settings.cache);
    let cache = Arc::new(ResponseCache::new(cache_config, Arc::new(SystemClock)));
    let governor = Governor::new(quota.clone(), cache.clone());

    let sweepers = Sweepers::spawn(
        cache,
        settings.cache.sweep_interval,
        quota,
        settings.quota.sweep_interval,
    );

    info!(
        target = "tollgate::bootstrap",
        public_addr = %settings.server.public_addr,
        admin_addr = %settings.server.admin_addr,
        storage = if repos.postgres.is_some() { "postgres" } else { "memory" },
        failure_policy = settings.quota.policy.failure_policy.as_str(),
        cache_enabled = settings.cache.enabled,
        governed_routes = settings.routes.len(),
        "starting tollgate"
    );

    let public_state = PublicState {
        governor: governor.clone(),
    };
    let admin_state = AdminState {
        governor,
        db: repos.postgres.clone(),
    };

    let result = serve_http(&settings, public_state, admin_state).await;
    sweepers.shutdown().await;
    result
}

async fn serve_http(
    settings: &config::Settings,
    public_state: PublicState,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let routes = http::RouteTable::new(settings.routes.clone());
    let public_router = http::build_public_router(public_state, routes);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!(target = "tollgate::bootstrap", "shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        wait_for_shutdown(shutdown_rx).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = async { try_join!(public_server, admin_server) } => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = deadline => {
            warn!(
                target = "tollgate::bootstrap",
                grace_secs = grace.as_secs(),
                "graceful shutdown timed out; dropping open connections"
            );
        }
    }

    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "tollgate::bootstrap", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "tollgate::bootstrap", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn offline_quota(settings: &config::Settings) -> Result<Arc<QuotaService>, AppError> {
    let database_url = settings.database.url.as_deref().ok_or_else(|| {
        AppError::unexpected("this command needs a database url (--database-url or TOLLGATE__DATABASE__URL)")
    })?;
    let postgres = Arc::new(connect_postgres(database_url, settings).await?);
    let repos = Repositories {
        buckets: postgres.clone(),
        usage: postgres.clone(),
        postgres: Some(postgres),
    };
    Ok(build_quota(settings, &repos))
}

async fn run_analytics(
    settings: config::Settings,
    args: config::AnalyticsArgs,
) -> Result<(), AppError> {
    if args.days == 0 {
        return Err(AppError::unexpected("--days must be at least 1"));
    }
    let top = if args.top == 0 { DEFAULT_TOP_N } else { args.top };

    let quota = offline_quota(&settings).await?;
    let report: UsageAnalyticsResponse = quota.analytics(args.days, top).await?.into();
    print_json(&report)
}

async fn run_purge_usage(settings: config::Settings) -> Result<(), AppError> {
    let quota = offline_quota(&settings).await?;
    let removed = quota.purge_expired_usage().await?;
    print_json(&PurgeResponse { removed })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
