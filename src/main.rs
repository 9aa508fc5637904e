use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::routing::get;
use axum::Router;
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod browser;
mod config;
mod error;
mod middleware;
mod push_sender;
mod routes;
mod session_issuer;
mod store;
mod workers;

use browser::{HeadlessBrowser, StubBrowser};
use config::Config;
use push_sender::{HttpWebPushSender, WebPushSender};
use store::Store;
use workers::{CrawlScheduler, PushDispatcher};

pub struct AppState {
    pub store: Arc<Store>,
    pub config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ad_watch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    tracing::info!("starting ad-watch");

    let store = Arc::new(Store::connect(&config).await?);

    let app_state = Arc::new(AppState {
        store: store.clone(),
        config: config.clone(),
    });

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // The HeadlessBrowser is out of core scope (core spec §1); a real
    // deployment swaps `StubBrowser` for a browser-automation backend
    // running on its own dedicated executor (core spec §5).
    let browser: Arc<dyn HeadlessBrowser> = Arc::new(StubBrowser);
    let crawl_scheduler = CrawlScheduler::new(store.clone(), browser, config.intervals.clone());
    {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            crawl_scheduler.run(shutdown_rx).await;
        });
    }

    let sender: Arc<dyn WebPushSender> = Arc::new(HttpWebPushSender::new(
        config.vapid.subject.clone(),
    )?);
    let push_dispatcher = PushDispatcher::new(store.clone(), sender, config.intervals.clone());
    {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            push_dispatcher.run(shutdown_rx).await;
        });
    }

    // Rate limit the public, unauthenticated session-creation endpoint
    // (core spec §9 identifier widening: session creation is the one
    // endpoint that needs no existing credential).
    let mut session_builder = GovernorConfigBuilder::default();
    session_builder.per_second(config.rate_limit.session_per_second.into());
    session_builder.burst_size(config.rate_limit.session_burst);
    session_builder.key_extractor(SmartIpKeyExtractor);
    session_builder.error_handler(|error: GovernorError| -> http::Response<Body> {
        match error {
            GovernorError::TooManyRequests { wait_time, headers } => {
                let body = serde_json::json!({ "error": "rate_limit_exceeded" }).to_string();
                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::OK;
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                resp.headers_mut().insert(
                    http::header::RETRY_AFTER,
                    HeaderValue::from_str(&wait_time.to_string()).unwrap(),
                );
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp
            }
            GovernorError::UnableToExtractKey => {
                let body = serde_json::json!({ "error": "unable to determine client IP" }).to_string();
                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::OK;
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                resp
            }
            GovernorError::Other { code, msg, headers } => {
                let body = serde_json::json!({ "error": msg.unwrap_or_default() }).to_string();
                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() =
                    StatusCode::from_u16(code.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp
            }
        }
    });

    let session_gov_conf = Arc::new(
        session_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("failed to build session governor config"))?,
    );

    {
        let limiter = session_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            limiter.retain_recent();
        });
    }

    let session_rate_layer = GovernorLayer {
        config: session_gov_conf.clone(),
    };

    let asset_dir = config.server.asset_dir.clone();
    let index_path = format!("{asset_dir}/index.html");

    let api_router = routes::api::create_session_router()
        .layer(session_rate_layer)
        .merge(routes::api::router());

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route_service("/", tower_http::services::ServeFile::new(index_path))
        .nest("/api", api_router)
        .fallback_service(ServeDir::new(asset_dir))
        .with_state(app_state.clone())
        .layer(axum::middleware::from_fn(middleware::csp::csp_middleware))
        .layer(TraceLayer::new_for_http());

    let host = config.server.host.clone();
    let port = config.server.port;
    let addr = format!("{host}:{port}");

    tracing::info!("server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await?;

    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());
}
