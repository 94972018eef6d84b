//! Application layer - process lifecycle
//!
//! `setup` loads configuration and wires the components, `run` serves until
//! the shutdown token fires, and `shutdown` waits a bounded time for the
//! background tasks to finish.

use crate::config::{Config, ConfigError, LogConfig};
use crate::domain::CallQueue;
use crate::infrastructure::protocols::sip::{
    Proxy, SipError, TrunkRegistrant, UdpClientTransport,
};
use crate::interface::api::{build_router, ApiState};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Sip(#[from] SipError),

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Map the integer log severity onto a filter directive.
///
/// -4 is debug, 0 info, 4 warn and 8 error; anything below -4 enables trace.
pub fn log_directive(level: i32) -> &'static str {
    match level {
        i32::MIN..=-5 => "trace",
        -4..=-1 => "debug",
        0..=3 => "info",
        4..=7 => "warn",
        _ => "error",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(log: &LogConfig) -> Result<Option<WorkerGuard>, AppError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directive(log.level)));

    match &log.file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| AppError::Setup(format!("log.file {} has no file name", path.display())))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| AppError::Setup(e.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| AppError::Setup(e.to_string()))?;
            Ok(None)
        }
    }
}

pub struct App {
    config: Config,
    queue: Arc<CallQueue>,
    proxy: Proxy,
    trunk: Option<Arc<TrunkRegistrant>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    log_guard: Option<WorkerGuard>,
}

impl App {
    /// Load configuration from `config_dir`, start logging and build components
    pub async fn setup(
        config_dir: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<Self, AppError> {
        let config = Config::load(config_dir)?;
        let log_guard = init_logging(&config.log)?;
        Self::with_config(config, cancel, log_guard).await
    }

    /// Build components from an already loaded configuration
    pub async fn with_config(
        config: Config,
        cancel: CancellationToken,
        log_guard: Option<WorkerGuard>,
    ) -> Result<Self, AppError> {
        let queue = Arc::new(CallQueue::with_capacity(config.sip.max_waiting));
        let proxy = Proxy::new(config.proxy_config()?, queue.clone()).await;
        info!(
            "Call queue ready (max {} waiting), {} SIP users",
            config.sip.max_waiting,
            config.sip.users.len()
        );

        let trunk = match &config.trunk {
            Some(settings) => {
                let transport = UdpClientTransport::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
                info!("Trunk registration configured for {}", settings.proxy_addr);
                Some(Arc::new(TrunkRegistrant::new(
                    Arc::new(transport),
                    settings.credentials(),
                    settings.destination()?,
                    settings.trunk_config(),
                )))
            }
            None => None,
        };

        Ok(Self {
            config,
            queue,
            proxy,
            trunk,
            cancel,
            tasks: Vec::new(),
            log_guard,
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.config.shutdown_timeout()
    }

    pub fn queue(&self) -> &Arc<CallQueue> {
        &self.queue
    }

    /// Serve until the cancellation token fires
    pub async fn run(&mut self) -> Result<(), AppError> {
        let http_addr = self.config.http_addr()?;
        let listener = TcpListener::bind(http_addr)
            .await
            .map_err(|source| AppError::Bind {
                addr: http_addr,
                source,
            })?;

        self.proxy.start(self.cancel.clone()).await?;

        if let Some(mut errors) = self.proxy.take_errors() {
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        err = errors.recv() => match err {
                            Some(err) => error!("SIP proxy failure: {}", err),
                            None => break,
                        },
                    }
                }
            }));
        }

        if let Some(trunk) = &self.trunk {
            let trunk = trunk.clone();
            let cancel = self.cancel.clone();
            self.tasks
                .push(tokio::spawn(async move { trunk.run(cancel).await }));
        }

        info!("Starting backend API server on {}", http_addr);
        let app = build_router(ApiState {
            calls: self.proxy.calls().clone(),
        });
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("API server error: {}", e);
            }
        }));

        self.cancel.cancelled().await;
        Ok(())
    }

    /// Stop everything, waiting at most `timeout` for tasks to drain
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), AppError> {
        self.cancel.cancel();
        self.proxy.stop();

        let tasks = std::mem::take(&mut self.tasks);
        let proxy = &self.proxy;
        let drain = async move {
            let results = futures::future::join_all(tasks).await;
            proxy.drain().await;
            results
        };
        let results = tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| AppError::ShutdownTimeout(timeout))?;
        for result in results {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Shutdown completed");
        // Flushes the file writer
        drop(self.log_guard.take());
        Ok(())
    }
}
