mod broadcast;
mod core;
mod effect;
mod engine;
mod http;
mod input;
mod mixer;
mod mpv;
mod resolver;
mod warmup;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tuner_proto::config::Config;
use tuner_proto::platform;
use tuner_proto::store::JsonStore;

use crate::broadcast::StateBroadcaster;
use crate::core::{ControllerConfig, Library, PlaybackController};
use crate::engine::MpvEngine;
use crate::mixer::Mixer;
use crate::resolver::{ResolveCache, StationResolver};
use crate::warmup::Warmup;

/// A tracing layer that copies warnings and errors into the broadcaster's
/// log feed, where HTTP clients can read them.
struct BroadcastLayer {
    broadcaster: StateBroadcaster,
}

impl BroadcastLayer {
    fn new(broadcaster: StateBroadcaster) -> Self {
        Self { broadcaster }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR; debug chatter stays in the file
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        self.broadcaster.push_log(message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The broadcaster exists before logging so the log layer can feed it.
    // Its placeholder snapshot is replaced once the library is loaded.
    let broadcaster = StateBroadcaster::new(core::initial_snapshot(&Library::default()));

    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = platform::log_file_path();

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(BroadcastLayer::new(broadcaster.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tunerd=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    if std::env::args().any(|a| a == "--system-deps") {
        platform::set_use_system_deps(true);
        info!("Using helper binaries from PATH only");
    }

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let store = Arc::new(JsonStore::new(
        config.daemon.packs_file.clone(),
        config.daemon.settings_file.clone(),
    ));
    let (catalog, settings) = store.load();
    let library = Library { catalog, settings };
    broadcaster.publish(core::initial_snapshot(&library));
    let library = Arc::new(RwLock::new(library));

    let engine_config = config.engine.clone();
    let cache = Arc::new(ResolveCache::new(
        StationResolver::new(platform::find_yt_dlp_binary(), engine_config.resolve_timeout()),
        engine_config.resolve_ttl(),
    ));
    let mixer = Mixer::detect(platform::find_amixer_binary(), &engine_config.mixer_control);

    let (health_tx, health_rx) = mpsc::channel(32);
    let engine = Arc::new(MpvEngine::new(
        engine_config.clone(),
        cache.clone(),
        mixer,
        health_tx,
    ));
    engine.start().await;

    let (warmup_tx, warmup_rx) = mpsc::channel(8);
    let (controller, handle) = PlaybackController::new(
        ControllerConfig {
            queue_capacity: config.daemon.queue_capacity,
            launch_timeout: engine_config.launch_timeout(),
        },
        engine.clone(),
        store,
        library.clone(),
        broadcaster.clone(),
        Some(warmup_tx),
    );

    let shutdown = CancellationToken::new();

    tokio::spawn(core::forward_health(health_rx, handle.clone()));

    let warmup = Warmup::new(
        cache,
        handle.clone(),
        library.clone(),
        engine_config.refresh_interval(),
    );
    tokio::spawn(warmup.run(warmup_rx, shutdown.clone()));

    let input_task = input::spawn(config.input.clone(), handle.clone(), shutdown.clone());

    let http_task = if config.http.enabled {
        Some(http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                handle: handle.clone(),
                broadcaster: broadcaster.clone(),
                library: library.clone(),
            },
            shutdown.clone(),
        ))
    } else {
        info!("HTTP API disabled in config");
        None
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received interrupt, shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!("Failed to listen for ctrl-c: {}", e),
            }
        });
    }

    info!("Daemon initialised, running controller");
    controller.run(shutdown.clone()).await;

    shutdown.cancel();
    engine.shutdown().await;
    if let Some(mut task) = http_task {
        // Open event streams hold graceful shutdown; don't wait on them forever.
        if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
            task.abort();
        }
    }
    if let Some(task) = input_task {
        let _ = task.await;
    }
    info!("Daemon stopped");

    Ok(())
}
