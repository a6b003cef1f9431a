//! Process entry point: loads configuration, wires up every table, cache,
//! sink, and plugin into a shared [`Dispatcher`], starts the kernel event
//! sources (or a warehouse capture/playback run), the periodic background
//! tasks, and the management HTTP API, then waits for a shutdown signal.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use nftrackd::api::{self, AppState};
use nftrackd::config::Config;
use nftrackd::dispatcher::{Dispatcher, Registry};
use nftrackd::error::DictError;
use nftrackd::ifstats::{counters, pinger, IfStatsRegistry};
use nftrackd::metrics::Metrics;
use nftrackd::plugins::{self, classify, PluginContext};
use nftrackd::settings::SettingsStore;
use nftrackd::sinks::dict::{DictKey, DictSink, DictValue, FileDictSink, SharedDictSink};
use nftrackd::sinks::events::{SharedEventSink, SqliteEventSink};
use nftrackd::sources::{conntrack, netlog, queue, raw_socket::NetlinkSocket, warehouse};
use nftrackd::sources::warehouse::{SharedCapture, WarehouseWriter};
use nftrackd::tables::{CertCache, RevDnsCache};

/// How long shutdown waits for each periodic task to notice cancellation
/// before giving up on it and moving to the next stage (spec.md §5).
const SHUTDOWN_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// `NFNLGRP_CONNTRACK_{NEW,UPDATE,DESTROY}` multicast groups (values 1-3;
/// the socket bind mask is `1 << (group - 1)` per netlink convention).
const CONNTRACK_NETLINK_GROUPS: u32 = 0b0000_0111;
/// NFLOG group 0, the default group `nft ... log group 0` rules publish to.
const NETLOG_NETLINK_GROUP: u32 = 0b0000_0001;

/// Dict sink used when `disable_dict` is set: every call succeeds without
/// doing any I/O, matching spec.md §6's `disable_dict` startup option.
struct NoopDictSink;

#[async_trait]
impl DictSink for NoopDictSink {
    async fn write(&self, _table: &str, _key: &DictKey, _field: &str, _value: &DictValue) -> Result<(), DictError> {
        Ok(())
    }
    async fn delete(&self, _table: &str, _key: &DictKey) -> Result<(), DictError> {
        Ok(())
    }
    async fn query(&self, _table: &str, _key: Option<&DictKey>) -> Result<Vec<(DictKey, String, DictValue)>, DictError> {
        Ok(Vec::new())
    }
}

/// Builds an `env_logger` module-level filter string from the JSON map at
/// `path` (`{"module::path": "debug", ...}`, spec.md §6's "Logger
/// configuration file"). Falls back to a bare default-level filter when
/// the file is absent or malformed.
fn build_log_filter(path: &str, debug: bool) -> String {
    let default_level = if debug { "debug" } else { "info" };
    let mut filter = default_level.to_string();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return filter;
    };
    let Ok(levels) = serde_json::from_str::<HashMap<String, String>>(&contents) else {
        warn!("logger config {path} is not a valid JSON object, using default level only");
        return filter;
    };
    for (module, level) in levels {
        filter.push(',');
        filter.push_str(&module);
        filter.push('=');
        filter.push_str(&level);
    }
    filter
}

fn device_uid() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|_| format!("pid-{}", std::process::id()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    let filter = build_log_filter(&config.paths.logger_config_file, config.debug);
    env_logger::Builder::new().parse_filters(&filter).init();
    info!("nftrackd starting, console={}", config.local);

    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    let dict: SharedDictSink = if config.disable_dict {
        Arc::new(NoopDictSink)
    } else {
        Arc::new(FileDictSink::new(
            config.paths.dict_write_file.clone().into(),
            config.paths.dict_delete_file.clone().into(),
        ))
    };
    let events: SharedEventSink = Arc::new(SqliteEventSink::connect(&config.paths.events_db).await?);
    let settings = SettingsStore::load(config.paths.settings_file.clone().into()).await?;
    let ifstats = Arc::new(IfStatsRegistry::new());

    let ctx = Arc::new(PluginContext {
        dict,
        events: events.clone(),
        cert_cache: Arc::new(CertCache::new()),
        revdns_cache: Arc::new(RevDnsCache::new()),
        ifstats: ifstats.clone(),
        settings: settings.clone(),
        metrics: metrics.clone(),
        config: config.clone(),
        device_uid: device_uid(),
    });

    let mut registry = Registry::new();
    plugins::register_all(&mut registry, ctx.clone());
    let dispatcher = Arc::new(Dispatcher::new(registry, metrics.clone()));

    let app_state = AppState::new(dispatcher.clone(), settings.clone(), metrics.clone());
    let http_bind = config.http.bind.clone();
    let http_task = {
        let app_state = app_state.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&http_bind).await {
                Ok(l) => l,
                Err(e) => {
                    error!("management HTTP API failed to bind {http_bind}: {e}");
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, api::router(app_state)).await {
                error!("management HTTP API exited: {e}");
            }
        })
    };

    let mut background: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    let mut kernel_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    if let Some(playback_file) = &config.playback_file {
        info!("warehouse playback mode: {}", playback_file.display());
        let outcome = warehouse::playback(playback_file, dispatcher.clone(), config.playback_speed).await;
        match outcome {
            Ok(ids) => info!("playback complete, replayed {} sessions", ids.len()),
            Err(e) => error!("playback failed: {e}"),
        }
        app_state.kernel_ready.store(true, Ordering::Relaxed);
    } else {
        if let Some(capture_file) = &config.capture_file {
            match WarehouseWriter::create(capture_file).await {
                Ok(writer) => *app_state.capture.lock().await = Some(writer),
                Err(e) => error!("failed to open capture file {}: {e}", capture_file.display()),
            }
        }

        match start_kernel_sources(&config, dispatcher.clone(), app_state.capture.clone(), shutdown.clone()).await {
            Ok(mut tasks) => {
                kernel_tasks.append(&mut tasks);
                app_state.kernel_ready.store(true, Ordering::Relaxed);
            }
            Err(e) => {
                error!("fatal: failed to attach kernel sources: {e}");
                return Err(e);
            }
        }
    }

    background.push(spawn_cleanup_task(dispatcher.clone(), config.queue.cleanup_interval_secs, shutdown.clone()));
    background.push(tokio::spawn(counters::run(events.clone(), shutdown.clone())));
    for wan in &config.interfaces.wan {
        let targets: Vec<IpAddr> = wan.ping_targets.iter().filter_map(|h| h.parse().ok()).collect();
        if targets.is_empty() {
            continue;
        }
        let collector = ifstats.collector_for(wan.iface_id);
        let name = wan.name.clone();
        let shutdown = shutdown.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = pinger::run(name.clone(), targets, collector, shutdown).await {
                error!("pinger[{name}] exited: {e}");
            }
        }));
    }
    {
        let plugin = Arc::new(classify::ClassifyPlugin::new(ctx.clone()));
        background.push(tokio::spawn(classify::run_summary_loop(plugin)));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown.cancel();

    for task in background {
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, task).await.is_err() {
            warn!("a periodic task did not drain within {SHUTDOWN_DRAIN_TIMEOUT:?}, abandoning it");
        }
    }
    for task in kernel_tasks {
        task.abort();
    }
    http_task.abort();

    info!("nftrackd stopped");
    Ok(())
}

async fn start_kernel_sources(config: &Config, dispatcher: Arc<Dispatcher>, capture: SharedCapture, shutdown: CancellationToken) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let mut tasks = Vec::new();

    let queue_num = config.queue.queue_num;
    let queue_dispatcher = dispatcher.clone();
    let queue_capture = capture.clone();
    let queue_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = queue::run(queue_num, |_conntrack_id| 0u32, queue_dispatcher, queue_capture, queue_shutdown).await {
            error!("queue source exited: {e}");
        }
    }));

    let conntrack_socket = NetlinkSocket::open(CONNTRACK_NETLINK_GROUPS)?;
    let conntrack_dispatcher = dispatcher.clone();
    let conntrack_capture = capture.clone();
    let conntrack_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = conntrack::run(conntrack_socket, conntrack_dispatcher, conntrack_capture, conntrack_shutdown).await {
            error!("conntrack source exited: {e}");
        }
    }));

    let netlog_socket = NetlinkSocket::open(NETLOG_NETLINK_GROUP)?;
    let netlog_dispatcher = dispatcher.clone();
    let netlog_capture = capture.clone();
    let netlog_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = netlog::run(netlog_socket, netlog_dispatcher, netlog_capture, netlog_shutdown).await {
            error!("netlog source exited: {e}");
        }
    }));

    Ok(tasks)
}

fn spawn_cleanup_task(dispatcher: Arc<Dispatcher>, interval_secs: u64, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let stale = dispatcher.sessions.sweep_stale().await;
                    if !stale.is_empty() {
                        info!("cleanup: swept {} stale sessions", stale.len());
                    }
                }
            }
        }
    })
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sigterm) = signal::unix::signal(signal::unix::SignalKind::terminate()) else {
            std::future::pending::<()>().await;
            unreachable!()
        };
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
