use anyhow::Result;
use netusage_daemon::{
    collector::LinuxCounterSource,
    config::Config,
    db::Database,
    monitor::{Monitor, MonitorOptions},
    protocol::{Request, Response, SettingsPatch, StatusData},
    retention::RetentionPolicy,
    settings::UserSettings,
    socket::{encode, serve_client, ControlSocket, RequestHandler},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct DaemonState {
    monitor: Monitor,
    source: Arc<LinuxCounterSource>,
    settings: RwLock<UserSettings>,
}

impl DaemonState {
    fn status(&self) -> StatusData {
        let (upload_speed, download_speed) = self.monitor.total_speed();
        StatusData {
            monitor: self.monitor.status(),
            upload_speed,
            download_speed,
            active_processes: self.monitor.current_stats().len(),
            persistence_enabled: self.monitor.persistence_enabled(),
        }
    }

    async fn update_settings(&self, patch: SettingsPatch) -> Response {
        let mut settings = self.settings.write().await;
        let mut updated = settings.clone();
        if let Err(e) = patch.apply(&mut updated) {
            warn!("Rejected settings update: {}", e);
            return Response::error(e);
        }

        {
            let db = self.monitor.database();
            let db = db.lock().await;
            if let Err(e) = updated.save(&*db) {
                error!("Failed to save settings: {}", e);
                return Response::error(e);
            }
        }

        if updated.data_retention != settings.data_retention {
            // The saved policy stands even if this pass fails; the periodic sweep retries.
            match self.monitor.change_retention(updated.data_retention).await {
                Ok(report) => info!(
                    "Retention applied: {} expired, {} aged out",
                    report.expired, report.aged_out
                ),
                Err(e) => error!("Failed to apply new retention: {}", e),
            }
        }
        if updated.network_interface != settings.network_interface {
            self.source.set_interface(updated.interface());
            info!("Network interface set to {:?}", updated.interface());
        }
        *settings = updated.clone();
        Response::Settings { data: updated }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DaemonState {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStats => Response::Stats { data: self.monitor.current_stats() },

            Request::GetStatus => Response::Status { data: self.status() },

            Request::PauseMonitoring => {
                self.monitor.pause();
                Response::Ok
            }

            Request::ResumeMonitoring => {
                self.monitor.resume();
                Response::Ok
            }

            Request::GetDailyTotals { params } => {
                let result = match params.date {
                    Some(date) => self.monitor.daily_totals(&date).await,
                    None => self.monitor.today_totals().await,
                };
                match result {
                    Ok(data) => Response::DailyTotals { data },
                    Err(e) => Response::error(e),
                }
            }

            Request::Get24hUsage => match self.monitor.last_24_hour_totals().await {
                Ok(data) => Response::Usage24h { data },
                Err(e) => Response::error(e),
            },

            Request::GetAppUsage { params } => {
                let days = match params.days {
                    Some(days) => days,
                    None => self.settings.read().await.data_retention.window_days(),
                };
                match self.monitor.app_usage_for_retention_window(days).await {
                    Ok(data) => Response::AppUsage { data },
                    Err(e) => Response::error(e),
                }
            }

            Request::GetHistory { params } => {
                match self.monitor.recent_daily_summaries(params.days).await {
                    Ok(data) => Response::History { data },
                    Err(e) => Response::error(e),
                }
            }

            Request::GetStorageStats => match self.monitor.storage_stats().await {
                Ok(data) => Response::StorageStats { data },
                Err(e) => Response::error(e),
            },

            Request::ClearData => match self.monitor.clear_all().await {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(e),
            },

            Request::GetSettings => Response::Settings { data: self.settings.read().await.clone() },

            Request::UpdateSettings { params } => self.update_settings(params).await,

            Request::ApplyRetention { params } => {
                match self.monitor.apply_retention_now(params.retention).await {
                    Ok(data) => Response::Retention { data },
                    Err(e) => Response::error(e),
                }
            }
        }
    }
}

async fn status_loop(state: Arc<DaemonState>, status_tx: broadcast::Sender<String>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if status_tx.receiver_count() == 0 {
            continue;
        }
        let status = Response::Status { data: state.status() };
        let _ = status_tx.send(encode(&status));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("netusage daemon starting...");

    let config_path = Config::config_path();
    let config = if config_path.exists() {
        Config::load(&config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        })
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    let db_path = config.storage.db_path.clone().unwrap_or_else(Database::default_path);
    let db = Database::open(&db_path)?.with_limits(config.storage.limits());
    if let Some(moved) = db.quarantined() {
        warn!("Previous database was corrupt and has been moved to {:?}", moved);
    }
    let settings = UserSettings::load(&db)?;

    let source = Arc::new(LinuxCounterSource::new().include_loopback(config.attribution.include_loopback));
    source.set_interface(settings.interface());

    let monitor = Monitor::new(source.clone(), db, MonitorOptions::from_config(&config));
    monitor.set_retention(settings.data_retention);
    if settings.data_retention == RetentionPolicy::DoNotSave {
        info!("Data retention is set to do-not-save; usage will not be persisted");
    }
    monitor.start().await?;

    let socket_path = config.general.socket_path.clone().unwrap_or_else(ControlSocket::default_path);
    let server = ControlSocket::bind(&socket_path).await?;
    let state = Arc::new(DaemonState {
        monitor,
        source,
        settings: RwLock::new(settings),
    });

    tokio::spawn(status_loop(
        Arc::clone(&state),
        server.status_sender(),
        Duration::from_secs(config.general.status_broadcast_secs.max(1)),
    ));

    info!("Daemon ready, listening for connections...");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = server.accept() => match result {
                Ok(stream) => {
                    let state = Arc::clone(&state);
                    let status_rx = server.status_sender().subscribe();
                    tokio::spawn(serve_client(stream, status_rx, state));
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = &mut shutdown => {
                info!("Shutting down...");
                break;
            }
        }
    }

    server.close();
    let outcome = state.monitor.stop().await?;
    info!("Final flush: {:?}", outcome);
    Ok(())
}
