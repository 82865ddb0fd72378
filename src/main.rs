use log::{error, info};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpServer, web};

use gpiosvc::{
    AppConfig, AppState, Broadcaster, LineBackend, PinManager, ShutdownCoordinator,
    ShutdownState,
};

#[cfg(feature = "hardware-gpio")]
use gpiosvc::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use gpiosvc::MockGpioBackend;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIOSVC_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(
        AppConfig::load_from_file(&config_path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
    );

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(LibgpiodBackend::new(&config))
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::from_config(&config))
        }
    };

    let manager = Arc::new(PinManager::new(backend));
    let broadcaster = Arc::new(Broadcaster::new(config.subscriber_queue_capacity));
    manager.register_observer(broadcaster.clone());

    let coordinator = Arc::new(
        ShutdownCoordinator::new(manager.clone(), config.shutdown_timeout())
            .with_broadcaster(broadcaster.clone()),
    );
    let app_state = AppState {
        manager,
        broadcaster,
    };

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    })
    .client_request_timeout(Duration::from_secs(config.http.timeout))
    .disable_signals();

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        (None, None) => {
            panic!("Config error: either 'unix_socket' or 'host' must be specified")
        }
    };

    info!("Starting server on {}...", bind_addrs);

    let server = server.run();
    // drain gets its own lock timeout plus slack for the hardware writes
    let drain_deadline = config.shutdown_timeout() * 2;
    actix_web::rt::spawn(watch_signals(
        coordinator.clone(),
        server.handle(),
        drain_deadline,
    ));

    server.await?;

    if coordinator.state() == ShutdownState::Running {
        coordinator.drain();
    }

    Ok(())
}

async fn watch_signals<B: LineBackend + 'static>(
    coordinator: Arc<ShutdownCoordinator<B>>,
    server: ServerHandle,
    drain_deadline: Duration,
) {
    let mut draining = false;
    loop {
        if let Err(e) = termination_requested().await {
            error!("failed to listen for termination signals: {e}");
            return;
        }

        if draining {
            info!("termination requested again, drain already running");
            continue;
        }
        draining = true;
        info!("termination requested, safing outputs");

        let coordinator = coordinator.clone();
        let server = server.clone();
        actix_web::rt::spawn(async move {
            let drain = actix_web::rt::task::spawn_blocking(move || coordinator.drain());
            match actix_web::rt::time::timeout(drain_deadline, drain).await {
                Ok(Ok(outcome)) => info!("drain finished: {outcome:?}"),
                Ok(Err(e)) => error!("drain task failed: {e}"),
                Err(_) => error!("drain did not finish within {drain_deadline:?}, exiting anyway"),
            }
            server.stop(true).await;
        });
    }
}

#[cfg(unix)]
async fn termination_requested() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn termination_requested() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
