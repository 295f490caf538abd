use {
    base::log,
    com::{ComError, WsConnection, WsServer},
    fleet::{CalibrationStore, FleetConfig, HttpEndpoint, NvidiaSmi, Orchestrator, SystemLauncher},
    pipeline::{Backend, FleetBackend, PipelineConfig, Session},
    std::sync::Arc,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("S2S_LOG").unwrap_or_default();
    base::init_stdout_logger(base::parse_level(&level));

    let config = FleetConfig::from_env()?;
    let pipeline_config = PipelineConfig::from_env()?;
    let calibration = CalibrationStore::open(&config.calibration_dir)?;
    log::info!(
        "{} calibration records from {}",
        calibration.len(),
        config.calibration_dir.display()
    );

    let addr = format!("{}:{}", config.host, config.ports.pipeline);
    let purge_on_exit = config.purge_on_exit;
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        calibration,
        HttpEndpoint::new(&config)?,
        SystemLauncher::new(config.docker.clone()),
        NvidiaSmi::new(),
    ));
    for (entry, health) in orchestrator.status().await {
        log::info!("{} on port {}: {}", entry.kind, entry.port, health.status);
    }
    let backend = Arc::new(FleetBackend::new(Arc::clone(&orchestrator), pipeline_config.clone())?);

    let mut server = WsServer::bind(addr.as_str()).await?;
    log::info!("listening on {}", server.local_addr());

    loop {
        tokio::select! {
            connection = server.accept() => {
                let connection = connection?;
                let session = Session::new(Arc::clone(&backend), pipeline_config.clone(), connection.sender());
                tokio::spawn(serve(connection, session));
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                break;
            }
        }
    }

    orchestrator.shutdown(purge_on_exit).await;
    Ok(())
}

async fn serve<B: Backend>(mut connection: WsConnection, session: Session<B>) {
    let peer = connection.peer_addr();
    loop {
        match connection.recv().await {
            Ok(incoming) => {
                session.handle(incoming);
            }
            Err(ComError::ConnectionClosed) => break,
            Err(e) => {
                log::warn!("client {}: {}", peer, e);
                break;
            }
        }
    }
    log::info!("session for {} ended in {}", peer, session.stage());
}
