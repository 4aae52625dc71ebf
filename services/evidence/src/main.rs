use evidence::{
    config::{EvidenceConfig, TransportRuntime},
    transport::{EvidenceRuntime, serve_http_with_workers},
};
use store::EvidenceRepository;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("BATCHVAULT_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = EvidenceConfig::from_env();
    let repository = match EvidenceRepository::open(&config.storage_root) {
        Ok(repository) => repository,
        Err(err) => {
            tracing::error!(error = %err, "evidence failed opening storage root");
            std::process::exit(1);
        }
    };
    tracing::info!(
        storage_root = %repository.root().display(),
        bind_addr = %config.bind_addr,
        workers = config.http_workers,
        runtime = config.transport_runtime.as_str(),
        "evidence service starting"
    );
    let runtime = EvidenceRuntime::new(repository);

    match config.transport_runtime {
        TransportRuntime::Std => {
            if let Err(err) = serve_http_with_workers(
                runtime,
                &config.bind_addr,
                config.http_workers,
                config.http_queue_capacity,
            ) {
                tracing::error!(error = %err, "evidence transport failed");
                std::process::exit(1);
            }
        }
        TransportRuntime::Axum => {
            #[cfg(feature = "async-transport")]
            {
                if let Err(err) = evidence::transport_axum::serve_http_with_axum(
                    runtime,
                    &config.bind_addr,
                    config.http_workers,
                ) {
                    tracing::error!(error = %err, "evidence transport failed");
                    std::process::exit(1);
                }
            }
            #[cfg(not(feature = "async-transport"))]
            {
                drop(runtime);
                tracing::error!(
                    "evidence transport runtime 'axum' requires build feature 'async-transport'"
                );
                std::process::exit(2);
            }
        }
    }
}
