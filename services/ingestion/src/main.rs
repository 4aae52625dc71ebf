use std::{path::Path, sync::Arc};

use ingestion::{
    config::{IngestConfig, TransportRuntime},
    coordinator::{BatchCommitCoordinator, Upload, UploadPolicy},
    notify::SpoolPublisher,
    observability,
    transport::{IngestionRuntime, serve_http_with_workers},
};
use store::FileClaimLedger;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

fn main() {
    init_tracing();
    let config = IngestConfig::from_env();
    let serve_mode = std::env::args().any(|arg| arg == "--serve");
    let upload_path = std::env::args().skip(1).find(|arg| !arg.starts_with("--"));

    observability::install();
    let coordinator = match open_coordinator(&config) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            tracing::error!(error = %err, "ingestion failed to start");
            std::process::exit(1);
        }
    };
    tracing::info!(
        storage_root = %coordinator.storage_root().display(),
        ledger_dir = %config.ledger_dir.display(),
        events_path = %config.events_path.display(),
        events_channel = %config.events_channel,
        max_upload_bytes = config.max_upload_bytes,
        "ingestion configured"
    );

    if serve_mode {
        serve(IngestionRuntime::new(coordinator), &config);
    } else if let Some(path) = upload_path {
        commit_file(&coordinator, Path::new(&path));
    } else {
        println!(
            "ingestion ready: storage_root={} (pass --serve to listen on {}, or a CSV path to commit it)",
            coordinator.storage_root().display(),
            config.bind_addr
        );
    }
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("BATCHVAULT_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn open_coordinator(config: &IngestConfig) -> Result<BatchCommitCoordinator, String> {
    let ledger = FileClaimLedger::open(&config.ledger_dir).map_err(|err| err.to_string())?;
    // The spool is the only channel other processes can subscribe to.
    let publisher = SpoolPublisher::new(&config.events_path, config.events_channel.clone());
    BatchCommitCoordinator::open(
        &config.storage_root,
        Arc::new(ledger),
        Arc::new(publisher),
        UploadPolicy {
            max_bytes: config.max_upload_bytes,
        },
    )
    .map_err(|err| err.to_string())
}

fn serve(runtime: IngestionRuntime, config: &IngestConfig) {
    tracing::info!(
        bind_addr = %config.bind_addr,
        workers = config.http_workers,
        runtime = config.transport_runtime.as_str(),
        "ingestion endpoints: POST /v1/batches, GET /v1/batches/{{batchId}}, GET /health"
    );
    match config.transport_runtime {
        TransportRuntime::Std => {
            if let Err(err) = serve_http_with_workers(
                runtime,
                &config.bind_addr,
                config.http_workers,
                config.http_queue_capacity,
            ) {
                tracing::error!(error = %err, "ingestion transport failed");
                std::process::exit(1);
            }
        }
        TransportRuntime::Axum => {
            #[cfg(feature = "async-transport")]
            {
                if let Err(err) = ingestion::transport_axum::serve_http_with_axum(
                    runtime,
                    &config.bind_addr,
                    config.http_workers,
                ) {
                    tracing::error!(error = %err, "ingestion transport failed");
                    std::process::exit(1);
                }
            }
            #[cfg(not(feature = "async-transport"))]
            {
                drop(runtime);
                tracing::error!(
                    "ingestion transport runtime 'axum' requires build feature 'async-transport'"
                );
                std::process::exit(2);
            }
        }
    }
}

fn commit_file(coordinator: &BatchCommitCoordinator, path: &Path) {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "cannot read upload");
            std::process::exit(1);
        }
    };
    let upload = Upload {
        filename: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        content_type: None,
        bytes,
    };
    match coordinator.commit(upload) {
        Ok(receipt) => match serde_json::to_string_pretty(&receipt) {
            Ok(json) => println!("{json}"),
            Err(err) => tracing::error!(error = %err, "cannot render receipt"),
        },
        Err(err) => {
            tracing::error!(class = %err.class(), error = %err, "commit failed");
            std::process::exit(1);
        }
    }
}
