use super::*;

pub(super) fn serve_http_with_workers(
    runtime: IngestionRuntime,
    bind_addr: &str,
    worker_count: usize,
    queue_capacity: Option<usize>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    let worker_count = worker_count.max(1);
    let queue_capacity = queue_capacity
        .filter(|value| *value > 0)
        .unwrap_or_else(|| default_http_queue_capacity(worker_count));
    let backpressure_metrics = Arc::new(TransportBackpressureMetrics::new(queue_capacity));
    runtime.set_transport_backpressure_metrics(Arc::clone(&backpressure_metrics));
    let runtime: SharedRuntime = Arc::new(runtime);
    let (tx, rx) = crossbeam_channel::bounded::<TcpStream>(queue_capacity);

    tracing::info!(bind_addr, worker_count, queue_capacity, "ingestion transport listening");

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let runtime = Arc::clone(&runtime);
            let rx = rx.clone();
            let backpressure_metrics = Arc::clone(&backpressure_metrics);
            scope.spawn(move || {
                for stream in rx.iter() {
                    backpressure_metrics.observe_dequeued();
                    if let Err(err) = handle_connection(&runtime, stream) {
                        tracing::warn!(error = %err, "ingestion transport error");
                    }
                }
            });
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    backpressure_metrics.observe_enqueued();
                    match tx.try_send(stream) {
                        Ok(()) => {}
                        Err(crossbeam_channel::TrySendError::Full(stream)) => {
                            backpressure_metrics.observe_dequeued();
                            backpressure_metrics.observe_rejected();
                            if let Err(err) =
                                write_backpressure_response(stream, SOCKET_TIMEOUT_SECS)
                            {
                                tracing::warn!(error = %err, "backpressure response failed");
                            }
                        }
                        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                            backpressure_metrics.observe_dequeued();
                            tracing::error!("ingestion transport worker queue closed");
                            break;
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "ingestion transport accept error"),
            }
        }
        drop(tx);
    });

    Ok(())
}

fn default_http_queue_capacity(worker_count: usize) -> usize {
    worker_count
        .saturating_mul(DEFAULT_HTTP_QUEUE_CAPACITY_PER_WORKER)
        .max(worker_count)
}

fn handle_connection(runtime: &IngestionRuntime, mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;
    stream.set_write_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;

    let request = match read_http_request(&mut stream, runtime.max_body_bytes()) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => return write_response(&mut stream, err.into_response()),
    };

    let response = handle_request(runtime, &request);
    write_response(&mut stream, response)
}
