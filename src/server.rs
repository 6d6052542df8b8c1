//! Unix socket server for conversion requests.
//!
//! Acquires the endpoint, accepts connections and hands each one to its own
//! task running a session. The accept loop never waits for a session; it
//! only stops when the process is asked to shut down.

use crate::config::Config;
use crate::endpoint::{acquire_endpoint, Endpoint, EndpointError, EndpointOptions};
use crate::session::handle_session;
use crate::transformer::{ProcessTransformer, Transformer, TransformerFactory};
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, trace};

/// Acquire the configured endpoint and serve until SIGINT, SIGTERM or SIGHUP.
pub async fn run(config: Config) -> Result<(), EndpointError> {
    let endpoint = acquire_endpoint(&EndpointOptions {
        path: config.socket.clone(),
        mode: config.mode,
        backlog: config.backlog,
    })?;

    let command = config.transformer_command;
    let args = config.transformer_args;
    let factory: Arc<dyn TransformerFactory> = Arc::new(move || {
        Box::new(ProcessTransformer::new(command.clone(), args.clone())) as Box<dyn Transformer>
    });

    run_until(endpoint, factory, shutdown_signal()).await;
    Ok(())
}

/// Serve until `shutdown` resolves, then release the endpoint.
pub async fn run_until<F>(endpoint: Endpoint, factory: Arc<dyn TransformerFactory>, shutdown: F)
where
    F: Future<Output = ()>,
{
    info!(path = %endpoint.path().display(), "Server listening");

    tokio::select! {
        _ = serve(&endpoint, factory) => {}
        _ = shutdown => info!("Shutting down"),
    }

    // Dropping the endpoint removes the socket file.
    drop(endpoint);
}

/// Accept connections forever, one task per connection.
pub async fn serve(endpoint: &Endpoint, factory: Arc<dyn TransformerFactory>) {
    loop {
        match endpoint.accept().await {
            Ok(stream) => {
                trace!("New connection");
                let factory = Arc::clone(&factory);

                tokio::spawn(async move {
                    if let Err(e) = handle_session(stream, factory.as_ref()).await {
                        debug!(error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Resolves on the first termination signal.
async fn shutdown_signal() {
    tokio::select! {
        _ = wait_for(SignalKind::interrupt(), "SIGINT") => {}
        _ = wait_for(SignalKind::terminate(), "SIGTERM") => {}
        _ = wait_for(SignalKind::hangup(), "SIGHUP") => {}
    }
}

async fn wait_for(kind: SignalKind, name: &'static str) {
    match signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
            info!(signal = name, "Received signal");
        }
        Err(e) => {
            error!(signal = name, error = %e, "Failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}
