//! vectordb server binary.
//!
//! Boots the shared `Service` once, then serves the REST API (Axum) and
//! the gRPC API (Tonic) concurrently against the same in-process state.

use std::sync::Arc;

use tonic::transport::Server;
use tracing::info;

use vectordb::config::Config;
use vectordb::logging;
use vectordb::rest::create_router;
use vectordb::rpc::VectorDbServiceImpl;
use vectordb::service::Service;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();
    let _log_guard = logging::init(&config.monitoring);

    let http_addr = format!("{}:{}", config.http.host, config.http.port);
    let grpc_addr = format!("{}:{}", config.grpc.host, config.grpc.port).parse()?;

    info!(%http_addr, %grpc_addr, "starting vectordb");

    let service = Arc::new(Service::new(config)?);

    let rest_app = create_router(service.clone());
    let rest_listener = tokio::net::TcpListener::bind(&http_addr).await?;
    let rest_server = tokio::spawn(async move {
        axum::serve(rest_listener, rest_app.into_make_service()).await
    });

    let grpc_service = VectorDbServiceImpl::new(service).into_server();
    let grpc_server = Server::builder().add_service(grpc_service).serve(grpc_addr);

    tokio::select! {
        res = rest_server => {
            if let Err(e) = res {
                tracing::error!(error = %e, "REST server task panicked");
            }
        }
        res = grpc_server => {
            if let Err(e) = res {
                tracing::error!(error = %e, "gRPC server exited with error");
            }
        }
    }

    Ok(())
}
