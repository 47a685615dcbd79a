//! Basic example showing how to use orm-zipkin-tracing with SeaORM.
//!
//! Run with: cargo run --example basic

use std::collections::HashMap;
use std::sync::Arc;

use orm_zipkin_tracing::orm::SeaOrmSource;
use orm_zipkin_tracing::prelude::*;
use orm_zipkin_tracing::RemoteService;
use sea_orm::Database;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,orm_zipkin_tracing=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/test".into());

    tracing::info!("Connecting to database...");

    let db = Database::connect(&database_url).await?;

    let config = TraceConfig::new(Arc::new(TracingTracer::new()))
        .with_service_name("orders-svc")
        .with_local_port(8080)
        .with_remote_service(RemoteService::new("postgres").with_host("127.0.0.1").with_port(5432));

    // Headers of the inbound request, as an HTTP framework would hand them over.
    let headers: HashMap<String, String> = HashMap::from([
        ("X-B3-TraceId".to_string(), "463ac35c9f6413ad48485a3953bb6124".to_string()),
        ("X-B3-SpanId".to_string(), "a2fb4a1d1a96d312".to_string()),
        ("X-B3-Sampled".to_string(), "1".to_string()),
    ]);

    let traced = SeaOrmSource::new(db).with_tracing_context(&config, &headers);

    let orders = traced.get_repository("order").create_query_builder();
    let count = orders.execute_count_query().await?;
    tracing::info!(count, "Counted orders");

    let first_page = orders.map(|q| q.limit(10)).load_raw_results().await?;
    tracing::info!(rows = first_page.len(), "Loaded first page");

    Ok(())
}
