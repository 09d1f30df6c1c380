//! AWS Lambda function for the task lists API
//!
//! On Lambda the function serves API Gateway proxy events that already passed
//! the Cognito authorizer. Run anywhere else, it starts a local Axum server
//! with the same routes behind a token-validating middleware.

use anyhow::Error;
use infra::ComputeEnv;
use lambda_runtime::{service_fn, Error as LambdaError, LambdaEvent};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

mod app;
mod authorizer;
mod errors;
mod handlers;
mod lists;
mod proxy;
mod store;

#[cfg(test)]
mod integration_tests;

use app::{cors_from_env, create_app, LocalConfig};
use handlers::ListService;
use proxy::{handle_event, ProxyRequest, ProxyResponse};
use store::{DynamoStore, ItemStore, MemoryStore};

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .init();

    info!("Starting task lists function");

    // Placeholder values fail the cold start instead of the first request
    let env = ComputeEnv::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load function environment: {e}"))?;
    let cors = cors_from_env();

    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(env.region.clone()))
        .load()
        .await;

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        // Run on AWS Lambda
        info!(table = %env.table_name, "Running on AWS Lambda");
        let store = DynamoStore::new(aws_sdk_dynamodb::Client::new(&aws_config), &env.table_name);
        let service = ListService::new(Arc::new(store));

        lambda_runtime::run(service_fn(move |event: LambdaEvent<ProxyRequest>| {
            let service = service.clone();
            let cors = cors.clone();
            async move {
                let response = handle_event(&service, &cors, event.payload).await;
                Ok::<ProxyResponse, LambdaError>(response)
            }
        }))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run on Lambda: {e}"))?;
    } else {
        // Run locally for development
        let local = LocalConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load local configuration: {e}"))?;
        let verifier = local
            .verifier(&env.issuer())
            .map_err(|e| anyhow::anyhow!("Failed to create token verifier: {e}"))?;

        let store: Arc<dyn ItemStore> = if local.memory_store {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            info!(table = %env.table_name, "Using DynamoDB store");
            Arc::new(DynamoStore::new(
                aws_sdk_dynamodb::Client::new(&aws_config),
                &env.table_name,
            ))
        };

        let app = create_app(ListService::new(store), Arc::new(verifier), &cors);
        info!("Running locally on http://{}", local.addr);
        let listener = TcpListener::bind(local.addr).await?;
        axum::serve(listener, app.into_make_service()).await?;
    }

    Ok(())
}
