pub mod handlers;
pub mod models;
pub mod state;
pub mod trace;

pub use models::ErrorResponse;
pub use state::AppState;

use anyhow::Result;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Args;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "mcp402 Gateway",
        version = env!("CARGO_PKG_VERSION"),
        description = "Gateway to remote MCP servers: direct and proxied connections, \
                       x402 pay-per-call tool invocation and on-chain work proofs.",
        license(
            name = "MIT OR Apache-2.0",
        ),
    ),
    paths(
        handlers::callers::identity_handler,
        handlers::callers::work_proof_status_handler,
        handlers::callers::workload_handler,
        handlers::connections::available_connections_handler,
        handlers::connections::connect_handler,
        handlers::connections::disconnect_handler,
        handlers::connections::list_connections_handler,
        handlers::health::health_handler,
        handlers::proxy::proxy_message_handler,
        handlers::proxy::proxy_inbox_handler,
        handlers::proxy::proxy_sse_handler,
        handlers::resources::list_resources_handler,
        handlers::resources::read_resource_handler,
        handlers::tools::catalog_handler,
        handlers::tools::invoke_tool_handler,
        handlers::tools::list_tools_handler,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::ConnectionsResponse,
            models::ConnectionIdRequest,
            models::DisconnectResponse,
            models::AvailableConnectionsResponse,
            models::ConnectResponse,
            models::ResourcesResponse,
            models::ToolsResponse,
            models::ReadResourceRequest,
            models::ReadResourceResponse,
            models::CatalogResponse,
            models::InvokeToolRequest,
            models::InvokeToolResponse,
            models::PaymentRequiredResponse,
            models::ProxyInboxResponse,
            models::WorkProofStatusResponse,
            models::IdentityResponse,
            models::WorkloadResponse,
            handlers::health::HealthResponse,
            crate::identity::CallerIdentity,
            crate::ledger::WorkProof,
            crate::ledger::SettlementStatus,
            crate::ledger::CallerTally,
            crate::ledger::UserWorkload,
            crate::x402::PaymentChallenge,
            crate::x402::PaymentProof,
            crate::x402::ToolPricingPolicy,
            crate::x402::PricingPolicy,
            crate::x402::VerificationMode,
        )
    ),
    tags(
        (name = "Health", description = "Service health and status"),
        (name = "Connections", description = "Direct and proxied MCP connections"),
        (name = "Resources", description = "Resource listing and reads on a connection"),
        (name = "Tools", description = "Tool listing, pricing and metered invocation"),
        (name = "Proxy", description = "Stream-bridged sessions opened by remote servers"),
        (name = "Work proofs", description = "Settlement of executed tasks"),
        (name = "Callers", description = "Caller identity and workload"),
    )
)]
struct ApiDoc;

/// Build the router for an already wired [`AppState`]
pub fn create_app(state: AppState, request_limit: usize) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health::health_handler))
        .route("/connections", get(handlers::connections::list_connections_handler))
        .route("/connections/available", get(handlers::connections::available_connections_handler))
        .route("/connections/connect", post(handlers::connections::connect_handler))
        .route("/connections/disconnect", post(handlers::connections::disconnect_handler))
        .route("/connections/{connection_id}/resources", get(handlers::resources::list_resources_handler))
        .route("/connections/{connection_id}/tools", get(handlers::tools::list_tools_handler))
        .route("/resources/read", post(handlers::resources::read_resource_handler))
        .route("/tools/catalog", get(handlers::tools::catalog_handler))
        .route("/tools/invoke", post(handlers::tools::invoke_tool_handler))
        .route("/proxy/{config_id}/sse", get(handlers::proxy::proxy_sse_handler))
        .route(
            "/proxy/messages",
            post(handlers::proxy::proxy_message_handler).get(handlers::proxy::proxy_inbox_handler),
        )
        .route("/work-proofs/{task_id}", get(handlers::callers::work_proof_status_handler))
        .route("/workload/{user}", get(handlers::callers::workload_handler))
        .route("/identity/{raw}", get(handlers::callers::identity_handler))
        .layer(axum::extract::DefaultBodyLimit::max(request_limit));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api)
        .layer(middleware::from_fn(trace::trace_request))
        .with_state(state)
}

/// Parse a byte size string like "2MB", "50MiB", "2G", or raw bytes "104857600"
fn parse_bytes(size_str: &str) -> Result<usize> {
    let s = size_str.trim().to_lowercase();

    if let Ok(n) = s.parse::<usize>() {
        return Ok(n);
    }

    const SUFFIXES: &[(&str, usize)] = &[
        ("gib", 1024 * 1024 * 1024),
        ("mib", 1024 * 1024),
        ("kib", 1024),
        ("gb", 1000 * 1000 * 1000),
        ("mb", 1000 * 1000),
        ("kb", 1000),
        ("g", 1000 * 1000 * 1000),
        ("m", 1000 * 1000),
        ("k", 1000),
    ];

    let Some((num_part, multiplier)) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
    else {
        anyhow::bail!("Invalid size format: {}. Use KB, MB, GB, KiB, MiB, GiB or raw bytes", size_str);
    };

    let num: usize = num_part
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid number in size: {}", size_str))?;
    Ok(num * multiplier)
}

#[derive(Args)]
pub struct ServeArgs {
    /// Write process ID to the specified file
    #[arg(long, value_name = "./pid.file")]
    pub pid: Option<String>,

    /// Write readiness marker to the specified file once server is listening
    #[arg(long)]
    pub ready_file: Option<String>,

    /// Maximum body size for API requests (e.g., "2MB", "2MiB")
    #[arg(long, value_name = "SIZE", default_value = "2MB")]
    pub request_limit: String,
}

pub async fn run(args: ServeArgs, config: &crate::config::GlobalConfig) -> Result<()> {
    let port = config.port();
    let request_limit = parse_bytes(&args.request_limit)?;

    if let Some(pid_file) = &args.pid {
        std::fs::write(pid_file, std::process::id().to_string())?;
    }

    let (state, _settlement_worker) = AppState::from_config(config).await?;
    state.establish_connections().await;

    let app = create_app(state.clone(), request_limit);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        listen = %listener.local_addr()?,
        connections = state.registry.direct_count(),
        tools = state.gateway.catalog().len(),
        verification = %state.gateway.verifier_mode(),
        ledger = %state.recorder.ledger_description(),
        swagger = format!("http://localhost:{}/swagger-ui", port),
        "Server started"
    );

    if let Some(ready_file) = &args.ready_file {
        std::fs::write(ready_file, format!("ready {}", std::process::id()))?;
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down, closing connections");
    state.registry.close_all().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x402::gateway::tests::{EchoExecutor, PAID_HASH};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let state = state::tests::test_state(Arc::new(EchoExecutor::default()));
        (create_app(state.clone(), 1024 * 1024), state)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("2MB").unwrap(), 2_000_000);
        assert_eq!(parse_bytes("1MiB").unwrap(), 1024 * 1024);
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert!(parse_bytes("lots").is_err());
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["direct_connections"], 1);
        assert_eq!(body["payment_verification"], "trust");
    }

    #[tokio::test]
    async fn test_list_and_disconnect() {
        let (app, state) = app();
        let body = body_json(app.clone().oneshot(get("/connections")).await.unwrap()).await;
        assert_eq!(body, json!({"success": true, "connections": ["conn1"]}));

        let response = app
            .clone()
            .oneshot(post_json("/connections/disconnect", json!({"connectionId": "conn1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.registry.has_direct("conn1"));

        let response = app
            .clone()
            .oneshot(post_json("/connections/disconnect", json!({"connectionId": "conn1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);

        let response = app
            .oneshot(post_json("/connections/disconnect", json!({"connectionId": "never-registered"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["connectionId"], "never-registered");
    }

    #[tokio::test]
    async fn test_proxy_disconnect_is_acknowledged() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json("/connections/disconnect", json!({"connectionId": "proxy_nowhere"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_404() {
        let (app, _) = app();
        let response = app.oneshot(get("/connections/missing/tools")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "CONNECTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invoke_priced_without_payment_is_402() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json("/tools/invoke", json!({"toolName": "search", "input": {"q": "x"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["paymentRequired"]["amount"], "0.25");
        assert_eq!(body["paymentRequired"]["currency"], "ETH");
        assert_eq!(body["paymentRequired"]["chainId"], 8453);
        assert!(body["paymentRequired"]["paymentUrl"].as_str().unwrap().starts_with("ethereum:"));
    }

    #[tokio::test]
    async fn test_invoke_with_payment_and_poll_settlement() {
        let (app, _) = app();
        let request = json!({
            "toolName": "search",
            "input": {"q": "rust"},
            "paymentInfo": {"transactionHash": PAID_HASH, "amount": "0.25", "currency": "ETH"},
            "callerId": "alice@example.com",
        });
        let response = app.clone().oneshot(post_json("/tools/invoke", request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["output"]["echo"]["q"], "rust");
        let task_id = body["taskId"].as_str().unwrap().to_string();
        assert_eq!(body["workProof"]["taskId"], task_id.as_str());
        assert!(body["workProof"]["proofHash"].as_str().unwrap().starts_with("0x"));
        assert_eq!(body["caller"]["canonicalUUID"], crate::identity::normalize("alice@example.com"));

        // Memory ledger settles promptly
        let mut settled = None;
        for _ in 0..50 {
            let body = body_json(app.clone().oneshot(get(&format!("/work-proofs/{}", task_id))).await.unwrap()).await;
            let status = body["settlement"].clone();
            if status["status"] == "settled" {
                settled = Some(status);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(settled.is_some());
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool_is_422() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json("/tools/invoke", json!({"toolName": "nope"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["code"], "TOOL_NOT_PRICED");
    }

    #[tokio::test]
    async fn test_unknown_work_proof_is_404() {
        let (app, _) = app();
        let response = app.oneshot(get("/work-proofs/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_identity_and_local_workload() {
        let (app, _) = app();
        let body = body_json(app.clone().oneshot(get("/identity/anonymous")).await.unwrap()).await;
        assert_eq!(body["caller"]["canonicalUUID"], crate::identity::ANONYMOUS_CALLER_KEY);

        let body = body_json(app.oneshot(get("/workload/bob")).await.unwrap()).await;
        assert_eq!(body["local"]["totalTasks"], 0);
        assert!(body.get("ledger").is_none());
    }

    #[tokio::test]
    async fn test_catalog_lists_pricing() {
        let (app, _) = app();
        let body = body_json(app.oneshot(get("/tools/catalog")).await.unwrap()).await;
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().any(|t| t["toolName"] == "search" && t["policy"] == "flat_per_call"));
    }

    #[tokio::test]
    async fn test_proxy_stream_lifecycle() {
        let (app, state) = app();
        let response = app.clone().oneshot(get("/proxy/cfg1/sse")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut stream = response.into_body().into_data_stream();
        let first = stream.next().await.unwrap().unwrap();
        let first = String::from_utf8(first.to_vec()).unwrap();
        assert!(first.contains("event: endpoint"));
        assert!(first.contains("/proxy/messages?sessionId="));

        assert_eq!(state.registry.session_count(), 1);
        assert_eq!(state.registry.list_active_config_ids(), vec!["cfg1".to_string()]);
        let handle = state.registry.get_client("proxy_cfg1").unwrap();
        assert!(handle.client.is_live());

        // Remote goes away
        drop(stream);
        assert_eq!(state.registry.session_count(), 0);
        assert!(state.registry.get_client("proxy_cfg1").is_err());
        assert!(!handle.client.is_live());
    }

    #[tokio::test]
    async fn test_proxy_message_validation() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(post_json("/proxy/messages?sessionId=nope", json!({"jsonrpc": "2.0", "id": 1, "result": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.clone().oneshot(get("/proxy/messages?sessionId=nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/proxy/messages")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_proxy_inbox_and_ping() {
        let (app, _state) = app();
        let response = app.clone().oneshot(get("/proxy/cfg1/sse")).await.unwrap();
        let mut stream = response.into_body().into_data_stream();
        let first = String::from_utf8(stream.next().await.unwrap().unwrap().to_vec()).unwrap();
        let endpoint = first
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap()
            .trim()
            .to_string();

        let notification = json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"});
        let response = app.clone().oneshot(post_json(&endpoint, notification)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = body_json(app.clone().oneshot(get(&endpoint)).await.unwrap()).await;
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["method"], "notifications/tools/list_changed");
        // Reading empties the inbox
        let body = body_json(app.clone().oneshot(get(&endpoint)).await.unwrap()).await;
        assert!(body["messages"].as_array().unwrap().is_empty());

        // A ping from the remote is answered down the stream
        let ping = json!({"jsonrpc": "2.0", "id": 7, "method": "ping"});
        app.clone().oneshot(post_json(&endpoint, ping)).await.unwrap();
        let event = String::from_utf8(stream.next().await.unwrap().unwrap().to_vec()).unwrap();
        assert!(event.contains("event: message"));
        assert!(event.contains(r#""id":7"#));
        assert!(event.contains(r#""result":{}"#));
    }
}
