//! HTTP binding contract: manifest, version gate, authorization and
//! routing failures, and caller-side decoding of wire errors.

use std::sync::Arc;

use asmv::http::client::ServiceClient;
use asmv::http::TransportError;
use asmv::{
    AgentEndpoint, CommandDefinition, Error, FnHandler, InvokeParams, IoTypeDescriptor,
    MemoryContextStore, ServiceContext, ServiceDefinition, ServiceEndpoint,
};
use serde_json::{json, Value};

async fn start_service(
    definition: ServiceDefinition,
) -> (String, Arc<ServiceEndpoint>, Arc<MemoryContextStore>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let store = Arc::new(MemoryContextStore::new());
    let endpoint = ServiceEndpoint::new(definition, &base_url, store.clone());
    let router = endpoint.router();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    (base_url, endpoint, store)
}

async fn start_agent() -> Arc<AgentEndpoint> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let agent = AgentEndpoint::new(&base_url);
    let router = agent.router();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    agent
}

fn greet_service() -> ServiceDefinition {
    ServiceDefinition::new("greeter", "0.2.0")
        .unwrap()
        .describe("en", "A greeting service")
        .terms_url("https://example.com/terms")
        .accept_payment_schema("test+jwt")
        .register_command(
            CommandDefinition::new("greet")
                .describe("en", "Greets the caller")
                .input_type(
                    "name",
                    IoTypeDescriptor::text("Name to greet")
                        .with_schema(json!({ "type": "string" })),
                )
                .unwrap()
                .output_type(
                    "Greetings",
                    IoTypeDescriptor::text("The greeting")
                        .with_schema(json!({ "type": "string" })),
                )
                .unwrap(),
            Arc::new(FnHandler(|ctx: Arc<ServiceContext>| async move {
                let name: String = ctx.get_input("name").await?;
                ctx.return_data("Greetings", format!("Hello, {name}!"), None)?;
                ctx.finish().await
            })),
        )
        .unwrap()
}

fn invoke_headers(builder: reqwest::RequestBuilder, version: &str) -> reqwest::RequestBuilder {
    builder
        .header("x-asmv-protocol-version", version)
        .header("x-asmv-client-channel-id", "client-1")
        .header("x-asmv-client-channel-url", "http://127.0.0.1:1/channel")
        .header("x-asmv-client-channel-token", "client-token")
}

#[tokio::test]
async fn test_version_mismatch_is_rejected_without_creating_a_context() {
    let (service_url, endpoint, _store) = start_service(greet_service()).await;

    let response = invoke_headers(
        reqwest::Client::new().post(format!("{service_url}/invoke/greet")),
        "2.0.0",
    )
    .json(&json!({ "type": "invoke", "inputs": [] }))
    .send()
    .await
    .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorName"], "VersionNotSupported");
    assert_eq!(body["details"]["requestedVersion"], "2.0.0");
    assert_eq!(body["details"]["supportedVersions"], json!(["1.x"]));
    assert!(endpoint.manager().is_empty());
}

#[tokio::test]
async fn test_manifest_advertises_the_service() {
    let (service_url, _endpoint, _store) = start_service(greet_service()).await;

    let manifest = ServiceClient::new(&service_url).manifest().await.unwrap();
    assert_eq!(manifest.name, "greeter");
    assert_eq!(manifest.version, "0.2.0");
    assert_eq!(manifest.terms_url.as_deref(), Some("https://example.com/terms"));
    assert_eq!(manifest.accepted_payment_schemas, ["test+jwt"]);
    assert_eq!(manifest.commands.len(), 1);

    let command = &manifest.commands[0];
    assert_eq!(command.name, "greet");
    assert_eq!(command.endpoint_uri, format!("{service_url}/invoke/greet"));
    assert!(!command.requires_user_confirmation);
    assert!(command.input_types.contains_key("name"));
    assert!(command.output_types.contains_key("Greetings"));
}

#[tokio::test]
async fn test_unknown_command_decodes_as_command_not_found() {
    let (service_url, _endpoint, _store) = start_service(greet_service()).await;
    let agent = start_agent().await;

    let error = agent
        .invoke(&service_url, "teleport", InvokeParams::default())
        .await
        .unwrap_err();
    match error {
        Error::Transport(TransportError::Rejected { status, body, .. }) => {
            assert_eq!(status, 404);
            assert_eq!(body.unwrap().error_name, "CommandNotFound");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_invalid_invoke_reports_child_errors() {
    let (service_url, endpoint, _store) = start_service(greet_service()).await;

    let response = invoke_headers(
        reqwest::Client::new().post(format!("{service_url}/invoke/greet")),
        "1.0.0",
    )
    .json(&json!({
        "type": "invoke",
        "inputs": [{ "inputType": "name", "value": 42 }]
    }))
    .send()
    .await
    .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorName"], "InvalidRequest");
    assert_eq!(body["clientChannelId"], "client-1");
    let children = body["details"]["childErrors"].as_array().unwrap();
    assert!(!children.is_empty());
    assert_eq!(children[0]["name"], "InvalidInput");
    assert!(endpoint.manager().is_empty());
}

#[tokio::test]
async fn test_channel_authorization_and_routing() {
    let (service_url, _endpoint, _store) = start_service(greet_service()).await;
    let agent = start_agent().await;

    // Handler blocks in get_input, keeping the channel open.
    let ctx = agent
        .invoke(&service_url, "greet", InvokeParams::default())
        .await
        .unwrap();
    let channel = ctx.channel();
    let channel_url = channel.service_channel_url.clone().unwrap();
    let channel_id = channel.service_channel_id.clone().unwrap();
    let token = channel.service_channel_token.clone().unwrap();
    let http = reqwest::Client::new();
    let provide = json!({
        "type": "provideInput",
        "inputs": [{ "inputType": "name", "value": "John" }]
    });

    // Missing authorization.
    let response = http
        .post(&channel_url)
        .header("x-asmv-protocol-version", "1.0.0")
        .header("x-asmv-service-channel-id", &channel_id)
        .json(&provide)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorName"], "Unauthorized");

    // Wrong bearer token.
    let response = http
        .post(&channel_url)
        .header("x-asmv-protocol-version", "1.0.0")
        .header("x-asmv-service-channel-id", &channel_id)
        .header("authorization", "Bearer wrong")
        .json(&provide)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorName"], "Forbidden");

    // Unknown channel id (path-based routing schema).
    let response = http
        .post(format!("{service_url}/channel/no-such-channel"))
        .header("x-asmv-protocol-version", "1.0.0")
        .header("authorization", format!("Bearer {token}"))
        .json(&provide)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorName"], "SessionNotFound");

    // An invoke on an open channel is invalid.
    let response = http
        .post(format!("{service_url}/channel/{channel_id}"))
        .header("x-asmv-protocol-version", "1.0.0")
        .header("authorization", format!("Bearer {token}"))
        .json(&json!({ "type": "invoke", "inputs": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // A malformed message never reaches the context.
    let response = http
        .post(format!("{service_url}/channel/{channel_id}"))
        .header("x-asmv-protocol-version", "1.0.0")
        .header("authorization", format!("Bearer {token}"))
        .json(&json!({ "type": "warp" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorName"], "InvalidRequest");

    // The well-formed, authorized POST still goes through.
    let response = http
        .post(format!("{service_url}/channel/{channel_id}"))
        .header("x-asmv-protocol-version", "1.0.0")
        .header("authorization", format!("Bearer {token}"))
        .json(&provide)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let mut stream = ctx.messages();
    loop {
        match stream.next().await.unwrap() {
            asmv::Message::Return { items, close, .. } => {
                assert!(close);
                assert!(!items.is_empty());
                break;
            }
            // The handler may have asked for inputs before we provided one.
            asmv::Message::RequestInput { .. } => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
