//! End-to-end greeting flows over real localhost HTTP: agent-supplied
//! inputs and service-demanded inputs.

use std::sync::Arc;
use std::sync::Once;

use anyhow::Result;
use asmv::{
    AgentEndpoint, ClientStatus, CommandDefinition, FnHandler, InputEntry, InvokeParams,
    IoTypeDescriptor, MemoryContextStore, Message, ReturnItem, ServiceContext, ServiceDefinition,
    ServiceEndpoint,
};
use serde_json::json;

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

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
                ctx.set_state(&json!({ "name": name }))?;
                ctx.return_data("Greetings", format!("Hello, {name}!"), None)?;
                ctx.finish().await
            })),
        )
        .unwrap()
}

fn name_input(value: &str) -> InputEntry {
    InputEntry {
        input_type: "name".into(),
        value: json!(value),
    }
}

#[tokio::test]
async fn test_agent_first_greeting() -> Result<()> {
    init_tracing();
    let (service_url, endpoint, store) = start_service(greet_service()).await;
    let agent = start_agent().await;

    let ctx = agent
        .invoke(
            &service_url,
            "greet",
            InvokeParams {
                inputs: vec![name_input("John")],
                ..Default::default()
            },
        )
        .await?;

    let mut stream = ctx.messages();
    match stream.next().await.unwrap() {
        Message::Return { items, close, .. } => {
            assert!(close);
            assert_eq!(
                items,
                vec![ReturnItem::Output {
                    output_type: "Greetings".into(),
                    data: json!("Hello, John!"),
                    summary: None,
                }]
            );
        }
        other => panic!("unexpected first message: {other:?}"),
    }
    // Exactly one message; the stream then ends.
    assert_eq!(stream.next().await, None);
    assert_eq!(ctx.status(), ClientStatus::Finished);

    // The service side settled completely.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(endpoint.manager().is_empty());
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_service_first_input_demand() -> Result<()> {
    init_tracing();
    let (service_url, _endpoint, _store) = start_service(greet_service()).await;
    let agent = start_agent().await;

    let ctx = agent
        .invoke(&service_url, "greet", InvokeParams::default())
        .await?;

    let mut stream = ctx.messages();
    let request = stream.next().await.unwrap();
    match &request {
        Message::RequestInput { inputs } => {
            let descriptor = inputs.get("name").unwrap();
            assert_eq!(descriptor.min_count, Some(1));
            assert_eq!(descriptor.required, Some(true));
            assert_eq!(descriptor.schema, Some(json!({ "type": "string" })));
        }
        other => panic!("expected an input request, got {other:?}"),
    }

    ctx.provide_inputs(vec![name_input("John")]).await.unwrap();

    match stream.next().await.unwrap() {
        Message::Return { items, close, .. } => {
            assert!(close);
            assert_eq!(
                items,
                vec![ReturnItem::Output {
                    output_type: "Greetings".into(),
                    data: json!("Hello, John!"),
                    summary: None,
                }]
            );
        }
        other => panic!("unexpected message: {other:?}"),
    }
    assert_eq!(stream.next().await, None);
    Ok(())
}

#[tokio::test]
async fn test_two_invocations_do_not_interfere() {
    init_tracing();
    let (service_url, _endpoint, _store) = start_service(greet_service()).await;
    let agent = start_agent().await;

    let ctx_a = agent
        .invoke(
            &service_url,
            "greet",
            InvokeParams {
                inputs: vec![name_input("Ada")],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ctx_b = agent
        .invoke(
            &service_url,
            "greet",
            InvokeParams {
                inputs: vec![name_input("Bob")],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for (ctx, expected) in [(ctx_a, "Hello, Ada!"), (ctx_b, "Hello, Bob!")] {
        let mut stream = ctx.messages();
        match stream.next().await.unwrap() {
            Message::Return { items, .. } => match &items[0] {
                ReturnItem::Output { data, .. } => assert_eq!(data, &json!(expected)),
                other => panic!("unexpected item: {other:?}"),
            },
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
