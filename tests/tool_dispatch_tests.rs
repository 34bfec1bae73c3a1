use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use livelink_rt::media::NoDevices;
use livelink_rt::protocol::client_events::ClientEvent;
use livelink_rt::protocol::models::ToolResponse;
use livelink_rt::protocol::server_events::ServerMessage;
use livelink_rt::sdk::transport::BoxFuture;
use livelink_rt::sdk::{Realtime, SessionEvent, SessionState, Transport};
use livelink_rt::{DeviceArbiter, DeviceOwner, Error, Result, ToolRegistry};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

struct ChannelTransport {
    incoming: mpsc::Receiver<ServerMessage>,
    outgoing: mpsc::Sender<ClientEvent>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'_, Result<()>> {
        let outgoing = self.outgoing.clone();
        Box::pin(async move { outgoing.send(event).await.map_err(|_| Error::ConnectionClosed) })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<ServerMessage>>> {
        Box::pin(async move { Ok(self.incoming.recv().await) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn channel_transport() -> (Box<dyn Transport>, mpsc::Sender<ServerMessage>, mpsc::Receiver<ClientEvent>) {
    let (server, incoming) = mpsc::channel(8);
    let (outgoing, out) = mpsc::channel(64);
    (Box::new(ChannelTransport { incoming, outgoing }), server, out)
}

#[derive(Deserialize, JsonSchema)]
struct DelayArgs {
    millis: u64,
}

fn registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.tool_with_description("slow", "Sleeps, then answers", |args: DelayArgs| async move {
        tokio::time::sleep(Duration::from_millis(args.millis)).await;
        Ok(json!({ "slept": args.millis }))
    });
    tools.tool("fail", |_: Value| async move {
        Err::<Value, _>(Error::InvalidClientEvent("lookup failed".to_string()))
    });
    tools.tool("panic", |_: Value| async move {
        if true {
            panic!("handler bug");
        }
        Ok(Value::Null)
    });
    tools
}

async fn responses(out: &mut mpsc::Receiver<ClientEvent>, count: usize) -> HashMap<String, ToolResponse> {
    let mut answered = HashMap::new();
    while answered.len() < count {
        let event = tokio::time::timeout(Duration::from_secs(2), out.recv())
            .await
            .expect("tool responses arrive")
            .expect("transport open");
        if let ClientEvent::ToolResponse(response) = event {
            assert!(
                answered.insert(response.id.clone(), response).is_none(),
                "an invocation was answered twice"
            );
        }
    }
    answered
}

#[tokio::test]
async fn every_invocation_id_gets_exactly_one_response() {
    let (transport, server, mut out) = channel_transport();
    let mut session = Realtime::builder()
        .tools(registry())
        .devices(Arc::new(NoDevices))
        .connect_with(transport)
        .await
        .unwrap();

    let calls = json!({ "toolCall": { "functionCalls": [
        { "id": "1", "name": "slow", "args": { "millis": 50 } },
        { "id": "2", "name": "slow", "args": { "millis": 0 } },
        { "id": "3", "name": "fail", "args": {} },
        { "id": "4", "name": "panic", "args": {} },
        { "id": "5", "name": "not_registered", "args": {} },
        { "id": "6", "name": "slow", "args": { "millis": "soon" } }
    ]}});
    server.send(serde_json::from_value(calls).unwrap()).await.unwrap();

    let answered = responses(&mut out, 6).await;
    assert_eq!(answered["1"].payload, json!({ "slept": 50 }));
    assert_eq!(answered["2"].payload, json!({ "slept": 0 }));
    assert_eq!(answered["3"].payload["error"], "Invalid client event: lookup failed");
    assert_eq!(answered["4"].payload, json!({ "error": "tool handler panicked" }));
    assert_eq!(answered["5"].payload, json!({ "error": "unsupported tool: not_registered" }));
    assert!(answered["6"].payload.get("error").is_some());
    assert_eq!(answered["5"].name, "not_registered");

    let extra = tokio::time::timeout(Duration::from_millis(100), out.recv()).await;
    assert!(!matches!(extra, Ok(Some(ClientEvent::ToolResponse(_)))));

    let mut seen = 0;
    while seen < 6 {
        let event = tokio::time::timeout(Duration::from_secs(1), session.next_event())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, SessionEvent::ToolResult(_)) {
            seen += 1;
        }
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn setup_declares_registered_tools() {
    let (transport, _server, mut out) = channel_transport();
    let _session = Realtime::builder()
        .system_prompt("Plan a day out.")
        .tools(registry())
        .devices(Arc::new(NoDevices))
        .connect_with(transport)
        .await
        .unwrap();

    match out.recv().await.unwrap() {
        ClientEvent::Setup(setup) => {
            let names: Vec<_> = setup.tools.iter().map(|t| t.name.as_str()).collect();
            assert_eq!(names, ["slow", "fail", "panic"]);
            assert_eq!(setup.tools[0].description.as_deref(), Some("Sleeps, then answers"));
            assert_eq!(setup.system_instruction.as_deref(), Some("Plan a day out."));
        }
        other => panic!("unexpected first message: {other:?}"),
    }
}

#[tokio::test]
async fn a_call_holding_the_device_blocks_the_session() {
    let arbiter = DeviceArbiter::new();
    let lease = arbiter.acquire(DeviceOwner::Call).unwrap();

    let (transport, _server, _out) = channel_transport();
    let err = Realtime::builder()
        .devices(Arc::new(NoDevices))
        .arbiter(arbiter.clone())
        .connect_with(transport)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::DeviceBusy("a call")));

    drop(lease);
    let (transport, _server, _out) = channel_transport();
    let session = Realtime::builder()
        .devices(Arc::new(NoDevices))
        .arbiter(arbiter.clone())
        .connect_with(transport)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(arbiter.current_owner(), Some(DeviceOwner::StreamingSession));

    session.close().await.unwrap();
    assert_eq!(arbiter.current_owner(), None);
}
