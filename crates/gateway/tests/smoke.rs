use futures_util::{sink::SinkExt, stream::StreamExt};
use parley_core::{Collaborators, GatewayConfig, RelayConfig};
use parley_gateway::{GatewayServer, MethodHandlers, SessionController, TokenAuth};
use parley_store::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

const TOKEN: &str = "smoke-token-abcdefghijklmnopqrstuvwxyz0123";

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn next_frame(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

async fn request(client: &mut Client, id: &str, method: &str, params: Value) -> Value {
    let frame = json!({"type": "req", "data": {"id": id, "method": method, "params": params}});
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
    loop {
        let frame = next_frame(client).await;
        if frame["type"] == "res" && frame["data"]["id"] == id {
            return frame["data"].clone();
        }
    }
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let store = MemoryStore::new();
    store.add_user("u1", "Alice", None).await;
    store.add_room("r1", "General").await;
    store.add_member("r1", "u1").await.unwrap();

    let relay_config = RelayConfig::default();
    let controller = Arc::new(SessionController::new(
        Collaborators::from_backend(store),
        &relay_config,
    ));
    let auth = TokenAuth::new();
    auth.register(TOKEN, "u1", "user").await.unwrap();
    let handlers = MethodHandlers::new(controller, Arc::new(auth), false);

    let config = GatewayConfig {
        tick_interval_ms: 0,
        ..GatewayConfig::default()
    };
    let ws_path = config.ws_path.clone();
    let server = GatewayServer::new(config, relay_config, handlers);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.serve_listener(listener, async move {
        let _ = stop_rx.await;
    }));

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", addr, ws_path))
        .await
        .unwrap();

    let hello = next_frame(&mut client).await;
    assert_eq!(hello["type"], "res");
    assert_eq!(hello["data"]["id"], "hello");
    assert_eq!(hello["data"]["payload"]["online_user_ids"], json!([]));

    let res = request(&mut client, "1", "joinRoom", json!({"room_id": "r1"})).await;
    assert_eq!(res["error"]["code"], "NOT_IDENTIFIED");

    let res = request(&mut client, "2", "identify", json!({"token": TOKEN})).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["user_id"], "u1");

    let res = request(&mut client, "3", "joinRoom", json!({"room_id": "r1"})).await;
    assert_eq!(res["payload"]["joined"], "r1");

    let res = request(
        &mut client,
        "4",
        "sendGroupMessage",
        json!({"room_id": "r1", "text": "hello room"}),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["recipients"], 1);

    // The sender is subscribed, so the message comes back as an event
    let mut saw_message = false;
    for _ in 0..5 {
        let frame = next_frame(&mut client).await;
        if frame["data"]["event"] == "groupMessage" {
            assert_eq!(frame["data"]["payload"]["text"], "hello room");
            assert_eq!(frame["data"]["payload"]["sender"]["name"], "Alice");
            saw_message = true;
            break;
        }
    }
    assert!(saw_message);

    stop_tx.send(()).unwrap();
    let mut saw_shutdown = false;
    for _ in 0..5 {
        let frame = next_frame(&mut client).await;
        if frame["data"]["event"] == "shutdown" {
            saw_shutdown = true;
            break;
        }
    }
    assert!(saw_shutdown);
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_path_rejected() {
    let controller = Arc::new(SessionController::new(
        Collaborators::from_backend(MemoryStore::new()),
        &RelayConfig::default(),
    ));
    let handlers = MethodHandlers::new(controller, Arc::new(TokenAuth::new()), true);
    let server = GatewayServer::new(
        GatewayConfig {
            tick_interval_ms: 0,
            ..GatewayConfig::default()
        },
        RelayConfig::default(),
        handlers,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.serve_listener(listener, async move {
        let _ = stop_rx.await;
    }));

    let result = tokio_tungstenite::connect_async(format!("ws://{}/elsewhere", addr)).await;
    assert!(result.is_err());

    stop_tx.send(()).unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let controller = Arc::new(SessionController::new(
        Collaborators::from_backend(MemoryStore::new()),
        &RelayConfig::default(),
    ));
    let handlers = MethodHandlers::new(controller, Arc::new(TokenAuth::new()), true);
    let config = GatewayConfig {
        tick_interval_ms: 0,
        max_payload: 1024,
        ..GatewayConfig::default()
    };
    let url_path = config.ws_path.clone();
    let server = GatewayServer::new(config, RelayConfig::default(), handlers);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.serve_listener(listener, async move {
        let _ = stop_rx.await;
    }));
    let url = format!("ws://{}{}", addr, url_path);

    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    next_frame(&mut client).await;

    let params = json!({"user_id": "u1", "padding": "x".repeat(4096)});
    let frame = json!({"type": "req", "data": {"id": "big", "method": "identify", "params": params}});
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();

    // The server answers with an error and a close, or just drops the socket
    let mut closed = false;
    for _ in 0..5 {
        let next = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["data"]["error"]["code"], "INVALID_REQUEST");
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                closed = true;
                break;
            }
            Some(Ok(_)) => {}
        }
    }
    assert!(closed);

    // Other connections are unaffected
    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    next_frame(&mut client).await;
    let res = request(&mut client, "1", "health", json!({})).await;
    assert_eq!(res["ok"], true);

    stop_tx.send(()).unwrap();
    server_task.await.unwrap().unwrap();
}
