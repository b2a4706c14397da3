use crate::handlers::MethodHandlers;
use crate::lifecycle::SessionController;
use crate::protocol::*;
use anyhow::{Context, Result};
use futures_util::{sink::SinkExt, stream::StreamExt};
use parley_core::{GatewayConfig, RelayConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;

/// Gateway server
pub struct GatewayServer {
    config: GatewayConfig,
    relay_config: RelayConfig,
    handlers: Arc<MethodHandlers>,
    controller: Arc<SessionController>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, relay_config: RelayConfig, handlers: MethodHandlers) -> Self {
        let controller = handlers.controller();
        Self {
            config,
            relay_config,
            handlers: Arc::new(handlers),
            controller,
        }
    }

    pub fn controller(&self) -> Arc<SessionController> {
        self.controller.clone()
    }

    /// Serve until ctrl-c
    pub async fn start(self) -> Result<()> {
        self.serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then tell every client we are going away
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tracing::info!(
            "Gateway server listening on ws://{}{}",
            listener.local_addr()?,
            self.config.ws_path
        );

        let ticker = self.spawn_ticker();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let handlers = self.handlers.clone();
                            let controller = self.controller.clone();
                            let policy = self.policy();
                            let ws_path = self.config.ws_path.clone();
                            let outbox_capacity = self.config.outbox_capacity;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    stream,
                                    addr.to_string(),
                                    ws_path,
                                    policy,
                                    outbox_capacity,
                                    handlers,
                                    controller,
                                )
                                .await
                                {
                                    tracing::warn!("Connection error from {}: {:#}", addr, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Accept failed: {}", e),
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        if let Some(ticker) = ticker {
            ticker.abort();
        }
        let notified = self
            .controller
            .broadcast(GatewayEvent::Shutdown(ShutdownEvent {
                reason: "gateway stopping".to_string(),
                restart_expected_ms: None,
            }))
            .await;
        tracing::info!("Gateway stopped, notified {} connection(s)", notified);

        // Give connection tasks a moment to flush the shutdown event
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    fn policy(&self) -> GatewayPolicy {
        GatewayPolicy {
            max_payload: self.config.max_payload,
            max_message_len: self.relay_config.max_message_len,
            tick_interval_ms: self.config.tick_interval_ms,
        }
    }

    fn spawn_ticker(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.config.tick_interval_ms == 0 {
            return None;
        }
        let controller = self.controller.clone();
        let period = Duration::from_millis(self.config.tick_interval_ms);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let ts = chrono::Utc::now().timestamp_millis();
                controller.broadcast(GatewayEvent::Tick { ts }).await;
            }
        }))
    }
}

// Handle a WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: String,
    ws_path: String,
    policy: GatewayPolicy,
    outbox_capacity: usize,
    handlers: Arc<MethodHandlers>,
    controller: Arc<SessionController>,
) -> Result<()> {
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == ws_path {
            Ok(response)
        } else {
            let mut error = ErrorResponse::new(Some("not found".to_string()));
            *error.status_mut() = StatusCode::NOT_FOUND;
            Err(error)
        }
    };

    // Oversized frames are refused while reading, before they are buffered
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(policy.max_payload))
        .max_frame_size(Some(policy.max_payload));
    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, Some(ws_config))
            .await
            .context("WebSocket handshake failed")?;

    tracing::info!("WebSocket connection established from {}", addr);

    let (outbox, events) = mpsc::channel(outbox_capacity.max(1));
    let opened = controller.open(outbox).await;
    let conn_id = opened.connection_id.clone();

    let result = connection_loop(ws_stream, opened, policy, events, &handlers, &controller).await;

    // Runs whether the peer closed cleanly or the socket failed
    controller.close(&conn_id).await;
    tracing::info!("Connection {} from {} closed", conn_id, addr);
    result
}

async fn connection_loop(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    opened: crate::lifecycle::OpenedSession,
    policy: GatewayPolicy,
    mut events: mpsc::Receiver<GatewayEvent>,
    handlers: &MethodHandlers,
    controller: &SessionController,
) -> Result<()> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split::<Message>();
    let conn_id = opened.connection_id.clone();

    // Send hello with the online snapshot
    let hello = HelloOkPayload {
        protocol: ProtocolVersion::default(),
        connection_id: opened.connection_id,
        online_user_ids: opened.online_user_ids,
        state_version: opened.state_version,
        uptime_ms: controller.uptime_ms(),
        policy,
    };
    let hello_response = GatewayFrame::Response(GatewayResponse::ok(
        HELLO_ID.to_string(),
        serde_json::to_value(hello)?,
    ));
    ws_sender
        .send(Message::Text(serde_json::to_string(&hello_response)?.into()))
        .await?;

    loop {
        tokio::select! {
            // Handle incoming WebSocket messages (requests)
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(msg)) => {
                        if msg.is_text() {
                            let text = msg.to_text()?;
                            let response = match serde_json::from_str::<GatewayFrame>(text) {
                                Ok(GatewayFrame::Request(request)) => {
                                    Some(handlers.dispatch(&conn_id, &request).await)
                                }
                                Ok(_) => None,
                                Err(e) => {
                                    tracing::debug!("Unparseable frame from {}: {}", conn_id, e);
                                    Some(GatewayResponse::error(
                                        String::new(),
                                        ProtocolError::new(
                                            ProtocolError::INVALID_REQUEST,
                                            format!("Malformed frame: {}", e),
                                        ),
                                    ))
                                }
                            };

                            if let Some(response) = response {
                                let frame = GatewayFrame::Response(response);
                                ws_sender
                                    .send(Message::Text(serde_json::to_string(&frame)?.into()))
                                    .await?;
                            }
                        } else if msg.is_close() {
                            break;
                        }
                    }
                    Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, max_size }))) => {
                        tracing::warn!(
                            "Frame of {} bytes from {} exceeds {} bytes, closing",
                            size,
                            conn_id,
                            max_size
                        );
                        let frame = GatewayFrame::Response(GatewayResponse::error(
                            String::new(),
                            ProtocolError::new(
                                ProtocolError::INVALID_REQUEST,
                                format!("Frame exceeds {} bytes", max_size),
                            ),
                        ));
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&frame)?.into()))
                            .await;
                        let _ = ws_sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Size,
                                reason: "frame too large".into(),
                            })))
                            .await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error on {}: {}", conn_id, e);
                        break;
                    }
                    None => break,
                }
            }

            // Deliver queued events
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let shutting_down = matches!(event, GatewayEvent::Shutdown(_));
                        let frame = GatewayFrame::Event(event);
                        ws_sender
                            .send(Message::Text(serde_json::to_string(&frame)?.into()))
                            .await?;
                        if shutting_down {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}
