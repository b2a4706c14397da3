// Gateway Method Handlers
//
// Routes client requests to the session controller and shapes the replies.

use crate::lifecycle::SessionController;
use crate::protocol::*;
use crate::registry::BindOutcome;
use parley_core::{Identity, IdentityProvider};
use serde::de::DeserializeOwned;
use serde_json::json;
use serde_json::Value as JsonValue;
use std::sync::Arc;

type HandlerResult = Result<JsonValue, ProtocolError>;

pub struct MethodHandlers {
    controller: Arc<SessionController>,
    identity: Arc<dyn IdentityProvider>,
    /// Trust a bare `user_id` on identify when no token is given
    allow_unauthenticated: bool,
}

fn parse_params<T: DeserializeOwned>(request: &GatewayRequest) -> Result<T, ProtocolError> {
    let params = if request.params.is_null() {
        json!({})
    } else {
        request.params.clone()
    };
    serde_json::from_value(params).map_err(|e| {
        ProtocolError::new(
            ProtocolError::INVALID_REQUEST,
            format!("Invalid params for '{}': {}", request.method, e),
        )
    })
}

fn validate_request(request: &GatewayRequest) -> Result<(), ProtocolError> {
    if request.id.trim().is_empty() {
        return Err(ProtocolError::new(
            ProtocolError::INVALID_REQUEST,
            "Request id cannot be empty",
        ));
    }
    Ok(())
}

impl MethodHandlers {
    pub fn new(
        controller: Arc<SessionController>,
        identity: Arc<dyn IdentityProvider>,
        allow_unauthenticated: bool,
    ) -> Self {
        Self {
            controller,
            identity,
            allow_unauthenticated,
        }
    }

    pub fn controller(&self) -> Arc<SessionController> {
        Arc::clone(&self.controller)
    }

    /// Handle one request on behalf of a connection
    pub async fn dispatch(&self, connection_id: &str, request: &GatewayRequest) -> GatewayResponse {
        if let Err(error) = validate_request(request) {
            return GatewayResponse::error(request.id.clone(), error);
        }
        tracing::debug!("{} -> {}", connection_id, request.method);

        let result = match request.method.as_str() {
            "identify" => self.identify(connection_id, request).await,
            "joinRoom" => self.join_room(connection_id, request).await,
            "leaveRoom" => self.leave_room(connection_id, request).await,
            "joinDirect" => self.join_direct(connection_id, request).await,
            "leaveDirect" => self.leave_direct(connection_id, request).await,
            "sendGroupMessage" => self.send_group_message(connection_id, request).await,
            "sendDirectMessage" => self.send_direct_message(connection_id, request).await,
            "history" => self.history(connection_id, request).await,
            "markRead" => self.mark_read(connection_id, request).await,
            "health" => self.health().await,
            "status" => self.status().await,
            other => Err(ProtocolError::new(
                ProtocolError::INVALID_REQUEST,
                format!("Unknown method: {}", other),
            )),
        };

        match result {
            Ok(payload) => GatewayResponse::ok(request.id.clone(), payload),
            Err(error) => {
                tracing::debug!(
                    "{} {} failed: {} ({})",
                    connection_id,
                    request.method,
                    error.message,
                    error.code
                );
                GatewayResponse::error(request.id.clone(), error)
            }
        }
    }

    async fn identify(&self, connection_id: &str, request: &GatewayRequest) -> HandlerResult {
        let params: IdentifyParams = parse_params(request)?;
        let token = params.token.as_deref().or(request.signature.as_deref());

        let identity = match token {
            Some(token) => {
                let identity = self.identity.resolve(token).await.ok_or_else(|| {
                    ProtocolError::new(ProtocolError::UNAUTHORIZED, "Invalid or expired token")
                })?;
                if let Some(claimed) = &params.user_id {
                    if claimed != &identity.user_id {
                        return Err(ProtocolError::new(
                            ProtocolError::UNAUTHORIZED,
                            format!("Token does not belong to '{}'", claimed),
                        ));
                    }
                }
                identity
            }
            None if self.allow_unauthenticated => {
                let user_id = params
                    .user_id
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        ProtocolError::new(
                            ProtocolError::INVALID_REQUEST,
                            "Missing 'user_id' parameter",
                        )
                    })?;
                Identity {
                    user_id,
                    role: "user".to_string(),
                }
            }
            None => {
                return Err(ProtocolError::new(
                    ProtocolError::UNAUTHORIZED,
                    "Authentication required: missing token",
                ))
            }
        };

        let outcome = self.controller.identify(connection_id, &identity).await?;
        Ok(json!({
            "user_id": identity.user_id,
            "role": identity.role,
            "already_identified": outcome == BindOutcome::Unchanged,
        }))
    }

    async fn join_room(&self, connection_id: &str, request: &GatewayRequest) -> HandlerResult {
        let params: RoomParams = parse_params(request)?;
        let snapshot = self
            .controller
            .join_room(connection_id, &params.room_id)
            .await?;
        Ok(json!({
            "joined": params.room_id,
            "members": snapshot.user_ids(),
        }))
    }

    async fn leave_room(&self, connection_id: &str, request: &GatewayRequest) -> HandlerResult {
        let params: RoomParams = parse_params(request)?;
        self.controller
            .leave_room(connection_id, &params.room_id)
            .await?;
        Ok(json!({ "left": params.room_id }))
    }

    async fn join_direct(&self, connection_id: &str, request: &GatewayRequest) -> HandlerResult {
        let params: PeerParams = parse_params(request)?;
        let joined = self
            .controller
            .join_direct(connection_id, &params.peer_id)
            .await?;
        Ok(json!({
            "joined": joined.pairing_key.to_string(),
            "peer_online": joined.peer_online,
        }))
    }

    async fn leave_direct(&self, connection_id: &str, request: &GatewayRequest) -> HandlerResult {
        let params: PeerParams = parse_params(request)?;
        let key = self
            .controller
            .leave_direct(connection_id, &params.peer_id)
            .await?;
        Ok(json!({ "left": key.to_string() }))
    }

    async fn send_group_message(
        &self,
        connection_id: &str,
        request: &GatewayRequest,
    ) -> HandlerResult {
        let params: SendGroupParams = parse_params(request)?;
        let delivery = self
            .controller
            .send_group(connection_id, &params.room_id, params.body)
            .await?;
        Ok(json!({
            "message": delivery.message,
            "recipients": delivery.recipients,
        }))
    }

    async fn send_direct_message(
        &self,
        connection_id: &str,
        request: &GatewayRequest,
    ) -> HandlerResult {
        let params: SendDirectParams = parse_params(request)?;
        let delivery = self
            .controller
            .send_direct(connection_id, &params.peer_id, params.body)
            .await?;
        Ok(json!({
            "message": delivery.message,
            "recipients": delivery.recipients,
        }))
    }

    async fn history(&self, connection_id: &str, request: &GatewayRequest) -> HandlerResult {
        let params: HistoryParams = parse_params(request)?;
        let messages = match (&params.room_id, &params.peer_id) {
            (Some(room_id), None) => {
                self.controller
                    .group_history(connection_id, room_id, params.limit)
                    .await?
            }
            (None, Some(peer_id)) => {
                self.controller
                    .direct_history(connection_id, peer_id, params.limit)
                    .await?
            }
            _ => {
                return Err(ProtocolError::new(
                    ProtocolError::INVALID_REQUEST,
                    "Exactly one of 'room_id' or 'peer_id' is required",
                ))
            }
        };
        Ok(json!({ "messages": messages }))
    }

    async fn mark_read(&self, connection_id: &str, request: &GatewayRequest) -> HandlerResult {
        let params: PeerParams = parse_params(request)?;
        let updated = self
            .controller
            .mark_read(connection_id, &params.peer_id)
            .await?;
        Ok(json!({ "updated": updated }))
    }

    async fn health(&self) -> HandlerResult {
        let stats = self.controller.stats().await;
        Ok(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_ms": stats.uptime_ms,
            "connections": stats.connections,
        }))
    }

    async fn status(&self) -> HandlerResult {
        let stats = self.controller.stats().await;
        let online = self.controller.online_users().await;
        Ok(json!({
            "stats": stats,
            "online_user_ids": online,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAuth;
    use parley_core::{Collaborators, RelayConfig};
    use parley_store::MemoryStore;
    use tokio::sync::mpsc;

    const TOKEN: &str = "test-token-abcdefghijklmnopqrstuvwxyz123456";

    async fn handlers(
        allow_unauthenticated: bool,
    ) -> (MethodHandlers, String, mpsc::Receiver<GatewayEvent>) {
        let store = MemoryStore::new();
        store.add_room("r1", "General").await;
        store.add_member("r1", "u1").await.unwrap();

        let controller = Arc::new(SessionController::new(
            Collaborators::from_backend(store),
            &RelayConfig::default(),
        ));
        let auth = TokenAuth::new();
        auth.register(TOKEN, "u1", "user").await.unwrap();

        let (tx, rx) = mpsc::channel(64);
        let conn = controller.open(tx).await.connection_id;
        (
            MethodHandlers::new(controller, Arc::new(auth), allow_unauthenticated),
            conn,
            rx,
        )
    }

    fn request(method: &str, params: JsonValue) -> GatewayRequest {
        GatewayRequest::new("req-1", method, params)
    }

    fn error_code(response: &GatewayResponse) -> Option<&str> {
        response.error.as_ref().map(|e| e.code.as_str())
    }

    #[tokio::test]
    async fn test_identify_requires_token() {
        let (handlers, conn, _rx) = handlers(false).await;
        let response = handlers
            .dispatch(&conn, &request("identify", json!({"user_id": "u1"})))
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_identify_rejects_invalid_token() {
        let (handlers, conn, _rx) = handlers(false).await;
        let response = handlers
            .dispatch(
                &conn,
                &request("identify", json!({"token": "Bearer invalid-token"})),
            )
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_identify_with_signature_then_rebind_fails() {
        let (handlers, conn, _rx) = handlers(false).await;
        let req = request("identify", JsonValue::Null).with_signature(format!("Bearer {}", TOKEN));
        let response = handlers.dispatch(&conn, &req).await;
        assert!(response.ok, "{:?}", response.error);
        assert_eq!(response.payload.unwrap()["user_id"], "u1");

        let response = handlers.dispatch(&conn, &req).await;
        assert!(response.ok);
        assert_eq!(response.payload.unwrap()["already_identified"], true);
    }

    #[tokio::test]
    async fn test_identify_claim_must_match_token() {
        let (handlers, conn, _rx) = handlers(false).await;
        let response = handlers
            .dispatch(
                &conn,
                &request("identify", json!({"token": TOKEN, "user_id": "u2"})),
            )
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_unauthenticated_mode_trusts_user_id() {
        let (handlers, conn, _rx) = handlers(true).await;
        let response = handlers
            .dispatch(&conn, &request("identify", json!({"user_id": "u1"})))
            .await;
        assert!(response.ok);

        let response = handlers
            .dispatch(&conn, &request("identify", json!({"user_id": "u2"})))
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::ALREADY_BOUND));
    }

    #[tokio::test]
    async fn test_join_room_errors() {
        let (handlers, conn, _rx) = handlers(true).await;
        let response = handlers
            .dispatch(&conn, &request("joinRoom", json!({"room_id": "r1"})))
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::NOT_IDENTIFIED));

        handlers
            .dispatch(&conn, &request("identify", json!({"user_id": "u1"})))
            .await;
        let response = handlers
            .dispatch(&conn, &request("joinRoom", json!({"room_id": "nope"})))
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::UNKNOWN_ROOM));

        let response = handlers
            .dispatch(&conn, &request("joinRoom", json!({})))
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::INVALID_REQUEST));

        let response = handlers
            .dispatch(&conn, &request("joinRoom", json!({"room_id": "r1"})))
            .await;
        assert!(response.ok);
        assert_eq!(response.payload.unwrap()["members"], json!(["u1"]));
    }

    #[tokio::test]
    async fn test_send_returns_stored_message() {
        let (handlers, conn, _rx) = handlers(true).await;
        handlers
            .dispatch(&conn, &request("identify", json!({"user_id": "u1"})))
            .await;
        handlers
            .dispatch(&conn, &request("joinRoom", json!({"room_id": "r1"})))
            .await;

        let response = handlers
            .dispatch(
                &conn,
                &request("sendGroupMessage", json!({"room_id": "r1", "text": "  hi  "})),
            )
            .await;
        assert!(response.ok, "{:?}", response.error);
        let payload = response.payload.unwrap();
        assert_eq!(payload["message"]["text"], "hi");
        assert_eq!(payload["message"]["room_id"], "r1");
        assert_eq!(payload["recipients"], 1);

        let response = handlers
            .dispatch(
                &conn,
                &request("sendGroupMessage", json!({"room_id": "r1", "text": "   "})),
            )
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::INVALID_PAYLOAD));

        let response = handlers
            .dispatch(&conn, &request("history", json!({"room_id": "r1"})))
            .await;
        assert_eq!(response.payload.unwrap()["messages"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_direct_send_error_codes() {
        let (handlers, conn, _rx) = handlers(true).await;
        handlers
            .dispatch(&conn, &request("identify", json!({"user_id": "u1"})))
            .await;

        let response = handlers
            .dispatch(
                &conn,
                &request("sendDirectMessage", json!({"peer_id": "u1", "text": "me"})),
            )
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::INVALID_PAYLOAD));

        let response = handlers
            .dispatch(
                &conn,
                &request("sendDirectMessage", json!({"peer_id": "  ", "text": "hi"})),
            )
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::INVALID_REQUEST));
    }

    #[tokio::test]
    async fn test_history_requires_exactly_one_target() {
        let (handlers, conn, _rx) = handlers(true).await;
        handlers
            .dispatch(&conn, &request("identify", json!({"user_id": "u1"})))
            .await;
        let response = handlers
            .dispatch(
                &conn,
                &request("history", json!({"room_id": "r1", "peer_id": "u2"})),
            )
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::INVALID_REQUEST));
    }

    #[tokio::test]
    async fn test_unknown_method_and_empty_id() {
        let (handlers, conn, _rx) = handlers(true).await;
        let response = handlers
            .dispatch(&conn, &request("agent", JsonValue::Null))
            .await;
        assert_eq!(error_code(&response), Some(ProtocolError::INVALID_REQUEST));

        let response = handlers
            .dispatch(&conn, &GatewayRequest::new(" ", "health", JsonValue::Null))
            .await;
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (handlers, conn, _rx) = handlers(true).await;
        let response = handlers
            .dispatch(&conn, &request("health", JsonValue::Null))
            .await;
        assert!(response.ok);
        assert_eq!(response.payload.unwrap()["connections"], 1);

        handlers
            .dispatch(&conn, &request("identify", json!({"user_id": "u1"})))
            .await;
        let response = handlers
            .dispatch(&conn, &request("status", JsonValue::Null))
            .await;
        let payload = response.payload.unwrap();
        assert_eq!(payload["online_user_ids"], json!(["u1"]));
        assert_eq!(payload["stats"]["online_users"], 1);
    }
}
