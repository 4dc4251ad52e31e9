use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};

use super::{require_collection, ApiError, ApiJson, AppState};
use crate::models::{ChatMessage, ChatRequest, ChatResponse};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/ws", get(chat_ws))
}

/// Frames sent to WebSocket clients, serialized as `{"type": .., "content": ..}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum ServerMessage {
    Start(String),
    Token(String),
    Complete(Box<ChatResponse>),
    Pong(String),
    Error(String),
}

/// Validates the request and fills in the stored history when a conversation is referenced.
async fn prepare_chat(
    state: &AppState,
    mut request: ChatRequest,
) -> Result<(ChatRequest, Option<String>), ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::bad_request("Query must not be empty"));
    }
    if let Some(name) = request
        .collection_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        require_collection(state, name).await?;
    }

    let conversation_id = request
        .conversation_id
        .clone()
        .filter(|id| !id.trim().is_empty());
    if let Some(id) = &conversation_id {
        let conversation = state
            .db
            .get_conversation(id)
            .await
            .map_err(ApiError::failed("load conversation"))?
            .ok_or_else(|| ApiError::not_found(format!("Conversation {id} not found")))?;
        if request.history.is_none() {
            request.history = Some(conversation.messages);
        }
    }

    Ok((request, conversation_id))
}

async fn record_exchange(
    state: &AppState,
    conversation_id: Option<&str>,
    request: &ChatRequest,
    response: &ChatResponse,
) -> Result<(), ApiError> {
    let Some(id) = conversation_id else {
        return Ok(());
    };

    let exchange = [
        ChatMessage::user(request.query.clone()),
        ChatMessage::assistant(response.answer.clone()),
    ];
    let found = state
        .db
        .append_messages(id, &exchange)
        .await
        .map_err(ApiError::failed("save conversation"))?;
    if !found {
        tracing::warn!("conversation {} disappeared before the reply was saved", id);
    }
    Ok(())
}

async fn chat(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ChatRequest>,
) -> Result<ApiJson<ChatResponse>, ApiError> {
    let (request, conversation_id) = prepare_chat(&state, request).await?;
    let response = state
        .rag
        .answer(&request)
        .await
        .map_err(ApiError::failed("generate response"))?;
    record_exchange(&state, conversation_id.as_deref(), &request, &response).await?;
    Ok(ApiJson(response))
}

async fn chat_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let forwarder = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!("failed to serialize websocket message: {}", err);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(raw)) => handle_client_message(&state, &raw, &tx).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("websocket receive error: {}", err);
                break;
            }
        }
    }

    drop(tx);
    let _ = forwarder.await;
    tracing::debug!("websocket client disconnected");
}

/// Processes one client frame, reporting every outcome (including errors) through `tx`.
pub async fn handle_client_message(state: &AppState, raw: &str, tx: &UnboundedSender<ServerMessage>) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => {
            let _ = tx.send(ServerMessage::Error("Invalid JSON".to_string()));
            return;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("ping") => {
            let _ = tx.send(ServerMessage::Pong("pong".to_string()));
        }
        Some("chat") => match serde_json::from_value::<ChatRequest>(value) {
            Ok(request) => stream_chat(state, request, tx).await,
            Err(err) => {
                let _ = tx.send(ServerMessage::Error(format!("Invalid chat request: {err}")));
            }
        },
        Some(other) => {
            let _ = tx.send(ServerMessage::Error(format!("Unknown message type: {other}")));
        }
        None => {
            let _ = tx.send(ServerMessage::Error("Message type is required".to_string()));
        }
    }
}

async fn stream_chat(state: &AppState, request: ChatRequest, tx: &UnboundedSender<ServerMessage>) {
    let outcome = async {
        let (request, conversation_id) = prepare_chat(state, request).await?;
        let _ = tx.send(ServerMessage::Start("Generating response...".to_string()));

        let token_tx = tx.clone();
        let response = state
            .rag
            .answer_streaming(&request, move |token| {
                let _ = token_tx.send(ServerMessage::Token(token.to_string()));
            })
            .await
            .map_err(ApiError::failed("generate response"))?;

        record_exchange(state, conversation_id.as_deref(), &request, &response).await?;
        Ok::<_, ApiError>(response)
    }
    .await;

    let message = match outcome {
        Ok(response) => ServerMessage::Complete(Box::new(response)),
        Err(err) => ServerMessage::Error(err.detail().to_string()),
    };
    let _ = tx.send(message);
}
