//! Error paths and soft failures of the conversation pipeline.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use threadline_core::llm::{ChatMessage, ChatRequest, CompletionRequest, LlmError};
use threadline_core::{ConversationClient, ConversationError, PipelineError, StoreError};
use threadline_test_utils::provider::{chat_response, completion_response};
use threadline_test_utils::{FaultyStore, ScriptedProvider, StoreOp, capture_logs};
use tracing::Level;

fn prompt(user: &str, text: &str) -> CompletionRequest {
    CompletionRequest {
        user: user.to_string(),
        prompt: text.to_string(),
        ..CompletionRequest::default()
    }
}

fn setup() -> (Arc<ScriptedProvider>, Arc<FaultyStore>, ConversationClient) {
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(FaultyStore::new());
    let client = ConversationClient::new(provider.clone(), store.clone());
    (provider, store, client)
}

#[tokio::test]
async fn test_chat_without_user_message_touches_nothing() {
    let (provider, store, client) = setup();

    let request = ChatRequest {
        user: "alice".to_string(),
        messages: vec![
            ChatMessage::system("rules"),
            ChatMessage::assistant("hello"),
        ],
        ..ChatRequest::default()
    };
    let err = client.chat_complete_with_context(request).await.unwrap_err();

    assert!(matches!(
        err,
        ConversationError::Preprocess(PipelineError::NoUserMessage)
    ));
    assert_eq!(store.total_calls(), 0);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_reservation_at_limit_fails_before_any_io() {
    let (provider, store, client) = setup();
    let client = client.with_max_context_length(100);

    let mut request = prompt("alice", "hello");
    request.max_tokens = 100;
    let err = client.complete_with_context(request).await.unwrap_err();

    assert!(matches!(
        err,
        ConversationError::Preprocess(PipelineError::BudgetConfig {
            reserved: 100,
            limit: 100
        })
    ));
    assert_eq!(store.total_calls(), 0);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_history_failure_sends_raw_input_and_warns() {
    let (provider, store, _) = setup();
    let (dispatch, logs) = capture_logs();
    let client = ConversationClient::new(provider.clone(), store.clone()).with_dispatch(dispatch);
    store.fail(StoreOp::ListLatestPairedMessages);
    provider.push_completion("ok");

    client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap();

    assert_eq!(provider.completion_requests()[0].prompt, "hello");
    let warnings = logs.at_level(Level::WARN);
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].message,
        "Listing paired history failed, continuing without context"
    );
    assert_eq!(warnings[0].field("user"), Some("alice"));
    // The exchange is still recorded.
    assert_eq!(store.inner().messages().len(), 2);
}

#[tokio::test]
async fn test_chat_history_failure_sends_messages_unchanged() {
    let (provider, store, client) = setup();
    store.fail(StoreOp::ListLatestPairedMessages);
    provider.push_chat("ok");

    let messages = vec![ChatMessage::system("rules"), ChatMessage::user("hello")];
    let request = ChatRequest {
        user: "alice".to_string(),
        messages: messages.clone(),
        ..ChatRequest::default()
    };
    client.chat_complete_with_context(request).await.unwrap();

    assert_eq!(provider.chat_requests()[0].messages, messages);
}

#[tokio::test]
async fn test_session_lookup_failure_creates_new_session() {
    let (provider, store, _) = setup();
    let (dispatch, logs) = capture_logs();
    let client = ConversationClient::new(provider.clone(), store.clone()).with_dispatch(dispatch);
    store.fail(StoreOp::LatestActiveSession);
    provider.push_completion("one");
    provider.push_completion("two");

    client
        .complete_with_context(prompt("alice", "a"))
        .await
        .unwrap();
    client
        .complete_with_context(prompt("alice", "b"))
        .await
        .unwrap();

    assert_eq!(store.inner().sessions().len(), 2);
    assert_eq!(
        logs.find("Active session lookup failed, creating a new session")
            .len(),
        2
    );
}

#[tokio::test]
async fn test_session_creation_failure_is_preprocess_error() {
    let (provider, store, client) = setup();
    store.fail(StoreOp::CreateSession);

    let err = client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConversationError::Preprocess(PipelineError::Session(StoreError::Backend(_)))
    ));
    assert!(err.to_string().starts_with("preprocess failed: "));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_user_message_persist_failure_skips_provider() {
    let (provider, store, client) = setup();
    store.fail(StoreOp::CreateMessage);

    let err = client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap_err();

    assert!(matches!(
        err.pipeline(),
        Some(PipelineError::MessagePersist(_))
    ));
    assert!(matches!(err, ConversationError::Preprocess(_)));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_provider_error_passes_through_and_keeps_user_turn() {
    let (provider, store, client) = setup();
    provider.push_completion_result(Err(LlmError::RateLimited {
        retry_after_secs: 7,
    }));

    let err = client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConversationError::Completion(LlmError::RateLimited {
            retry_after_secs: 7
        })
    ));
    let messages = store.inner().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello");
    assert!(!messages[0].has_spouse());
}

#[tokio::test]
async fn test_unanswered_turn_is_left_out_of_later_history() {
    let (provider, _store, client) = setup();
    provider.push_completion_result(Err(LlmError::Timeout));
    provider.push_completion("ok");

    client
        .complete_with_context(prompt("alice", "lost"))
        .await
        .unwrap_err();
    client
        .complete_with_context(prompt("alice", "retry"))
        .await
        .unwrap();

    assert_eq!(provider.completion_requests()[1].prompt, "Q: retry\nA: ");
}

#[tokio::test]
async fn test_empty_choices_is_postprocess_error() {
    let (provider, store, client) = setup();
    provider.push_completion_result(Ok(completion_response(&[])));

    let err = client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConversationError::Postprocess(PipelineError::EmptyChoices)
    ));
    let messages = store.inner().messages();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].has_spouse());
}

#[tokio::test]
async fn test_chat_empty_choices_is_postprocess_error() {
    let (provider, _store, client) = setup();
    provider.push_chat_result(Ok(chat_response(&[])));

    let request = ChatRequest {
        user: "alice".to_string(),
        messages: vec![ChatMessage::user("hello")],
        ..ChatRequest::default()
    };
    let err = client.chat_complete_with_context(request).await.unwrap_err();

    assert!(matches!(
        err,
        ConversationError::Postprocess(PipelineError::EmptyChoices)
    ));
}

#[tokio::test]
async fn test_reply_persist_failure_is_postprocess_error() {
    let (provider, store, client) = setup();
    store.fail(StoreOp::CreateSpouseMessage);
    provider.push_completion("lost reply");

    let err = client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConversationError::Postprocess(PipelineError::MessagePersist(_))
    ));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_close_failure_is_reported() {
    let (_provider, store, client) = setup();
    store.fail(StoreOp::CloseSession);

    let err = client.close_conversation("alice").await.unwrap_err();
    assert!(matches!(err, ConversationError::Close(StoreError::Backend(_))));
}

#[tokio::test]
async fn test_dropped_request_keeps_committed_writes() {
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_secs(30)));
    let store = Arc::new(FaultyStore::new());
    let client = ConversationClient::new(provider.clone(), store.clone());
    provider.push_completion("too late");

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        client.complete_with_context(prompt("alice", "hello")),
    )
    .await;

    assert!(outcome.is_err());
    let messages = store.inner().messages();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].has_spouse());
    assert_eq!(store.calls(StoreOp::CreateSpouseMessage), 0);
}
