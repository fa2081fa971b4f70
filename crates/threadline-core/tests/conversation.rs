//! End-to-end conversation flows through `ConversationClient`.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use threadline_core::llm::{ChatMessage, ChatRequest, CompletionRequest, Role};
use threadline_core::store::ConversationStore;
use threadline_core::{ConversationClient, JsonFileStore, MemoryStore, SqliteStore};
use threadline_test_utils::{ScriptedProvider, TestConfigBuilder, capture_logs, init_test_tracing};

fn prompt(user: &str, text: &str) -> CompletionRequest {
    CompletionRequest {
        user: user.to_string(),
        prompt: text.to_string(),
        ..CompletionRequest::default()
    }
}

fn chat(user: &str, messages: Vec<ChatMessage>) -> ChatRequest {
    ChatRequest {
        user: user.to_string(),
        messages,
        ..ChatRequest::default()
    }
}

fn setup() -> (Arc<ScriptedProvider>, Arc<MemoryStore>, ConversationClient) {
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(MemoryStore::new());
    let client = ConversationClient::new(provider.clone(), store.clone());
    (provider, store, client)
}

#[test_log::test(tokio::test)]
async fn test_completion_carries_history_into_next_prompt() {
    let (provider, _store, client) = setup();
    provider.push_completion("hi there");
    provider.push_completion("fine");

    let first = client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap();
    assert_eq!(first.choices[0].text, "hi there");

    client
        .complete_with_context(prompt("alice", "how are you"))
        .await
        .unwrap();

    let sent = provider.completion_requests();
    assert_eq!(sent[0].prompt, "Q: hello\nA: ");
    assert_eq!(sent[1].prompt, "Q: hello\nA: hi there\nQ: how are you\nA: ");
}

#[tokio::test]
async fn test_exchange_is_stored_as_pair_with_channel_as_counterpart() {
    let (provider, store, client) = setup();
    provider.push_completion("hi there");

    client
        .complete_with_channel(prompt("alice", "hello"), "support")
        .await
        .unwrap();

    let messages = store.messages();
    assert_eq!(messages.len(), 2);
    let (question, answer) = (&messages[0], &messages[1]);

    assert_eq!(question.from_user_id, "alice");
    assert_eq!(question.to_user_id, "support");
    assert_eq!(question.content, "hello");
    assert_eq!(answer.from_user_id, "support");
    assert_eq!(answer.to_user_id, "alice");
    assert_eq!(answer.content, "hi there");

    assert_eq!(question.spouse_id, Some(answer.id));
    assert_eq!(answer.spouse_id, Some(question.id));
    assert_eq!(question.session_id, answer.session_id);
    assert!(answer.created_at > question.created_at);
}

#[tokio::test]
async fn test_default_channel_is_used_as_counterpart() {
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(MemoryStore::new());
    let client =
        ConversationClient::new(provider.clone(), store.clone()).with_default_channel("web");
    provider.push_completion("ok");

    client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap();

    assert_eq!(store.messages()[0].to_user_id, "web");
}

#[tokio::test]
async fn test_chat_carries_history_as_role_messages() {
    let (provider, _store, client) = setup();
    provider.push_chat("hi there");
    provider.push_chat("sure");

    let first = client
        .chat_complete_with_context(chat("alice", vec![ChatMessage::user("hello")]))
        .await
        .unwrap();
    assert_eq!(first.choices[0].message.content, "hi there");

    client
        .chat_complete_with_context(chat("alice", vec![ChatMessage::user("again")]))
        .await
        .unwrap();

    let sent = provider.chat_requests();
    assert_eq!(sent[0].messages, vec![ChatMessage::user("hello")]);
    assert_eq!(
        sent[1].messages,
        vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi there"),
            ChatMessage::user("again"),
        ]
    );
}

#[tokio::test]
async fn test_chat_stores_only_last_user_message() {
    let (provider, store, client) = setup();
    provider.push_chat("done");

    client
        .chat_complete_with_context(chat(
            "alice",
            vec![
                ChatMessage::user("first"),
                ChatMessage::assistant("earlier reply"),
                ChatMessage::user("second"),
            ],
        ))
        .await
        .unwrap();

    let contents: Vec<String> = store.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["second".to_string(), "done".to_string()]);
}

#[tokio::test]
async fn test_history_is_per_user() {
    let (provider, _store, client) = setup();
    provider.push_completion("for alice");
    provider.push_completion("for bob");

    client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap();
    client
        .complete_with_context(prompt("bob", "hey"))
        .await
        .unwrap();

    assert_eq!(provider.completion_requests()[1].prompt, "Q: hey\nA: ");
}

#[tokio::test]
async fn test_max_turns_limits_history() {
    let (provider, _store, client) = setup();
    let client = client.with_max_turns(1);
    for reply in ["one", "two", "three"] {
        provider.push_completion(reply);
    }

    for input in ["a", "b", "c"] {
        client
            .complete_with_context(prompt("alice", input))
            .await
            .unwrap();
    }

    assert_eq!(
        provider.completion_requests()[2].prompt,
        "Q: b\nA: two\nQ: c\nA: "
    );
}

#[tokio::test]
async fn test_close_starts_fresh_conversation() {
    let (provider, store, client) = setup();
    provider.push_completion("hi");
    provider.push_completion("hello again");

    client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap();
    client.close_conversation("alice").await.unwrap();
    client
        .complete_with_context(prompt("alice", "anyone?"))
        .await
        .unwrap();

    assert_eq!(provider.completion_requests()[1].prompt, "Q: anyone?\nA: ");
    let sessions = store.sessions();
    assert_eq!(sessions.len(), 2);
    assert!(!sessions[0].is_open());
    assert!(sessions[1].is_open());
}

#[tokio::test]
async fn test_close_without_conversation_succeeds() {
    let (provider, store, client) = setup();
    client.close_conversation("nobody").await.unwrap();
    assert!(store.sessions().is_empty());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_oversized_prompt_keeps_trailing_input() {
    let (provider, store, client) = setup();
    let client = client.with_max_context_length(20);
    provider.push_completion("ok");

    let input = "0123456789abcdefghijklmnopqrst";
    let mut request = prompt("alice", input);
    request.max_tokens = 5;
    client.complete_with_context(request).await.unwrap();

    assert_eq!(provider.completion_requests()[0].prompt, "fghijklmnopqrst");
    // The stored turn is the caller's raw input.
    assert_eq!(store.messages()[0].content, input);
}

#[tokio::test]
async fn test_history_read_back_is_oldest_first() {
    let (provider, _store, client) = setup();
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

    let history: Vec<String> = client
        .history("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(history, vec!["a", "one", "b", "two"]);
    assert!(client.history("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_users_do_not_share_sessions() {
    let (provider, store, client) = setup();
    provider.push_completion("x");
    provider.push_completion("y");

    let (a, b) = tokio::join!(
        client.complete_with_context(prompt("alice", "hello")),
        client.complete_with_context(prompt("bob", "hello")),
    );
    a.unwrap();
    b.unwrap();

    let sessions = store.sessions();
    assert_eq!(sessions.len(), 2);
    assert_ne!(sessions[0].user_id, sessions[1].user_id);
}

#[tokio::test]
async fn test_requested_size_is_logged_to_injected_dispatch() {
    let (provider, store, _) = setup();
    let (dispatch, logs) = capture_logs();
    let client = ConversationClient::new(provider.clone(), store).with_dispatch(dispatch);
    provider.push_completion("ok");

    client
        .complete_with_context(prompt("alice", "hello"))
        .await
        .unwrap();

    let entries = logs.find("Requested size");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].field("prompt"), Some("12"));
    assert_eq!(entries[0].field("completion"), Some("256"));
    assert_eq!(entries[0].field("requested"), Some("268"));
    assert_eq!(logs.find("Created session").len(), 1);
}

#[tokio::test]
async fn test_from_config_applies_conversation_section() {
    let config = TestConfigBuilder::new()
        .max_context_length(30)
        .max_turns(2)
        .default_channel("cfg")
        .build();
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(MemoryStore::new());
    let client = ConversationClient::from_config(&config.conversation, provider.clone(), store);

    assert_eq!(client.max_context_length(), 30);
    assert_eq!(client.max_turns(), 2);
    assert_eq!(client.default_channel(), "cfg");
}

#[tokio::test]
async fn test_json_store_history_survives_restart() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conversations.json");

    {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_completion("hi there");
        let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
        let client = ConversationClient::new(provider, store);
        client
            .complete_with_context(prompt("alice", "hello"))
            .await
            .unwrap();
    }

    let provider = Arc::new(ScriptedProvider::new());
    provider.push_completion("still here");
    let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
    let client = ConversationClient::new(provider.clone(), store.clone());
    client
        .complete_with_context(prompt("alice", "remember me?"))
        .await
        .unwrap();

    assert_eq!(
        provider.completion_requests()[0].prompt,
        "Q: hello\nA: hi there\nQ: remember me?\nA: "
    );
    assert_eq!(store.messages().await.len(), 4);
    let session = store.latest_active_session("alice").await.unwrap();
    assert!(session.is_open());
}

#[tokio::test]
async fn test_sqlite_store_history_survives_restart() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conversations.db");

    {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_chat("hi there");
        let store = Arc::new(SqliteStore::open(&path).await.unwrap());
        let client = ConversationClient::new(provider, store);
        client
            .chat_complete_with_context(chat("alice", vec![ChatMessage::user("hello")]))
            .await
            .unwrap();
    }

    let provider = Arc::new(ScriptedProvider::new());
    provider.push_chat("still here");
    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let client = ConversationClient::new(provider.clone(), store);
    client
        .chat_complete_with_context(chat("alice", vec![ChatMessage::user("remember me?")]))
        .await
        .unwrap();

    assert_eq!(
        provider.chat_requests()[0].messages,
        vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi there"),
            ChatMessage::user("remember me?"),
        ]
    );
    assert_eq!(client.history("alice").await.unwrap().len(), 4);

    client.close_conversation("alice").await.unwrap();
    assert!(client.history("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chat_drops_leading_system_message() {
    let (provider, _store, client) = setup();
    provider.push_chat("ok");

    client
        .chat_complete_with_context(chat(
            "alice",
            vec![ChatMessage::system("be brief"), ChatMessage::user("hello")],
        ))
        .await
        .unwrap();

    let sent = &provider.chat_requests()[0].messages;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].role, Role::User);
}
