//! Fuzz target for context window assembly.
//!
//! Run with: cargo +nightly fuzz run fuzz_window_builder
//!
//! Builds history and inputs from arbitrary bytes and checks that neither
//! window shape exceeds its budget or opens with an answer.

#![no_main]

use std::time::{Duration, UNIX_EPOCH};

use libfuzzer_sys::fuzz_target;
use threadline_core::context::{WindowBudget, assemble_messages, assemble_prompt, char_len};
use threadline_core::llm::{ChatMessage, Role};
use threadline_core::model::{Message, MessageId, SessionId};

const USER: &str = "user";
const CHANNEL: &str = "default";

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let limit = usize::from(u16::from_le_bytes([data[0], data[1]])) % 512 + 1;
    let reserved = usize::from(data[2]) % limit;
    let Some(budget) = WindowBudget::new(limit, reserved) else {
        return;
    };

    let text = String::from_utf8_lossy(&data[3..]);
    let mut parts = text.split('|');
    let input = parts.next().unwrap_or_default();

    let history: Vec<Message> = parts
        .enumerate()
        .map(|(i, content)| Message {
            id: MessageId(i as u64 + 1),
            session_id: SessionId(1),
            from_user_id: if i % 2 == 0 { USER } else { CHANNEL }.to_string(),
            to_user_id: if i % 2 == 0 { CHANNEL } else { USER }.to_string(),
            content: content.to_string(),
            spouse_id: None,
            created_at: UNIX_EPOCH + Duration::from_secs(i as u64),
        })
        .collect();

    let prompt = assemble_prompt(budget, USER, input, &history);
    let stub = format!("Q: {input}\nA: ");
    if budget.fits(char_len(input)) {
        assert!(prompt.ends_with(&stub));
        assert!(prompt.starts_with("Q: "));
        assert!(char_len(&prompt) <= budget.available() || prompt == stub);
    } else {
        assert_eq!(char_len(&prompt), budget.available());
    }

    let messages = vec![ChatMessage::user(input)];
    let window = assemble_messages(budget, USER, &messages, &history);
    let total: usize = window.iter().map(|m| char_len(&m.content)).sum();
    assert!(total <= budget.available());
    assert!(window.first().is_none_or(|m| m.role == Role::User));
});
