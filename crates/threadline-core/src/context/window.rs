//! Context window assembly — fit as much paired history as the budget allows.
//!
//! The budget is the total size available for one invocation: the outgoing
//! prompt (or message list) plus the completion size reserved for the model's
//! reply. Sizes are counted in Unicode code points as an approximation of the
//! provider's tokenizer.
//!
//! Two request shapes share one selection rule:
//!
//! - **Single prompt** — history is rendered as `Q: ...` / `A: ...` lines ahead
//!   of the `Q: <input>\nA: ` stub.
//! - **Message list** — history becomes `user` / `assistant` messages ahead of
//!   the caller's messages.
//!
//! History is walked newest-first and prepended while it fits. The first turn
//! that would overflow ends the walk, so the kept history is always a
//! contiguous run of the most recent turns. A transcript never opens with an
//! answer.
//!
//! The `assemble_*` functions are pure. [`WindowBuilder`] wraps them with the
//! history fetch and its soft-failure policy: when the store cannot produce
//! history the caller's input goes out unmodified.

use tracing::{debug, warn};

use crate::llm::{ChatMessage, Role};
use crate::model::{Message, Session};
use crate::store::ConversationStore;

pub const QUESTION_PREFIX: &str = "Q";
pub const ANSWER_PREFIX: &str = "A";

/// Size of `text` in code points.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// The trailing `n` code points of `text`. Never splits a code point.
pub fn keep_tail(text: &str, n: usize) -> &str {
    let len = char_len(text);
    if n >= len {
        return text;
    }
    match text.char_indices().nth(len - n) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}

/// Total size budget for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBudget {
    /// Hard upper bound on prompt + completion.
    limit: usize,
    /// Held back for the model's reply.
    reserved: usize,
}

impl WindowBudget {
    /// `None` when the reservation leaves no room for a prompt.
    pub fn new(limit: usize, reserved: usize) -> Option<Self> {
        (reserved < limit).then_some(Self { limit, reserved })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Room left for the prompt once the reply is reserved.
    pub fn available(&self) -> usize {
        self.limit - self.reserved
    }

    /// Whether a prompt of `used` code points fits alongside the reservation.
    pub fn fits(&self, used: usize) -> bool {
        used + self.reserved <= self.limit
    }
}

/// Sort history newest-first. Equal timestamps keep store order.
fn newest_first(history: &[Message]) -> Vec<&Message> {
    let mut sorted: Vec<&Message> = history.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    sorted
}

/// Build the single-prompt window.
pub fn assemble_prompt(
    budget: WindowBudget,
    user_id: &str,
    input: &str,
    history: &[Message],
) -> String {
    if !budget.fits(char_len(input)) {
        return keep_tail(input, budget.available()).to_string();
    }

    let query = format!("{QUESTION_PREFIX}: {input}\n{ANSWER_PREFIX}: ");
    let mut used = char_len(&query);

    // (is_answer, line), newest first.
    let mut selected: Vec<(bool, String)> = Vec::new();
    for message in newest_first(history) {
        let is_answer = !message.is_from(user_id);
        let prefix = if is_answer {
            ANSWER_PREFIX
        } else {
            QUESTION_PREFIX
        };
        let line = format!("{prefix}: {}\n", message.content);
        let len = char_len(&line);
        if !budget.fits(used + len) {
            break;
        }
        used += len;
        selected.push((is_answer, line));
    }

    if selected.last().is_some_and(|(is_answer, _)| *is_answer) {
        selected.pop();
    }

    let mut prompt: String = selected.into_iter().rev().map(|(_, line)| line).collect();
    prompt.push_str(&query);
    prompt
}

fn total_len(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| char_len(&m.content)).sum()
}

/// Shrink an oversized message list to fit, keeping its leading messages.
///
/// When even the first message is too large on its own, it is kept alone with
/// its content cut down to the trailing code points that fit.
pub fn reduce_messages(budget: WindowBudget, messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut reduced = Vec::new();
    let mut used = 0;
    for message in messages {
        let len = char_len(&message.content);
        if !budget.fits(used + len) {
            break;
        }
        used += len;
        reduced.push(message.clone());
    }

    if reduced.is_empty() {
        if let Some(first) = messages.first() {
            reduced.push(ChatMessage::new(
                first.role,
                keep_tail(&first.content, budget.available()),
            ));
        }
    }
    reduced
}

/// Build the message-list window.
pub fn assemble_messages(
    budget: WindowBudget,
    user_id: &str,
    messages: &[ChatMessage],
    history: &[Message],
) -> Vec<ChatMessage> {
    let mut used = total_len(messages);
    if !budget.fits(used) {
        return reduce_messages(budget, messages);
    }

    let mut prepended: Vec<ChatMessage> = Vec::new();
    for message in newest_first(history) {
        let len = char_len(&message.content);
        if !budget.fits(used + len) {
            break;
        }
        used += len;
        let role = if message.is_from(user_id) {
            Role::User
        } else {
            Role::Assistant
        };
        prepended.push(ChatMessage::new(role, message.content.as_str()));
    }

    let mut window: Vec<ChatMessage> = prepended.into_iter().rev().collect();
    window.extend_from_slice(messages);
    if window.first().is_some_and(|m| m.role != Role::User) {
        window.remove(0);
    }
    window
}

/// Fetches history and assembles windows for one session.
pub struct WindowBuilder<'a> {
    store: &'a dyn ConversationStore,
    budget: WindowBudget,
    max_turns: usize,
}

impl<'a> WindowBuilder<'a> {
    pub fn new(store: &'a dyn ConversationStore, budget: WindowBudget, max_turns: usize) -> Self {
        Self {
            store,
            budget,
            max_turns,
        }
    }

    pub fn budget(&self) -> WindowBudget {
        self.budget
    }

    /// Single-prompt window for `input`.
    pub async fn prompt(&self, session: &Session, user_id: &str, input: &str) -> String {
        let input_len = char_len(input);
        if !self.budget.fits(input_len) {
            debug!(
                user = %user_id,
                requested = input_len + self.budget.reserved,
                prompt = input_len,
                completion = self.budget.reserved,
                "Prompt exceeds context limit, truncating input"
            );
            return keep_tail(input, self.budget.available()).to_string();
        }

        match self.history(session, user_id).await {
            Some(history) => assemble_prompt(self.budget, user_id, input, &history),
            None => input.to_string(),
        }
    }

    /// Message-list window for `messages`.
    pub async fn messages(
        &self,
        session: &Session,
        user_id: &str,
        messages: &[ChatMessage],
    ) -> Vec<ChatMessage> {
        let total = total_len(messages);
        if !self.budget.fits(total) {
            debug!(
                user = %user_id,
                requested = total + self.budget.reserved,
                messages = total,
                completion = self.budget.reserved,
                "Messages exceed context limit, reducing"
            );
            return reduce_messages(self.budget, messages);
        }

        match self.history(session, user_id).await {
            Some(history) => assemble_messages(self.budget, user_id, messages, &history),
            None => messages.to_vec(),
        }
    }

    /// Paired history, or `None` when the store fails.
    async fn history(&self, session: &Session, user_id: &str) -> Option<Vec<Message>> {
        match self
            .store
            .list_latest_paired_messages(session, user_id, self.max_turns)
            .await
        {
            Ok(history) => {
                debug!(session = %session.id, messages = history.len(), "Loaded paired history");
                Some(history)
            }
            Err(e) => {
                warn!(
                    session = %session.id,
                    user = %user_id,
                    error = %e,
                    "Listing paired history failed, continuing without context"
                );
                None
            }
        }
    }
}
