//! Context engine — budget-bounded assembly of conversation history.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               WindowBuilder                │
//! │                                            │
//! │  history (newest first) ──▶ greedy prepend │
//! │  new input ──────────────▶ always included │
//! │                                            │
//! │  ·Budget   ·Truncate   ·Question-first     │
//! └────────────────────────────────────────────┘
//! ```

pub mod window;

pub use window::{
    WindowBudget, WindowBuilder, assemble_messages, assemble_prompt, char_len, keep_tail,
    reduce_messages,
};
