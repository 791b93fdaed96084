//! # board-core
//!
//! Persistence and broadcast coordination for the Board message board.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Store** - Durable append-and-delete log of messages
//! - **Broadcaster** - Registry of live subscribers and event fan-out
//! - **Board** - Session logic tying a store write to a broadcast
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Board    │────▶│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//!        │            ┌─────────────┐
//!        └────────────│ Broadcaster │
//!                     └─────────────┘
//! ```

pub mod board;
pub mod broadcast;
pub mod sqlite;
pub mod store;

pub use board::Board;
pub use board_protocol::{Message, MessageId, ServerEvent};
pub use broadcast::{BroadcastConfig, BroadcastError, Broadcaster, SubscriberId, Subscription};
pub use sqlite::SqliteStore;
pub use store::{validate_text, Store, StoreError, ValidationError, DEFAULT_MAX_TEXT_LENGTH};
