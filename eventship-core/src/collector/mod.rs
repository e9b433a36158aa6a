//! Event collector wire protocol
//!
//! One `POST` per non-empty cycle to the configured URL:
//!
//! ```text
//! POST /events HTTP/1.1
//! Content-Type: application/json
//!
//! [{"Time": 1700000000, "Msg": "boot ok"}, {"Time": 1700000042, "Msg": "update ok"}]
//! ```
//!
//! Elements are ordered by `Time` (Unix seconds). `200 OK` and `201 Created`
//! acknowledge the whole batch; anything else rejects it.

mod client;
mod events;

pub use client::CollectorClient;
pub use events::Event;
