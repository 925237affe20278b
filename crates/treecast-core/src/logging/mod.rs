//! JSONL log files, one per node per day.
//!
//! A Maelstrom run starts several node processes side by side; each writes
//! its own file so no two processes ever append to the same one.
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-19_n0.jsonl
//!     ├── 2026-10-19_n1.jsonl
//!     └── 2026-10-19_n2.jsonl
//! ```
//!
//! The node id is only known after the `init` handshake, so the layer is
//! installed untagged and events are held in memory until
//! [`NodeTag::set`] opens the file.
//!
//! ```ignore
//! use treecast_core::logging::JsonlLayer;
//! use tracing_subscriber::prelude::*;
//!
//! let layer = JsonlLayer::new("./logs")?;
//! let tag = layer.tag();
//! tracing_subscriber::registry().with(layer).init();
//! // ... after init
//! tag.set("n1")?;
//! ```
//!
//! Query with jq:
//!
//! ```bash
//! jq 'select(.level == "warn")' logs/raw/*_n1.jsonl
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts)'
//! ```

mod entry;
mod layer;
mod writer;

pub use entry::LogEntry;
pub use layer::{JsonlLayer, NodeTag};
pub use writer::{read_entries, NodeLogWriter};
