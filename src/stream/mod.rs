//! Worker 事件流：逐行分类（[`event`]）并写入会话事件日志（[`router`]）

pub mod event;
pub mod router;

pub use event::{parse, Event, EventKind, ParseError, ParsedLine, TERMINAL_MARKER};
pub use router::{sanitize_segment, EventLog, EventRouter, SequenceAllocator};
