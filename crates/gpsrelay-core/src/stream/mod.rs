//! 入站字节流处理：分帧与记录解析

pub mod framer;
pub mod record;

pub use framer::{DEFAULT_MAX_BUFFER, FeedOutcome, FrameError, Framer, Framing};
pub use record::{GpsRecord, MIN_RECORD_LEN, ParseError, parse};
