//! Capture and rendering of everything a snippet produces.

pub mod buffer;
pub mod serializer;
pub mod value;

pub use buffer::{CapturedOutput, OutputBuffer, Stream};
pub use serializer::{serialize, SerializationContext, CIRCULAR_SENTINEL, UNSERIALIZABLE_SENTINEL};
pub use value::{Capture, Node, Value};
