use tracing::debug;

use crate::output::serializer::{
    serialize_transported, SerializationContext, UNSERIALIZABLE_SENTINEL,
};
use crate::output::value::{LogCall, Transported};

pub const TRUNCATION_MARKER: &str = "[output truncated]";

/// Which response field a log-style call writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Result,
    Error,
}

/// Text captured from one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub result: String,
    pub error: String,
}

/// Per-execution output buffer.
///
/// Owned by the sandbox for the lifetime of one execution and taken out when
/// the execution is finalized, however it ended. Everything written to it
/// counts against a single byte ceiling.
#[derive(Debug)]
pub struct OutputBuffer {
    result: Vec<String>,
    error: Vec<String>,
    final_value: Option<String>,
    used: usize,
    limit: usize,
    truncated: Option<Stream>,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            result: Vec::new(),
            error: Vec::new(),
            final_value: None,
            used: 0,
            limit,
            truncated: None,
        }
    }

    /// Record one log-style call from its transport payload.
    pub fn push_log(&mut self, stream: Stream, payload: &str) {
        let mut ctx = self.render_context();
        let line = match serde_json::from_str::<LogCall>(payload) {
            Ok(call) => render_log_call(&call, &mut ctx),
            Err(e) => {
                debug!(error = %e, "Undecodable log payload");
                UNSERIALIZABLE_SENTINEL.to_string()
            }
        };
        if ctx.is_exhausted() {
            if !line.is_empty() {
                self.push_line(stream, line);
            }
            self.cut(stream);
        } else {
            self.push_line(stream, line);
        }
    }

    /// Record the snippet's final value. Rendered after every log line.
    pub fn push_final(&mut self, payload: &str) {
        let mut ctx = self.render_context();
        let text = match serde_json::from_str::<Transported>(payload) {
            Ok(arg) => serialize_transported(&arg, &mut ctx),
            Err(e) => {
                debug!(error = %e, "Undecodable final value payload");
                UNSERIALIZABLE_SENTINEL.to_string()
            }
        };
        if ctx.is_exhausted() {
            self.cut(Stream::Result);
            return;
        }
        if let Some(text) = self.admit(Stream::Result, text) {
            self.final_value = Some(text);
        }
    }

    pub fn push_line(&mut self, stream: Stream, line: String) {
        if let Some(line) = self.admit(stream, line) {
            match stream {
                Stream::Result => self.result.push(line),
                Stream::Error => self.error.push(line),
            }
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated.is_some()
    }

    pub fn finish(self) -> CapturedOutput {
        let mut result = self.result;
        let mut error = self.error;
        if let Some(value) = self.final_value {
            result.push(value);
        }
        match self.truncated {
            Some(Stream::Result) => result.push(TRUNCATION_MARKER.to_string()),
            Some(Stream::Error) => error.push(TRUNCATION_MARKER.to_string()),
            None => {}
        }

        CapturedOutput {
            result: result.join("\n"),
            error: error.join("\n"),
        }
    }

    /// A render budget covering what is still allowed into the buffer.
    fn render_context(&self) -> SerializationContext {
        SerializationContext::with_budget(self.limit.saturating_sub(self.used))
    }

    /// Stop accepting output and mark `stream` as truncated.
    fn cut(&mut self, stream: Stream) {
        if self.truncated.is_none() {
            self.used = self.limit;
            self.truncated = Some(stream);
            debug!(limit = self.limit, "Captured output reached its ceiling");
        }
    }

    /// Charge `line` against the ceiling, clipping it if it does not fit.
    fn admit(&mut self, stream: Stream, mut line: String) -> Option<String> {
        if self.truncated.is_some() {
            return None;
        }
        // One byte for the separating newline.
        let cost = line.len() + 1;
        if self.used + cost <= self.limit {
            self.used += cost;
            return Some(line);
        }

        let room = self.limit.saturating_sub(self.used + 1);
        let mut end = room.min(line.len());
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
        self.used = self.limit;
        self.truncated = Some(stream);
        debug!(limit = self.limit, "Captured output reached its ceiling");

        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

/// Arguments of one call are joined with a single space. All of them draw on
/// the same render budget; rendering stops at the first argument that
/// exhausts it.
pub fn render_log_call(call: &LogCall, ctx: &mut SerializationContext) -> String {
    let mut parts = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        let text = serialize_transported(arg, ctx);
        if ctx.is_exhausted() {
            if !text.is_empty() {
                parts.push(text);
            }
            break;
        }
        parts.push(text);
    }
    parts.join(" ")
}
