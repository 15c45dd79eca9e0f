//! Request input and response output buffers.
//!
//! A task carries one `Input` and one `Output`. Handler phases read the input
//! and mutate the output in place; on a Forward the output becomes the
//! outbound upstream payload and the upstream response is re-injected as the
//! task's input before the machine resumes.
use bytes::Bytes;

/// Inbound payload of a task. Replaced in place when an upstream response
/// re-enters the task.
#[derive(Debug, Clone, Default)]
pub struct Input {
    pub body: Bytes,
}

impl Input {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    pub fn from_str(body: &str) -> Self {
        Self {
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    /// Body as UTF-8, lossy. Handler payloads are JSON in practice.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Replace this input with the contents of an output buffer. Used between
    /// phases so a later phase sees what the earlier phase produced.
    pub fn assign(&mut self, output: &Output) {
        self.body = Bytes::copy_from_slice(output.body.as_bytes());
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Outbound payload of a task: the eventual client reply, or the upstream
/// request body while a Forward is in flight.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub body: String,
    /// Optional upstream target override. When unset the configured default
    /// upstream address is used for Forward.
    pub uri: Option<String>,
}

impl Output {
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    pub fn reset(&mut self) {
        self.body.clear();
        self.uri = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_copies_output_into_input() {
        let mut input = Input::from_str("request");
        let mut output = Output::default();
        output.set_body("produced");
        input.assign(&output);
        assert_eq!(input.as_text(), "produced");
    }
}
