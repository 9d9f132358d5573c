// src/runtime/protocol.rs
//! Kernel message protocol and output classification
//!
//! Kernels speak line-delimited JSON. Every message the kernel emits is
//! parsed into a closed [`MessageBody`] variant; [`classify`] then maps each
//! variant onto at most one [`OutputEvent`] with an exhaustive match, so a
//! new message kind cannot slip through unhandled.
//!
//! ```text
//! engine ──execute_request──▶ kernel
//! engine ◀──status(busy)───── kernel
//! engine ◀──stream/result/display/error── kernel   (0..n)
//! engine ◀──status(idle)───── kernel
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// MIME type used for inline figures
pub const IMAGE_PNG: &str = "image/png";

/// MIME type used for textual representations
pub const TEXT_PLAIN: &str = "text/plain";

/// MIME bundle attached to results and display data
pub type MimeBundle = BTreeMap<String, serde_json::Value>;

/// Request sent to a kernel (one JSON object per line)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum KernelRequest {
    /// Ask the kernel to announce itself; answered with `kernel_info_reply`
    KernelInfoRequest { msg_id: String },

    /// Run code
    ExecuteRequest {
        msg_id: String,
        code: String,
        /// Snippet run after `code` succeeds, within the same execution
        #[serde(default, skip_serializing_if = "Option::is_none")]
        epilogue: Option<String>,
        /// Silent executions do not bump the kernel's own counter
        silent: bool,
    },

    /// Ask the kernel to exit its request loop
    ShutdownRequest { msg_id: String },
}

impl KernelRequest {
    /// Message id carried by the request
    pub fn msg_id(&self) -> &str {
        match self {
            KernelRequest::KernelInfoRequest { msg_id }
            | KernelRequest::ExecuteRequest { msg_id, .. }
            | KernelRequest::ShutdownRequest { msg_id } => msg_id,
        }
    }
}

/// Message emitted by a kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    /// Id of the request this message answers
    #[serde(default)]
    pub parent_id: Option<String>,

    #[serde(flatten)]
    pub body: MessageBody,
}

impl KernelMessage {
    pub fn new(parent_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            body,
        }
    }

    /// Whether this message belongs to the given request
    pub fn is_reply_to(&self, msg_id: &str) -> bool {
        self.parent_id.as_deref() == Some(msg_id)
    }
}

/// Kernel execution state carried by `status` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

/// Payload of a kernel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", content = "content", rename_all = "snake_case")]
pub enum MessageBody {
    Status {
        execution_state: ExecutionState,
    },
    Stream {
        name: String,
        #[serde(default)]
        text: String,
    },
    ExecuteResult {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        execution_count: Option<u64>,
    },
    DisplayData {
        #[serde(default)]
        data: MimeBundle,
    },
    Error {
        #[serde(default)]
        ename: Option<String>,
        #[serde(default)]
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    KernelInfoReply {
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        language_version: Option<String>,
    },
}

/// One unit of emitted execution activity, in kernel emission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// Text written to a stream (`stdout` / `stderr`)
    Stream { name: String, text: String },

    /// Textual value of an expression or a text-only display
    Result { text: String },

    /// Base64-encoded PNG
    Image { data: String },

    /// Exception raised by the submitted code
    Error {
        name: String,
        message: String,
        trace: String,
    },
}

/// Exception details reported at the top level of an [`ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub trace: String,
}

/// Outcome of classifying a single kernel message
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// The kernel finished the request
    Idle,
    /// Something to hand back to the caller
    Output(OutputEvent),
    /// Bookkeeping with nothing to report
    Ignored,
}

/// Map a kernel message onto the caller-visible output model
pub fn classify(body: MessageBody) -> Classified {
    match body {
        MessageBody::Status { execution_state } => match execution_state {
            ExecutionState::Idle => Classified::Idle,
            ExecutionState::Busy | ExecutionState::Starting => Classified::Ignored,
        },
        MessageBody::Stream { name, text } => Classified::Output(OutputEvent::Stream { name, text }),
        MessageBody::ExecuteResult { data, .. } | MessageBody::DisplayData { data } => {
            match from_bundle(data) {
                Some(event) => Classified::Output(event),
                None => Classified::Ignored,
            }
        }
        MessageBody::Error {
            ename,
            evalue,
            traceback,
        } => Classified::Output(OutputEvent::Error {
            name: ename
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "Error".to_string()),
            message: evalue,
            trace: traceback.join("\n"),
        }),
        MessageBody::KernelInfoReply { .. } => Classified::Ignored,
    }
}

/// Images win over text when a bundle carries both
fn from_bundle(mut data: MimeBundle) -> Option<OutputEvent> {
    if let Some(serde_json::Value::String(png)) = data.remove(IMAGE_PNG) {
        return Some(OutputEvent::Image {
            data: png.replace('\n', ""),
        });
    }

    match data.remove(TEXT_PLAIN)? {
        serde_json::Value::String(text) => Some(OutputEvent::Result { text }),
        other => Some(OutputEvent::Result {
            text: other.to_string(),
        }),
    }
}

/// Overall status of one `run`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

/// Result of executing code on a kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub execution_count: u64,
    pub outputs: Vec<OutputEvent>,
    pub error: Option<ErrorInfo>,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }
}

/// Accumulates outputs while a request is drained
#[derive(Debug, Default)]
pub struct OutputCollector {
    outputs: Vec<OutputEvent>,
    error: Option<ErrorInfo>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: OutputEvent) {
        if let OutputEvent::Error {
            name,
            message,
            trace,
        } = &event
        {
            // last error wins
            self.error = Some(ErrorInfo {
                name: name.clone(),
                message: message.clone(),
                trace: trace.clone(),
            });
        }
        self.outputs.push(event);
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn finish(self, execution_count: u64) -> ExecutionResult {
        let status = if self.error.is_some() {
            ExecutionStatus::Error
        } else {
            ExecutionStatus::Ok
        };

        ExecutionResult {
            status,
            execution_count,
            outputs: self.outputs,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> KernelMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_stream_message() {
        let msg = parse(json!({
            "msg_type": "stream",
            "parent_id": "abc",
            "content": {"name": "stdout", "text": "hello\n"}
        }));

        assert!(msg.is_reply_to("abc"));
        assert_eq!(
            msg.body,
            MessageBody::Stream {
                name: "stdout".into(),
                text: "hello\n".into()
            }
        );
    }

    #[test]
    fn test_parse_status_idle() {
        let msg = parse(json!({
            "msg_type": "status",
            "parent_id": "abc",
            "content": {"execution_state": "idle"}
        }));
        assert_eq!(classify(msg.body), Classified::Idle);
    }

    #[test]
    fn test_request_wire_format() {
        let request = KernelRequest::ExecuteRequest {
            msg_id: "m1".into(),
            code: "1+1".into(),
            epilogue: None,
            silent: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["msg_type"], "execute_request");
        assert_eq!(value["code"], "1+1");
        assert!(value.get("epilogue").is_none());
        assert_eq!(request.msg_id(), "m1");
    }

    #[test]
    fn test_classify_result_text() {
        let mut data = MimeBundle::new();
        data.insert(TEXT_PLAIN.into(), json!("2"));
        let classified = classify(MessageBody::ExecuteResult {
            data,
            execution_count: Some(1),
        });
        assert_eq!(
            classified,
            Classified::Output(OutputEvent::Result { text: "2".into() })
        );
    }

    #[test]
    fn test_classify_prefers_image() {
        let mut data = MimeBundle::new();
        data.insert(TEXT_PLAIN.into(), json!("<Figure>"));
        data.insert(IMAGE_PNG.into(), json!("iVBORw0KGgo=\n"));
        let classified = classify(MessageBody::DisplayData { data });
        assert_eq!(
            classified,
            Classified::Output(OutputEvent::Image {
                data: "iVBORw0KGgo=".into()
            })
        );
    }

    #[test]
    fn test_classify_empty_bundle_ignored() {
        let classified = classify(MessageBody::DisplayData {
            data: MimeBundle::new(),
        });
        assert_eq!(classified, Classified::Ignored);
    }

    #[test]
    fn test_classify_error_defaults_name() {
        let classified = classify(MessageBody::Error {
            ename: None,
            evalue: "boom".into(),
            traceback: vec!["line 1".into(), "line 2".into()],
        });
        assert_eq!(
            classified,
            Classified::Output(OutputEvent::Error {
                name: "Error".into(),
                message: "boom".into(),
                trace: "line 1\nline 2".into(),
            })
        );
    }

    #[test]
    fn test_collector_status() {
        let mut collector = OutputCollector::new();
        collector.push(OutputEvent::Stream {
            name: "stdout".into(),
            text: "a".into(),
        });
        let ok = collector.finish(3);
        assert!(ok.is_ok());
        assert_eq!(ok.execution_count, 3);
        assert!(ok.error.is_none());

        let mut collector = OutputCollector::new();
        collector.push(OutputEvent::Error {
            name: "ZeroDivisionError".into(),
            message: "division by zero".into(),
            trace: "...".into(),
        });
        let failed = collector.finish(4);
        assert_eq!(failed.status, ExecutionStatus::Error);
        assert_eq!(failed.error.unwrap().name, "ZeroDivisionError");
    }

    #[test]
    fn test_output_serialization() {
        let value = serde_json::to_value(OutputEvent::Image { data: "x".into() }).unwrap();
        assert_eq!(value, json!({"type": "image", "data": "x"}));

        let value = serde_json::to_value(OutputEvent::Stream {
            name: "stderr".into(),
            text: "warn".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "stream", "name": "stderr", "text": "warn"}));
    }
}
