//! Kernel wire protocol.
//!
//! The worker speaks newline-delimited JSON frames over its stdio. Three
//! logical channels are multiplexed over the pipes with a channel tag:
//!
//! - **shell** — execute requests and their completion replies.
//! - **iopub** — broadcast output: streams, the trailing-expression
//!   value, and error reports, all tagged with the parent execution id.
//! - **stdin** — input requests raised by the interpreter (the RPC
//!   transport) and the host's replies.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FramePayload {
    /// Host -> kernel: evaluate `code`.
    ExecuteRequest { code: String },
    /// Kernel -> host: evaluation finished. `status` is `ok` or `error`.
    ExecuteReply {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Kernel -> host: captured output. `name` is `stdout` or `stderr`.
    Stream { name: String, text: String },
    /// Kernel -> host: JSON projection of the trailing expression value.
    ExecuteResult { value: serde_json::Value },
    /// Kernel -> host: evaluation error detail.
    Error { message: String },
    /// Kernel -> host: the interpreter requests input. RPC requests ride
    /// in `prompt` as a JSON request frame.
    InputRequest { prompt: String },
    /// Host -> kernel: reply to an input request.
    InputReply { value: String },
    /// Host -> kernel: readiness probe.
    KernelInfoRequest,
    /// Kernel -> host: readiness answer.
    KernelInfoReply { version: String },
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: Channel,
    pub msg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub payload: FramePayload,
}

impl Frame {
    pub fn new(channel: Channel, payload: FramePayload) -> Self {
        Self {
            channel,
            msg_id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            payload,
        }
    }

    pub fn child_of(channel: Channel, parent_id: &str, payload: FramePayload) -> Self {
        Self {
            channel,
            msg_id: uuid::Uuid::new_v4().to_string(),
            parent_id: Some(parent_id.to_string()),
            payload,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_as_lines() {
        let frame = Frame::new(
            Channel::Shell,
            FramePayload::ExecuteRequest {
                code: "1 + 1".into(),
            },
        );
        let line = frame.to_line().unwrap();
        assert!(!line.contains('\n'));
        let parsed = Frame::from_line(&line).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn channel_and_type_tags_are_snake_case() {
        let frame = Frame::child_of(
            Channel::Iopub,
            "parent-1",
            FramePayload::Stream {
                name: "stdout".into(),
                text: "hi".into(),
            },
        );
        let line = frame.to_line().unwrap();
        assert!(line.contains("\"channel\":\"iopub\""));
        assert!(line.contains("\"type\":\"stream\""));
        assert!(line.contains("\"parent_id\":\"parent-1\""));
    }

    #[test]
    fn kernel_info_probe_round_trips() {
        let frame = Frame::new(Channel::Shell, FramePayload::KernelInfoRequest);
        let parsed = Frame::from_line(&frame.to_line().unwrap()).unwrap();
        assert_eq!(parsed.payload, FramePayload::KernelInfoRequest);
    }
}
