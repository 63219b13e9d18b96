//! Wire frames exchanged with the backend.
//!
//! Inbound frames are JSON objects tagged by `type`. Outbound requests are
//! either raw text (group chat) or small JSON objects whose shape depends on
//! the product.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// One server→client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// `sender` began a turn.
    StreamStart { sender: String },
    /// Partial (or, under the replace policy, full) content for `sender`.
    StreamChunk {
        sender: String,
        #[serde(default)]
        content: String,
    },
    /// `sender` finished its turn.
    StreamEnd { sender: String },
    /// Anonymous streaming chunk (customer-service stream mode).
    Chunk {
        #[serde(default)]
        content: String,
    },
    /// End of an anonymous stream.
    End,
    /// Protocol-level error. The interview endpoint names the field `message`.
    Error {
        #[serde(default, alias = "message")]
        content: String,
    },
    SessionCreated { session_id: String },
    SessionResumed { session_id: String },
    /// Non-streaming full answer from the customer-service bot.
    Response {
        response: String,
        #[serde(default)]
        confidence: Option<f64>,
        #[serde(default)]
        match_type: Option<String>,
        #[serde(default)]
        transfer_to_human: Option<bool>,
        #[serde(default)]
        matched_topic: Option<String>,
    },
    /// Out-of-band annotation.
    Metadata {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    /// Heartbeat reply.
    Pong,
    /// Interview endpoint is ready for `start_interview`.
    Ready {
        #[serde(default)]
        message: Option<String>,
    },
    /// Interviewer question for round `round_number`.
    Question {
        content: String,
        #[serde(default)]
        round_number: Option<u32>,
        #[serde(default)]
        video_state: Option<String>,
    },
    Evaluation {
        #[serde(default)]
        data: Value,
    },
    VideoState { state: String },
    InterviewEnd {
        #[serde(default)]
        evaluation: Option<Value>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Any `type` this client does not know.
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    /// Parse one text payload. Fails on non-JSON input or a missing `type`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The frame's `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::StreamStart { .. } => "stream_start",
            InboundFrame::StreamChunk { .. } => "stream_chunk",
            InboundFrame::StreamEnd { .. } => "stream_end",
            InboundFrame::Chunk { .. } => "chunk",
            InboundFrame::End => "end",
            InboundFrame::Error { .. } => "error",
            InboundFrame::SessionCreated { .. } => "session_created",
            InboundFrame::SessionResumed { .. } => "session_resumed",
            InboundFrame::Response { .. } => "response",
            InboundFrame::Metadata { .. } => "metadata",
            InboundFrame::Pong => "pong",
            InboundFrame::Ready { .. } => "ready",
            InboundFrame::Question { .. } => "question",
            InboundFrame::Evaluation { .. } => "evaluation",
            InboundFrame::VideoState { .. } => "video_state",
            InboundFrame::InterviewEnd { .. } => "interview_end",
            InboundFrame::Unknown => "unknown",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// One client→server request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Plain user text, sent as-is (not JSON).
    Raw(String),
    /// Multi-recipient chat: `{"message", "<recipients_field>": [...], "mode"}`.
    Broadcast {
        message: String,
        recipients_field: String,
        recipients: Vec<String>,
        mode: String,
    },
    /// Reattach to an existing backend session.
    ResumeSession { session_id: String },
    /// Customer-service query; `stream: false` asks for a single `response` frame.
    Query { message: String, stream: bool },
    /// Keep-alive.
    Ping,
    StartInterview {
        experience_set_ids: Vec<String>,
        experience_mode: Option<String>,
    },
    Answer { content: String },
    EndInterview,
}

impl Outbound {
    /// Serialize to the text payload put on the wire.
    pub fn to_wire(&self) -> String {
        match self {
            Outbound::Raw(text) => text.clone(),
            Outbound::Broadcast { message, recipients_field, recipients, mode } => {
                let mut obj = Map::new();
                obj.insert("message".into(), Value::String(message.clone()));
                obj.insert(recipients_field.clone(), json!(recipients));
                obj.insert("mode".into(), Value::String(mode.clone()));
                Value::Object(obj).to_string()
            }
            Outbound::ResumeSession { session_id } => {
                json!({ "type": "resume_session", "session_id": session_id }).to_string()
            }
            Outbound::Query { message, stream } => {
                json!({ "message": message, "stream": stream }).to_string()
            }
            Outbound::Ping => json!({ "type": "ping" }).to_string(),
            Outbound::StartInterview { experience_set_ids, experience_mode } => {
                let mut v = json!({
                    "type": "start_interview",
                    "experience_set_ids": experience_set_ids,
                });
                if let Some(mode) = experience_mode {
                    v["experience_mode"] = Value::String(mode.clone());
                }
                v.to_string()
            }
            Outbound::Answer { content } => {
                json!({ "type": "answer", "content": content }).to_string()
            }
            Outbound::EndInterview => json!({ "type": "end_interview" }).to_string(),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Raw(_) => "raw",
            Outbound::Broadcast { .. } => "broadcast",
            Outbound::ResumeSession { .. } => "resume_session",
            Outbound::Query { .. } => "query",
            Outbound::Ping => "ping",
            Outbound::StartInterview { .. } => "start_interview",
            Outbound::Answer { .. } => "answer",
            Outbound::EndInterview => "end_interview",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(o: &Outbound) -> Value {
        serde_json::from_str(&o.to_wire()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Inbound parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parses_stream_start_with_extra_content_field() {
        let f = InboundFrame::parse(r#"{"type":"stream_start","sender":"小林","content":""}"#).unwrap();
        assert_eq!(f, InboundFrame::StreamStart { sender: "小林".into() });
    }

    #[test]
    fn parses_stream_chunk() {
        let f = InboundFrame::parse(r#"{"type":"stream_chunk","sender":"A","content":"hi"}"#).unwrap();
        assert_eq!(f, InboundFrame::StreamChunk { sender: "A".into(), content: "hi".into() });
    }

    #[test]
    fn error_frame_accepts_message_alias() {
        let f = InboundFrame::parse(r#"{"type":"error","message":"开始面试失败"}"#).unwrap();
        assert_eq!(f, InboundFrame::Error { content: "开始面试失败".into() });
    }

    #[test]
    fn session_created_carries_id() {
        let f = InboundFrame::parse(r#"{"type":"session_created","session_id":"abc123"}"#).unwrap();
        assert_eq!(f, InboundFrame::SessionCreated { session_id: "abc123".into() });
    }

    #[test]
    fn response_frame_with_metadata() {
        let f = InboundFrame::parse(
            r#"{"type":"response","response":"您好","confidence":0.92,"match_type":"faq","transfer_to_human":false,"matched_topic":"退款"}"#,
        )
        .unwrap();
        match f {
            InboundFrame::Response { response, confidence, transfer_to_human, matched_topic, .. } => {
                assert_eq!(response, "您好");
                assert_eq!(confidence, Some(0.92));
                assert_eq!(transfer_to_human, Some(false));
                assert_eq!(matched_topic.as_deref(), Some("退款"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn metadata_frame_keeps_fields() {
        let f = InboundFrame::parse(r#"{"type":"metadata","confidence":0.5,"intent":"refund"}"#).unwrap();
        match f {
            InboundFrame::Metadata { fields } => {
                assert_eq!(fields.get("intent"), Some(&Value::String("refund".into())));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn question_frame_round_number() {
        let f = InboundFrame::parse(
            r#"{"type":"question","content":"介绍一下你自己","round_number":1,"video_state":"speaking"}"#,
        )
        .unwrap();
        assert!(matches!(f, InboundFrame::Question { round_number: Some(1), .. }));
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let f = InboundFrame::parse(r#"{"type":"progress","percent":40}"#).unwrap();
        assert_eq!(f, InboundFrame::Unknown);
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(InboundFrame::parse(r#"{"sender":"A"}"#).is_err());
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(InboundFrame::parse("not json at all").is_err());
    }

    #[test]
    fn kind_matches_tag() {
        assert_eq!(InboundFrame::Pong.kind(), "pong");
        assert_eq!(InboundFrame::End.kind(), "end");
    }

    // -----------------------------------------------------------------------
    // Outbound serialization
    // -----------------------------------------------------------------------

    #[test]
    fn raw_is_sent_verbatim() {
        assert_eq!(Outbound::Raw("大家好".into()).to_wire(), "大家好");
    }

    #[test]
    fn resume_session_shape() {
        let v = wire(&Outbound::ResumeSession { session_id: "abc123".into() });
        assert_eq!(v, json!({ "type": "resume_session", "session_id": "abc123" }));
    }

    #[test]
    fn broadcast_uses_product_field_name() {
        let v = wire(&Outbound::Broadcast {
            message: "hello".into(),
            recipients_field: "celebrity_ids".into(),
            recipients: vec!["1".into(), "2".into()],
            mode: "group".into(),
        });
        assert_eq!(v["celebrity_ids"], json!(["1", "2"]));
        assert_eq!(v["mode"], "group");
        assert_eq!(v["message"], "hello");
    }

    #[test]
    fn query_non_streaming() {
        let v = wire(&Outbound::Query { message: "退货".into(), stream: false });
        assert_eq!(v, json!({ "message": "退货", "stream": false }));
    }

    #[test]
    fn ping_shape() {
        assert_eq!(wire(&Outbound::Ping), json!({ "type": "ping" }));
    }

    #[test]
    fn start_interview_omits_absent_mode() {
        let v = wire(&Outbound::StartInterview {
            experience_set_ids: vec!["e1".into()],
            experience_mode: None,
        });
        assert_eq!(v["type"], "start_interview");
        assert!(v.get("experience_mode").is_none());
    }

    #[test]
    fn answer_and_end_interview_shapes() {
        assert_eq!(
            wire(&Outbound::Answer { content: "yes".into() }),
            json!({ "type": "answer", "content": "yes" })
        );
        assert_eq!(wire(&Outbound::EndInterview), json!({ "type": "end_interview" }));
    }
}
