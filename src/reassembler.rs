//! # Frame Reassembler
//!
//! Folds interleaved `stream_start` / `stream_chunk` / `stream_end` frames into
//! finalized [`Message`]s, one buffer per sender.
//!
//! ## Guarantees
//! - A sender's buffer exists only between its start and its end frame.
//! - A chunk for a sender with no open buffer changes nothing.
//! - Buffers of different senders never touch each other.
//! - Empty or sentinel (`"..."`) turns produce no message.
//!
//! ## NOT Responsible For
//! - Re-ordering: frames are applied in arrival order.
//! - Connection state or session frames (that is the supervisor).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::frame::InboundFrame;
use crate::message::Message;

/// Placeholder the backend sends when a sender has nothing to say.
pub const SENTINEL_CONTENT: &str = "...";

/// Buffer key for anonymous `chunk` / `end` streams.
pub const ANONYMOUS_SENDER: &str = "bot";

/// How a `stream_chunk` combines with the text buffered so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPolicy {
    /// Each chunk is a fragment; fragments are concatenated.
    #[default]
    Append,
    /// Each chunk carries the full answer so far and replaces the buffer.
    ReplaceLatest,
}

impl std::fmt::Display for ChunkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkPolicy::Append => write!(f, "append"),
            ChunkPolicy::ReplaceLatest => write!(f, "replace_latest"),
        }
    }
}

/// Output of the reassembler.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `sender` started typing.
    Typing { sender: String },
    /// Current buffered text for an in-flight turn.
    Partial { sender: String, content: String },
    /// `sender`'s turn is over, whether or not it produced a message.
    TypingCleared { sender: String },
    /// A completed message.
    Finished(Message),
}

#[derive(Debug, Default)]
pub struct FrameReassembler {
    policy: ChunkPolicy,
    buffers: HashMap<String, String>,
}

impl FrameReassembler {
    pub fn new(policy: ChunkPolicy) -> Self {
        Self { policy, buffers: HashMap::new() }
    }

    pub fn policy(&self) -> ChunkPolicy {
        self.policy
    }

    /// Whether `frame` belongs to the reassembler.
    pub fn handles(frame: &InboundFrame) -> bool {
        matches!(
            frame,
            InboundFrame::StreamStart { .. }
                | InboundFrame::StreamChunk { .. }
                | InboundFrame::StreamEnd { .. }
                | InboundFrame::Chunk { .. }
                | InboundFrame::End
                | InboundFrame::Error { .. }
        )
    }

    /// Apply one frame. Frames the reassembler does not handle yield nothing.
    pub fn feed(&mut self, frame: &InboundFrame) -> Vec<StreamEvent> {
        match frame {
            InboundFrame::StreamStart { sender } => vec![self.start(sender)],
            InboundFrame::StreamChunk { sender, content } => {
                self.chunk(sender, content).into_iter().collect()
            }
            InboundFrame::StreamEnd { sender } => self.end(sender),
            InboundFrame::Chunk { content } => self.anonymous_chunk(content),
            InboundFrame::End => self.end(ANONYMOUS_SENDER),
            InboundFrame::Error { content } => vec![StreamEvent::Finished(Message::error(content.clone()))],
            _ => Vec::new(),
        }
    }

    /// Open (or reset) the buffer for `sender`.
    pub fn start(&mut self, sender: &str) -> StreamEvent {
        self.buffers.insert(sender.to_string(), String::new());
        StreamEvent::Typing { sender: sender.to_string() }
    }

    /// Apply a chunk to an open buffer. Returns `None` when `sender` has no
    /// open stream.
    pub fn chunk(&mut self, sender: &str, content: &str) -> Option<StreamEvent> {
        let buf = self.buffers.get_mut(sender)?;
        match self.policy {
            ChunkPolicy::Append => buf.push_str(content),
            ChunkPolicy::ReplaceLatest => {
                buf.clear();
                buf.push_str(content);
            }
        }
        Some(StreamEvent::Partial { sender: sender.to_string(), content: buf.clone() })
    }

    /// Anonymous streams have no start frame; the first chunk opens the buffer.
    fn anonymous_chunk(&mut self, content: &str) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(2);
        if !self.buffers.contains_key(ANONYMOUS_SENDER) {
            events.push(self.start(ANONYMOUS_SENDER));
        }
        events.extend(self.chunk(ANONYMOUS_SENDER, content));
        events
    }

    /// Close `sender`'s buffer and emit its message if it has real content.
    pub fn end(&mut self, sender: &str) -> Vec<StreamEvent> {
        let text = self.buffers.remove(sender);
        let mut events = vec![StreamEvent::TypingCleared { sender: sender.to_string() }];
        match text {
            Some(text) if !is_blank(&text) => {
                events.push(StreamEvent::Finished(Message::remote(sender, text)));
            }
            Some(_) => {
                tracing::debug!(sender, "stream ended without content, discarding");
            }
            None => {
                tracing::debug!(sender, "stream_end for sender with no open stream");
            }
        }
        events
    }

    /// Text buffered so far for `sender`, if a stream is open.
    pub fn buffered(&self, sender: &str) -> Option<&str> {
        self.buffers.get(sender).map(String::as_str)
    }

    pub fn is_streaming(&self, sender: &str) -> bool {
        self.buffers.contains_key(sender)
    }

    /// Senders with an open stream, sorted.
    pub fn open_senders(&self) -> Vec<String> {
        let mut senders: Vec<String> = self.buffers.keys().cloned().collect();
        senders.sort();
        senders
    }

    /// Drop every open buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Discard every unfinished turn, e.g. when its connection died. Yields a
    /// `TypingCleared` per sender, sorted; nothing is finalized.
    pub fn abandon(&mut self) -> Vec<StreamEvent> {
        let senders = self.open_senders();
        if !senders.is_empty() {
            tracing::debug!(?senders, "abandoning unfinished streams");
        }
        self.buffers.clear();
        senders.into_iter().map(|sender| StreamEvent::TypingCleared { sender }).collect()
    }
}

fn is_blank(text: &str) -> bool {
    text.is_empty() || text == SENTINEL_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn start(s: &str) -> InboundFrame {
        InboundFrame::StreamStart { sender: s.into() }
    }
    fn chunk(s: &str, c: &str) -> InboundFrame {
        InboundFrame::StreamChunk { sender: s.into(), content: c.into() }
    }
    fn end(s: &str) -> InboundFrame {
        InboundFrame::StreamEnd { sender: s.into() }
    }

    fn finished(events: &[StreamEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Finished(m) => Some((m.sender.clone(), m.content.clone())),
                _ => None,
            })
            .collect()
    }

    fn run(r: &mut FrameReassembler, frames: &[InboundFrame]) -> Vec<StreamEvent> {
        frames.iter().flat_map(|f| r.feed(f)).collect()
    }

    #[test]
    fn interleaved_senders_do_not_interfere() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        let events = run(
            &mut r,
            &[
                start("A"),
                chunk("A", "x"),
                start("B"),
                chunk("B", "y"),
                end("B"),
                chunk("A", "z"),
                end("A"),
            ],
        );
        assert_eq!(
            finished(&events),
            vec![("B".to_string(), "y".to_string()), ("A".to_string(), "xz".to_string())]
        );
        assert!(r.open_senders().is_empty());
    }

    #[test]
    fn start_then_end_emits_nothing() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        let events = run(&mut r, &[start("S"), end("S")]);
        assert!(finished(&events).is_empty());
        assert!(!r.is_streaming("S"));
        assert!(events.contains(&StreamEvent::TypingCleared { sender: "S".into() }));
    }

    #[test]
    fn sentinel_content_is_discarded() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        let events = run(&mut r, &[start("S"), chunk("S", "..."), end("S")]);
        assert!(finished(&events).is_empty());
    }

    #[test]
    fn chunk_without_start_is_noop() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        assert!(r.feed(&chunk("S", "lost")).is_empty());
        assert!(r.open_senders().is_empty());
    }

    #[test]
    fn chunk_after_end_is_noop() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        run(&mut r, &[start("S"), chunk("S", "a"), end("S")]);
        assert!(r.feed(&chunk("S", "late")).is_empty());
        assert!(r.buffered("S").is_none());
    }

    #[test]
    fn replace_latest_keeps_only_last_chunk() {
        let mut r = FrameReassembler::new(ChunkPolicy::ReplaceLatest);
        let events = run(&mut r, &[start("C"), chunk("C", "你好"), chunk("C", "你好，我想"), end("C")]);
        assert_eq!(finished(&events), vec![("C".to_string(), "你好，我想".to_string())]);
    }

    #[test]
    fn partial_events_track_buffer() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        r.feed(&start("A"));
        r.feed(&chunk("A", "he"));
        let ev = r.feed(&chunk("A", "llo"));
        assert_eq!(ev, vec![StreamEvent::Partial { sender: "A".into(), content: "hello".into() }]);
    }

    #[test]
    fn restart_resets_buffer() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        run(&mut r, &[start("A"), chunk("A", "stale"), start("A"), chunk("A", "fresh")]);
        assert_eq!(r.buffered("A"), Some("fresh"));
    }

    #[test]
    fn error_frame_bypasses_buffers() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        r.feed(&start("A"));
        let ev = r.feed(&InboundFrame::Error { content: "消息不能为空".into() });
        match &ev[..] {
            [StreamEvent::Finished(m)] => {
                assert!(m.is_error);
                assert_eq!(m.content, "消息不能为空");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(r.is_streaming("A"));
    }

    #[test]
    fn anonymous_chunks_open_implicitly() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        let first = r.feed(&InboundFrame::Chunk { content: "您".into() });
        assert_eq!(first[0], StreamEvent::Typing { sender: ANONYMOUS_SENDER.into() });
        r.feed(&InboundFrame::Chunk { content: "好".into() });
        let done = r.feed(&InboundFrame::End);
        assert_eq!(finished(&done), vec![(ANONYMOUS_SENDER.to_string(), "您好".to_string())]);
    }

    #[test]
    fn abandon_clears_typing_without_finalizing() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        run(&mut r, &[start("B"), chunk("B", "half"), start("A")]);
        r.feed(&InboundFrame::Chunk { content: "STALE-".into() });

        let events = r.abandon();
        assert_eq!(
            events,
            vec![
                StreamEvent::TypingCleared { sender: "A".into() },
                StreamEvent::TypingCleared { sender: "B".into() },
                StreamEvent::TypingCleared { sender: ANONYMOUS_SENDER.into() },
            ]
        );
        assert!(r.open_senders().is_empty());

        r.feed(&InboundFrame::Chunk { content: "fresh".into() });
        let done = r.feed(&InboundFrame::End);
        assert_eq!(finished(&done), vec![(ANONYMOUS_SENDER.to_string(), "fresh".to_string())]);
        assert!(r.abandon().is_empty());
    }

    #[test]
    fn non_stream_frames_are_ignored() {
        let mut r = FrameReassembler::new(ChunkPolicy::Append);
        assert!(r.feed(&InboundFrame::Pong).is_empty());
        assert!(!FrameReassembler::handles(&InboundFrame::Pong));
        assert!(FrameReassembler::handles(&InboundFrame::End));
    }

    #[test]
    fn chunk_policy_serde_names() {
        assert_eq!(serde_json::to_string(&ChunkPolicy::ReplaceLatest).unwrap(), "\"replace_latest\"");
        assert_eq!(ChunkPolicy::Append.to_string(), "append");
    }

    proptest! {
        #[test]
        fn concurrent_streams_stay_isolated(
            a in proptest::collection::vec("[a-z]{1,4}", 1..6),
            b in proptest::collection::vec("[A-Z]{1,4}", 1..6),
        ) {
            let mut r = FrameReassembler::new(ChunkPolicy::Append);
            r.feed(&start("A"));
            r.feed(&start("B"));
            let longest = a.len().max(b.len());
            for i in 0..longest {
                if let Some(c) = a.get(i) { r.feed(&chunk("A", c)); }
                if let Some(c) = b.get(i) { r.feed(&chunk("B", c)); }
            }
            let mut events = r.feed(&end("A"));
            events.extend(r.feed(&end("B")));
            let out = finished(&events);
            prop_assert_eq!(out[0].1.clone(), a.concat());
            prop_assert_eq!(out[1].1.clone(), b.concat());
        }
    }
}
