use std::collections::VecDeque;

use futures::stream::{self, BoxStream, StreamExt};

use super::models::OllamaStreamChunk;
use crate::providers::types::{ByteStream, ProviderError, StreamEvent};

type Frame = Result<StreamEvent, ProviderError>;

/// Incremental NDJSON decoder. Chunk boundaries need not line up with
/// record boundaries; the trailing partial line is kept until the next
/// chunk (or `finish`).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    accumulated: String,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal or error record was seen, or `finish` ran.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }

        self.buffer.extend_from_slice(chunk);

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.decode_line(&line, true, &mut frames);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }

        frames
    }

    /// The transport ended. Whatever is left is parsed best-effort; a
    /// fragment there becomes a final delta but never a `Done`.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }

        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest, false, &mut frames);
        self.finished = true;
        frames
    }

    fn decode_line(&mut self, raw: &[u8], terminal_allowed: bool, frames: &mut Vec<Frame>) {
        let line = raw.trim_ascii();
        if line.is_empty() {
            return;
        }

        let mut chunk: OllamaStreamChunk = match serde_json::from_slice(line) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Skipping malformed stream line: {}", e);
                return;
            }
        };

        if let Some(error) = chunk.error.take() {
            frames.push(Err(ProviderError::Backend(error)));
            self.finished = true;
            return;
        }

        if let Some(fragment) = chunk.fragment() {
            if !fragment.is_empty() {
                self.accumulated.push_str(fragment);
                frames.push(Ok(StreamEvent::Delta(fragment.to_string())));
            }
        }

        if chunk.done && terminal_allowed {
            frames.push(Ok(StreamEvent::Done(self.accumulated.clone())));
            self.finished = true;
        }
    }
}

struct DecodeState {
    bytes: ByteStream,
    decoder: FrameDecoder,
    pending: VecDeque<Frame>,
    exhausted: bool,
}

/// Pull-based event sequence over a response body. Ends after `Done`, after
/// the first error, or when the transport runs dry.
pub fn decode_stream(bytes: ByteStream) -> BoxStream<'static, Frame> {
    let state = DecodeState {
        bytes,
        decoder: FrameDecoder::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return match frame {
                    Ok(event) => Some((Ok(event), Some(state))),
                    Err(e) => Some((Err(e), None)),
                };
            }

            if state.exhausted || state.decoder.is_finished() {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.feed(&chunk);
                    state.pending.extend(frames);
                }
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    state.exhausted = true;
                    let frames = state.decoder.finish();
                    state.pending.extend(frames);
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn scripted(chunks: Vec<&'static [u8]>) -> ByteStream {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))).boxed()
    }

    async fn collect(bytes: ByteStream) -> Vec<Frame> {
        decode_stream(bytes).collect().await
    }

    fn events(frames: Vec<Frame>) -> Vec<StreamEvent> {
        frames.into_iter().map(|f| f.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_records_split_across_chunks_reassemble() {
        let frames = collect(scripted(vec![
            b"{\"message\":{\"content\":\"ab\"}}\n{\"mess",
            b"age\":{\"content\":\"cd\"},\"done\":false}\n{\"done\":true}\n",
        ]))
        .await;

        assert_eq!(
            events(frames),
            vec![
                StreamEvent::Delta("ab".into()),
                StreamEvent::Delta("cd".into()),
                StreamEvent::Done("abcd".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let frames = collect(scripted(vec![
            b"{\"message\":{\"content\":\"one\"}}\n",
            b"not json at all\n",
            b"{\"message\":{\"content\":\"two\"}}\n{\"done\":true}\n",
        ]))
        .await;

        assert_eq!(
            events(frames),
            vec![
                StreamEvent::Delta("one".into()),
                StreamEvent::Delta("two".into()),
                StreamEvent::Done("onetwo".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_nothing_after_done_is_emitted() {
        let frames = collect(scripted(vec![
            b"{\"message\":{\"content\":\"x\"},\"done\":true}\n{\"message\":{\"content\":\"late\"}}\n",
        ]))
        .await;

        assert_eq!(
            events(frames),
            vec![StreamEvent::Delta("x".into()), StreamEvent::Done("x".into())]
        );
    }

    #[tokio::test]
    async fn test_transport_end_flushes_partial_line_without_done() {
        let frames = collect(scripted(vec![
            b"{\"message\":{\"content\":\"he\"}}\n",
            b"{\"message\":{\"content\":\"llo\"}}",
        ]))
        .await;

        assert_eq!(
            events(frames),
            vec![StreamEvent::Delta("he".into()), StreamEvent::Delta("llo".into())]
        );
    }

    #[tokio::test]
    async fn test_multibyte_text_split_mid_character() {
        let line = "{\"message\":{\"content\":\"caf\u{e9} \u{1F980}\"}}\n{\"done\":true}\n";
        let bytes = line.as_bytes();
        let split = line.find('\u{e9}').unwrap() + 1;
        let (a, b) = bytes.split_at(split);
        let stream = stream::iter(vec![
            Ok(Bytes::copy_from_slice(a)),
            Ok(Bytes::copy_from_slice(b)),
        ])
        .boxed();

        let frames = collect(stream).await;
        assert_eq!(
            events(frames),
            vec![
                StreamEvent::Delta("caf\u{e9} \u{1F980}".into()),
                StreamEvent::Done("caf\u{e9} \u{1F980}".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_crlf_and_generate_style_records() {
        let frames = collect(scripted(vec![
            b"{\"response\":\"a\"}\r\n\r\n{\"response\":\"b\",\"done\":true}\r\n",
        ]))
        .await;

        assert_eq!(
            events(frames),
            vec![
                StreamEvent::Delta("a".into()),
                StreamEvent::Delta("b".into()),
                StreamEvent::Done("ab".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_record_terminates_with_error() {
        let mut frames = collect(scripted(vec![
            b"{\"message\":{\"content\":\"partial\"}}\n{\"error\":\"model crashed\"}\n{\"done\":true}\n",
        ]))
        .await;

        assert_eq!(frames.len(), 2);
        let last = frames.pop().unwrap();
        assert!(matches!(last, Err(ProviderError::Backend(ref m)) if m == "model crashed"));
        assert!(matches!(frames[0], Ok(StreamEvent::Delta(ref s)) if s == "partial"));
    }

    #[tokio::test]
    async fn test_transport_error_ends_sequence() {
        let stream = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"message\":{\"content\":\"a\"}}\n")),
            Err(ProviderError::NetworkError("connection reset".into())),
            Ok(Bytes::from_static(b"{\"done\":true}\n")),
        ])
        .boxed();

        let frames = collect(stream).await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Err(ProviderError::NetworkError(_))));
    }

    #[test]
    fn test_decoder_ignores_feed_after_finish() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"{\"done\":true}\n");
        assert_eq!(frames.len(), 1);
        assert!(decoder.is_finished());
        assert!(decoder.feed(b"{\"message\":{\"content\":\"x\"}}\n").is_empty());
        assert!(decoder.finish().is_empty());
        assert_eq!(decoder.accumulated(), "");
    }
}
