use std::fmt::Display;
use std::io;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::frame::{FrameCodec, FrameError, MessageType};

/// Decode a streamed synthesis response into its audio payloads
///
/// Ends after the last frame. An error frame, a malformed frame or a body
/// that stops before the last frame ends the stream with an error.
pub fn audio_payloads<S, E>(upstream: S) -> impl Stream<Item = Result<Bytes, FrameError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = StreamReader::new(upstream.map(|chunk| chunk.map_err(|e| io::Error::other(e.to_string()))));
    let frames = Box::pin(FramedRead::new(reader, FrameCodec));

    futures_util::stream::unfold((frames, false), |(mut frames, done)| async move {
        if done {
            return None;
        }

        loop {
            let frame = match frames.next().await {
                None => return Some((Err(FrameError::MissingFinalFrame), (frames, true))),
                Some(Err(e)) => return Some((Err(e), (frames, true))),
                Some(Ok(frame)) => frame,
            };

            let last = frame.is_last();
            match frame.message_type {
                MessageType::Error => {
                    let error = frame.into_remote_error().unwrap_or(FrameError::MissingFinalFrame);
                    return Some((Err(error), (frames, true)));
                }
                MessageType::AudioOnlyResponse if !frame.payload.is_empty() => {
                    return Some((Ok(frame.payload), (frames, last)));
                }
                _ if last => return None,
                _ => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::frame::Frame;

    fn wire(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.to_bytes().unwrap().to_vec()).collect()
    }

    /// Split `bytes` into chunks of `size` to exercise partial frames
    fn chunked(bytes: Vec<u8>, size: usize) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        let chunks: Vec<_> = bytes
            .chunks(size)
            .map(|c| Ok::<_, io::Error>(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    async fn collect(bytes: Vec<u8>, size: usize) -> Vec<Result<Bytes, FrameError>> {
        audio_payloads(chunked(bytes, size)).collect().await
    }

    #[tokio::test]
    async fn yields_audio_until_last_frame() {
        let bytes = wire(&[
            Frame {
                last: false,
                ..Frame::server_response(&b"{\"event\":\"started\"}"[..])
            },
            Frame::audio_response(1, false, &b"abc"[..]),
            Frame::audio_response(2, false, &b"def"[..]),
            Frame::audio_response(3, true, &b"g"[..]),
            Frame::audio_response(4, false, &b"ignored"[..]),
        ]);

        let items = collect(bytes, 5).await;
        let audio: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(audio, vec![Bytes::from("abc"), Bytes::from("def"), Bytes::from("g")]);
    }

    #[tokio::test]
    async fn error_frame_ends_stream() {
        let bytes = wire(&[
            Frame::audio_response(1, false, &b"abc"[..]),
            Frame::error(55_000_000, "voice not found"),
        ]);

        let items = collect(bytes, 64).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(FrameError::Remote { code: 55_000_000, .. })));
    }

    #[tokio::test]
    async fn missing_last_frame_is_an_error() {
        let bytes = wire(&[Frame::audio_response(1, false, &b"abc"[..])]);

        let items = collect(bytes, 3).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(FrameError::MissingFinalFrame)));
    }

    #[tokio::test]
    async fn transport_error_is_forwarded() {
        let first = Frame::audio_response(1, false, &b"abc"[..]).to_bytes().unwrap();
        let upstream = stream::iter(vec![Ok(first), Err("connection reset")]);

        let items: Vec<_> = audio_payloads(upstream).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(FrameError::Io(e)) if e.to_string() == "connection reset"));
    }
}
