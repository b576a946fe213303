//! Charset sniffing and transcoding to UTF-8.
//!
//! A bounded sample of leading lines decides the source encoding: a BOM wins,
//! valid UTF-8 passes through untouched, anything else goes to `chardetng`.
//! Non-UTF-8 input is decoded chunk by chunk, so memory use does not grow with
//! the file.

use std::io::{self, Cursor};

use bytes::Bytes;
use chardetng::EncodingDetector;
use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

/// Upper bound on sampled bytes, for files with very long lines.
const MAX_SAMPLE_BYTES: u64 = 64 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Detects the encoding of `reader` from its first `sample_lines` lines and
/// returns a reader yielding UTF-8.
pub async fn to_utf8(reader: BoxedReader, sample_lines: usize) -> io::Result<BoxedReader> {
    let mut reader = BufReader::new(reader);
    let mut sample = Vec::new();
    {
        let mut limited = (&mut reader).take(MAX_SAMPLE_BYTES);
        for _ in 0..sample_lines {
            if limited.read_until(b'\n', &mut sample).await? == 0 {
                break;
            }
        }
    }
    let at_eof = reader.fill_buf().await?.is_empty();

    let encoding = detect(&sample, at_eof);
    let has_bom = Encoding::for_bom(&sample).is_some();
    debug!(encoding = encoding.name(), bom = has_bom, "charset detected");

    let restored = Cursor::new(sample).chain(reader);
    if encoding == UTF_8 && !has_bom {
        return Ok(Box::new(restored));
    }
    Ok(Box::new(transcode(restored, encoding)))
}

/// Best guess for the encoding of `sample`.
pub fn detect(sample: &[u8], at_eof: bool) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(sample) {
        return encoding;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => return UTF_8,
        // Only the sample boundary split a character.
        Err(e) if e.error_len().is_none() && !at_eof => return UTF_8,
        Err(_) => {},
    }

    let mut detector = EncodingDetector::new();
    detector.feed(sample, at_eof);
    detector.guess(None, true)
}

fn decode_chunk(decoder: &mut Decoder, mut input: &[u8], last: bool) -> Bytes {
    let mut output = String::new();
    loop {
        reserve(decoder, &mut output, input.len());
        let (result, read, _) = decoder.decode_to_string(input, &mut output, last);
        input = &input[read..];
        match result {
            CoderResult::InputEmpty => return Bytes::from(output),
            CoderResult::OutputFull => continue,
        }
    }
}

fn reserve(decoder: &Decoder, output: &mut String, input_len: usize) {
    let needed = decoder
        .max_utf8_buffer_length(input_len)
        .unwrap_or(input_len.saturating_mul(3) + 16);
    // A pending partial character may still need room on empty input.
    output.reserve(needed.max(4));
}

fn transcode<R>(reader: R, encoding: &'static Encoding) -> impl AsyncRead + Send + Unpin
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let state = Some((ReaderStream::new(reader), encoding.new_decoder_with_bom_removal()));
    let decoded = futures::stream::unfold(state, |state| async move {
        let (mut chunks, mut decoder) = state?;
        match chunks.next().await {
            Some(Ok(chunk)) => {
                let text = decode_chunk(&mut decoder, &chunk, false);
                Some((Ok(text), Some((chunks, decoder))))
            },
            Some(Err(e)) => Some((Err::<Bytes, io::Error>(e), None)),
            None => Some((Ok(decode_chunk(&mut decoder, &[], true)), None)),
        }
    });
    StreamReader::new(Box::pin(decoded))
}
