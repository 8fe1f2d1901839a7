use std::io::{self, Cursor, Read, Write};

use brotli::{Decompressor, DecompressorWriter};
use flate2::read::{GzDecoder, ZlibDecoder};
use zstd::stream::read::Decoder as ZstdDecoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
}

impl ContentCoding {
    /// `None` for codings the gateway cannot decode. Bodies with such a
    /// coding are forwarded untouched.
    pub fn from_header(value: Option<&str>) -> Option<Self> {
        match value.map(|enc| enc.trim().to_ascii_lowercase()) {
            None => Some(ContentCoding::Identity),
            Some(enc) => match enc.as_str() {
                "" | "identity" => Some(ContentCoding::Identity),
                "gzip" | "x-gzip" => Some(ContentCoding::Gzip),
                "deflate" => Some(ContentCoding::Deflate),
                "br" => Some(ContentCoding::Brotli),
                "zstd" => Some(ContentCoding::Zstd),
                _ => None,
            },
        }
    }
}

pub fn decode_body(bytes: &[u8], coding: ContentCoding) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match coding {
        ContentCoding::Identity => return Ok(bytes.to_vec()),
        ContentCoding::Gzip => {
            GzDecoder::new(Cursor::new(bytes)).read_to_end(&mut out)?;
        }
        ContentCoding::Deflate => {
            ZlibDecoder::new(Cursor::new(bytes)).read_to_end(&mut out)?;
        }
        ContentCoding::Brotli => {
            Decompressor::new(Cursor::new(bytes), 4096).read_to_end(&mut out)?;
        }
        ContentCoding::Zstd => {
            ZstdDecoder::new(Cursor::new(bytes))?.read_to_end(&mut out)?;
        }
    }
    Ok(out)
}

/// Push-style decoder: compressed bytes are written in, plain bytes come out
/// of the wrapped writer as soon as they are available.
pub enum DecodingWriter<W: Write> {
    Identity(W),
    Gzip(flate2::write::GzDecoder<W>),
    Deflate(flate2::write::ZlibDecoder<W>),
    Brotli(DecompressorWriter<W>),
    Zstd(zstd::stream::write::Decoder<'static, W>),
}

impl<W: Write> DecodingWriter<W> {
    pub fn new(inner: W, coding: ContentCoding) -> io::Result<Self> {
        Ok(match coding {
            ContentCoding::Identity => DecodingWriter::Identity(inner),
            ContentCoding::Gzip => DecodingWriter::Gzip(flate2::write::GzDecoder::new(inner)),
            ContentCoding::Deflate => {
                DecodingWriter::Deflate(flate2::write::ZlibDecoder::new(inner))
            }
            ContentCoding::Brotli => DecodingWriter::Brotli(DecompressorWriter::new(inner, 4096)),
            ContentCoding::Zstd => DecodingWriter::Zstd(zstd::stream::write::Decoder::new(inner)?),
        })
    }

    /// Flushes any buffered output and hands back the wrapped writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            DecodingWriter::Identity(inner) => Ok(inner),
            DecodingWriter::Gzip(decoder) => decoder.finish(),
            DecodingWriter::Deflate(decoder) => decoder.finish(),
            DecodingWriter::Brotli(mut decoder) => {
                decoder.flush()?;
                decoder.into_inner().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "truncated brotli stream")
                })
            }
            DecodingWriter::Zstd(mut decoder) => {
                decoder.flush()?;
                Ok(decoder.into_inner())
            }
        }
    }
}

impl<W: Write> Write for DecodingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DecodingWriter::Identity(inner) => inner.write(buf),
            DecodingWriter::Gzip(decoder) => decoder.write(buf),
            DecodingWriter::Deflate(decoder) => decoder.write(buf),
            DecodingWriter::Brotli(decoder) => decoder.write(buf),
            DecodingWriter::Zstd(decoder) => decoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DecodingWriter::Identity(inner) => inner.flush(),
            DecodingWriter::Gzip(decoder) => decoder.flush(),
            DecodingWriter::Deflate(decoder) => decoder.flush(),
            DecodingWriter::Brotli(decoder) => decoder.flush(),
            DecodingWriter::Zstd(decoder) => decoder.flush(),
        }
    }
}
