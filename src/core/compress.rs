// Stream compression for block bodies: identity, zlib-framed deflate, and zstd.
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::str::FromStr;

use crate::core::error::{Error, ErrorCode, ErrorKind};

pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Compression {
    #[default]
    None,
    Deflate {
        level: u32,
    },
    Zstd {
        level: i32,
    },
}

impl Compression {
    pub fn deflate() -> Self {
        Compression::Deflate {
            level: DEFAULT_DEFLATE_LEVEL,
        }
    }

    pub fn zstd() -> Self {
        Compression::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }

    pub fn deflate_level(level: u32) -> Result<Self, Error> {
        if level > 9 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("deflate level {level} is outside 0..=9")));
        }
        Ok(Compression::Deflate { level })
    }

    pub fn zstd_level(level: i32) -> Result<Self, Error> {
        if !(1..=22).contains(&level) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("zstd level {level} is outside 1..=22")));
        }
        Ok(Compression::Zstd { level })
    }

    /// Wire name used in `Content-Encoding`, `Accept-Encoding`, and session documents.
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "identity",
            Compression::Deflate { .. } => "deflate",
            Compression::Zstd { .. } => "zstd",
        }
    }

    /// Maps a wire name back to the algorithm at its default level.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "identity" | "none" => Some(Compression::None),
            "deflate" => Some(Compression::deflate()),
            "zstd" => Some(Compression::zstd()),
            _ => None,
        }
    }

    /// Levels are a sender-side choice; only the algorithm has to agree.
    pub fn matches_encoding(self, encoding: Option<&str>) -> bool {
        match encoding {
            Some(name) => Compression::from_name(name).map(Compression::name) == Some(self.name()),
            None => self == Compression::None,
        }
    }

    pub fn ensure_encoding(self, encoding: Option<&str>) -> Result<(), Error> {
        if self.matches_encoding(encoding) {
            return Ok(());
        }
        Err(Error::from_code(ErrorCode::CompressionMismatch).with_message(format!(
            "expected {} encoding, got {}",
            self.name(),
            encoding.unwrap_or("identity")
        )))
    }

    pub fn wrap_writer<W: Write>(self, inner: W) -> Result<CompressWriter<W>, Error> {
        let writer = match self {
            Compression::None => CompressWriter::Identity(inner),
            Compression::Deflate { level } => CompressWriter::Deflate(
                flate2::write::ZlibEncoder::new(inner, flate2::Compression::new(level.min(9))),
            ),
            Compression::Zstd { level } => {
                let encoder = zstd::stream::write::Encoder::new(inner, level).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start zstd encoder")
                        .with_source(err)
                })?;
                CompressWriter::Zstd(encoder)
            }
        };
        Ok(writer)
    }

    pub fn wrap_reader<R: Read>(self, inner: R) -> Result<DecompressReader<R>, Error> {
        let reader = match self {
            Compression::None => DecompressReader::Identity(inner),
            Compression::Deflate { .. } => {
                DecompressReader::Deflate(flate2::read::ZlibDecoder::new(inner))
            }
            Compression::Zstd { .. } => {
                let decoder = zstd::stream::read::Decoder::new(inner).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start zstd decoder")
                        .with_source(err)
                })?;
                DecompressReader::Zstd(decoder)
            }
        };
        Ok(reader)
    }

    pub fn compress_bytes(self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        let mut writer = self.wrap_writer(Vec::with_capacity(bytes.len() / 2))?;
        writer.write_all(bytes).map_err(compression_failed)?;
        writer.finish().map_err(compression_failed)
    }

    pub fn decompress_bytes(self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        let mut reader = self.wrap_reader(bytes)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).map_err(|err| {
            Error::from_code(ErrorCode::CompressionMismatch)
                .with_message(format!("payload is not valid {}", self.name()))
                .with_source(err)
        })?;
        Ok(out)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Compression::from_name(s).ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!("unknown compression {s:?}"))
        })
    }
}

fn compression_failed(err: io::Error) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("compression failed")
        .with_source(err)
}

pub enum CompressWriter<W: Write> {
    Identity(W),
    Deflate(flate2::write::ZlibEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressWriter<W> {
    /// Writes the closing frame and hands back the sink.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressWriter::Identity(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            CompressWriter::Deflate(encoder) => {
                let mut inner = encoder.finish()?;
                inner.flush()?;
                Ok(inner)
            }
            CompressWriter::Zstd(encoder) => {
                let mut inner = encoder.finish()?;
                inner.flush()?;
                Ok(inner)
            }
        }
    }

    pub fn get_ref(&self) -> &W {
        match self {
            CompressWriter::Identity(inner) => inner,
            CompressWriter::Deflate(encoder) => encoder.get_ref(),
            CompressWriter::Zstd(encoder) => encoder.get_ref(),
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        match self {
            CompressWriter::Identity(inner) => inner,
            CompressWriter::Deflate(encoder) => encoder.get_mut(),
            CompressWriter::Zstd(encoder) => encoder.get_mut(),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::Identity(inner) => inner.write(buf),
            CompressWriter::Deflate(encoder) => encoder.write(buf),
            CompressWriter::Zstd(encoder) => encoder.write(buf),
        }
    }

    // Compressors only push whole blocks on flush; chunking happens below them.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub enum DecompressReader<R: Read> {
    Identity(R),
    Deflate(flate2::read::ZlibDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressReader::Identity(inner) => inner.read(buf),
            DecompressReader::Deflate(decoder) => decoder.read(buf),
            DecompressReader::Zstd(decoder) => decoder.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Compression;
    use crate::core::error::{ErrorCode, ErrorKind};
    use std::io::{Read, Write};

    fn sample() -> Vec<u8> {
        let mut bytes = Vec::new();
        for i in 0..20_000u32 {
            bytes.extend_from_slice(&(i % 251).to_le_bytes());
        }
        bytes
    }

    #[test]
    fn every_algorithm_round_trips() {
        let bytes = sample();
        for compression in [
            Compression::None,
            Compression::deflate(),
            Compression::Deflate { level: 0 },
            Compression::zstd(),
            Compression::Zstd { level: 19 },
        ] {
            let packed = compression.compress_bytes(&bytes).expect("compress");
            let unpacked = compression.decompress_bytes(&packed).expect("decompress");
            assert_eq!(unpacked, bytes, "{compression:?}");
        }
    }

    #[test]
    fn empty_input_produces_terminated_frame() {
        for compression in [Compression::deflate(), Compression::zstd()] {
            let packed = compression.compress_bytes(&[]).expect("compress");
            assert!(!packed.is_empty());
            assert!(compression.decompress_bytes(&packed).expect("decompress").is_empty());
        }
    }

    #[test]
    fn streaming_writer_matches_reader() {
        let mut writer = Compression::zstd().wrap_writer(Vec::new()).expect("writer");
        for chunk in sample().chunks(777) {
            writer.write_all(chunk).expect("write");
        }
        let packed = writer.finish().expect("finish");
        let mut reader = Compression::zstd().wrap_reader(packed.as_slice()).expect("reader");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, sample());
    }

    #[test]
    fn names_and_levels() {
        assert_eq!(Compression::from_name("DEFLATE"), Some(Compression::deflate()));
        assert_eq!(Compression::from_name("identity"), Some(Compression::None));
        assert_eq!(Compression::from_name("gzip"), None);
        assert_eq!("zstd".parse::<Compression>().expect("parse"), Compression::zstd());
        assert_eq!(
            "lz4".parse::<Compression>().expect_err("unknown").kind(),
            ErrorKind::Usage
        );
        assert!(Compression::deflate_level(10).is_err());
        assert!(Compression::zstd_level(0).is_err());
        assert_eq!(
            Compression::zstd_level(22).expect("max"),
            Compression::Zstd { level: 22 }
        );
    }

    #[test]
    fn encoding_agreement_ignores_level() {
        let chosen = Compression::Deflate { level: 1 };
        assert!(chosen.matches_encoding(Some("deflate")));
        assert!(!chosen.matches_encoding(Some("zstd")));
        assert!(!chosen.matches_encoding(None));
        assert!(Compression::None.matches_encoding(None));
        let err = chosen.ensure_encoding(Some("zstd")).expect_err("mismatch");
        assert_eq!(err.code(), Some(ErrorCode::CompressionMismatch));
    }

    #[test]
    fn wrong_algorithm_is_detected() {
        let packed = Compression::zstd().compress_bytes(&sample()).expect("compress");
        let err = Compression::deflate()
            .decompress_bytes(&packed)
            .expect_err("wrong algorithm");
        assert_eq!(err.code(), Some(ErrorCode::CompressionMismatch));
    }
}
