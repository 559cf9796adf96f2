use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::Transcoder;
use crate::ImportError;

/// Read buffer for both the raw file and the CSV reader (1 MiB).
pub(crate) const READ_BUFFER: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Pick decompression from the file name.
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".gz") {
            Compression::Gzip
        } else if name.ends_with(".zst") || name.ends_with(".zstd") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// What we know about an input stream and what happened while decoding it.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    pub name: String,
    pub compression: Compression,
    pub charset: &'static encoding_rs::Encoding,
    malformed: Arc<AtomicU64>,
}

impl SourceMeta {
    pub fn new(name: impl Into<String>, charset: &'static encoding_rs::Encoding) -> Self {
        let name = name.into();
        Self {
            compression: Compression::from_name(&name),
            name,
            charset,
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Decoded chunks that contained bytes invalid for `charset`.
    pub fn malformed_chunks(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Wrap any reader with buffering, optional decompression and transcoding to
/// UTF-8. The returned meta shares the malformed-input counter with the
/// reader.
pub fn build_source_reader<R>(raw: R, meta: SourceMeta) -> (impl AsyncRead + Unpin + Send, SourceMeta)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = BufReader::with_capacity(READ_BUFFER, raw);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = match meta.compression {
        Compression::Gzip => Box::new(GzipDecoder::new(buf)),
        Compression::Zstd => Box::new(ZstdDecoder::new(buf)),
        Compression::None => Box::new(buf),
    };

    // UTF-8 input is passed through untouched; the CSV layer checks it per row.
    let reader: Box<dyn AsyncRead + Unpin + Send> = if meta.charset == encoding_rs::UTF_8 {
        decompressed
    } else {
        let transcoder = Transcoder::new(meta.charset, meta.malformed.clone());
        Box::new(StreamReader::new(FramedRead::new(decompressed, transcoder)))
    };

    (reader, meta)
}

/// Open a local export file. A missing file is reported as
/// [`ImportError::NotFound`].
pub async fn reader_from_path(
    path: &Path,
    charset: &'static encoding_rs::Encoding,
) -> Result<(impl AsyncRead + Unpin + Send, SourceMeta), ImportError> {
    let file = File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ImportError::NotFound(path.to_path_buf()),
        _ => ImportError::Io(e),
    })?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    Ok(build_source_reader(file, SourceMeta::new(name, charset)))
}
