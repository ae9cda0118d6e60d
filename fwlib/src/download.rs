use std::{
    cmp,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use log::{debug, trace};
use reqwest::{header::CONTENT_LENGTH, Method, Response};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_stream::StreamExt;

use crate::{
    firmware::FirmwareRecord,
    transport::{HttpTransport, RequestOptions, TransportError},
};

/// Block size when the server does not report the file size
pub const DEFAULT_BLOCK_SIZE: usize = 1_000_000;

/// Smallest block size used when the file size is known
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Number of blocks (and progress updates) a file of known size is split into
pub const PROGRESS_STEPS: u64 = 20;

/// Bound on receiving the response headers and on each body read.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);

const OUTPUT_EXT: &str = "dat";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Firmware download request failed: {0}")]
    RequestFailed(#[from] TransportError),
    #[error("I/O error for {path:?}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path, source: io::Error) -> DownloadError {
    DownloadError::IoFailure {
        path: path.to_owned(),
        source,
    }
}

/// Choose the write block size for a download. Files of known size are split
/// into roughly [`PROGRESS_STEPS`] blocks of at least [`MIN_BLOCK_SIZE`] bytes.
pub fn block_size(total_bytes: Option<u64>) -> usize {
    match total_bytes {
        Some(total) => {
            let size = cmp::max(MIN_BLOCK_SIZE as u64, total / PROGRESS_STEPS);
            usize::try_from(size).unwrap_or(usize::MAX)
        }
        None => DEFAULT_BLOCK_SIZE,
    }
}

/// Progress of a download, reported after every block written.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DownloadProgress {
    pub bytes_written: u64,
    /// `None` if the server did not send a `Content-Length` header
    pub total_bytes: Option<u64>,
    pub block_size: usize,
}

impl DownloadProgress {
    /// Integer percentage. Only available when the total size is known.
    pub fn percent(&self) -> Option<u64> {
        self.total_bytes
            .filter(|t| *t > 0)
            .map(|t| self.bytes_written.saturating_mul(100) / t)
    }
}

/// Path where a firmware file is saved:
/// `<root>/<device>/<file name>_<date>.dat`. Spaces in the file name are
/// replaced with underscores and slashes in both components are replaced with
/// dashes so that neither introduces extra directories.
pub fn output_path(root: &Path, device: &str, record: &FirmwareRecord) -> PathBuf {
    let device_dir = device.replace('/', "-");
    let file_name = record.file_name.replace(' ', "_").replace('/', "-");

    root.join(device_dir)
        .join(format!("{}_{}.{}", file_name, record.date, OUTPUT_EXT))
}

fn content_length(response: &Response) -> Option<u64> {
    response.headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn write_block(file: &mut File, path: &Path, block: &[u8]) -> Result<(), DownloadError> {
    trace!("Writing {} bytes", block.len());
    file.write_all(block).await.map_err(|e| io_error(path, e))
}

/// Copy the stream to the file in blocks of exactly `block_size` bytes (except
/// possibly the last one). An empty chunk from the stream is treated as the
/// end of the data.
async fn copy_blocks<S, E, F>(
    stream: S,
    file: &mut File,
    path: &Path,
    total_bytes: Option<u64>,
    read_timeout: Option<Duration>,
    progress: &mut F,
) -> Result<u64, DownloadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<TransportError>,
    F: FnMut(&DownloadProgress),
{
    tokio::pin!(stream);

    let block_size = block_size(total_bytes);
    let mut buf = BytesMut::with_capacity(block_size);
    let mut state = DownloadProgress {
        bytes_written: 0,
        total_bytes,
        block_size,
    };

    debug!("Downloading with block size {block_size} (total: {total_bytes:?})");

    loop {
        let next = match read_timeout {
            Some(t) => tokio::time::timeout(t, stream.next()).await
                .map_err(|_| TransportError::Timeout)?,
            None => stream.next().await,
        };

        let chunk = match next {
            Some(c) => c.map_err(|e| DownloadError::RequestFailed(e.into()))?,
            None => break,
        };
        if chunk.is_empty() {
            debug!("Received empty chunk; treating as end of stream");
            break;
        }

        buf.extend_from_slice(&chunk);

        while buf.len() >= block_size {
            let block = buf.split_to(block_size);
            write_block(file, path, &block).await?;

            state.bytes_written += block.len() as u64;
            progress(&state);
        }
    }

    if !buf.is_empty() {
        write_block(file, path, &buf).await?;

        state.bytes_written += buf.len() as u64;
        progress(&state);
    }

    Ok(state.bytes_written)
}

/// Write a byte stream to `path`, creating parent directories as needed and
/// truncating any existing file. The file is flushed and closed whether or not
/// the copy succeeds. Returns the number of bytes written.
pub async fn write_stream<S, E, F>(
    stream: S,
    total_bytes: Option<u64>,
    path: &Path,
    read_timeout: Option<Duration>,
    mut progress: F,
) -> Result<u64, DownloadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<TransportError>,
    F: FnMut(&DownloadProgress),
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
    }

    let mut file = File::create(path).await.map_err(|e| io_error(path, e))?;

    let result = copy_blocks(stream, &mut file, path, total_bytes, read_timeout, &mut progress).await;
    let flushed = file.flush().await.map_err(|e| io_error(path, e));
    drop(file);

    let written = result?;
    flushed?;

    Ok(written)
}

/// Streams firmware files to disk.
#[derive(Clone)]
pub struct Downloader {
    transport: HttpTransport,
    timeout: Duration,
}

impl Downloader {
    pub fn new(transport: HttpTransport) -> Self {
        Self {
            transport,
            timeout: DOWNLOAD_TIMEOUT,
        }
    }

    /// Override the timeout for receiving the response headers and for each
    /// body read.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Download `url` to `path`. `progress` is called after every block is
    /// written. Returns the number of bytes written.
    pub async fn download<F>(
        &self,
        url: &str,
        path: &Path,
        progress: F,
    ) -> Result<u64, DownloadError>
    where
        F: FnMut(&DownloadProgress),
    {
        debug!("Downloading {url} to {path:?}");

        let options = RequestOptions::new().timeout(self.timeout);
        let r = self.transport.execute(Method::GET, url, &options).await?;

        let total_bytes = content_length(&r);
        debug!("Content length: {total_bytes:?}");

        write_stream(r.bytes_stream(), total_bytes, path, Some(self.timeout), progress).await
    }
}
