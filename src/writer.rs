//! Streaming upload of a block object.

use std::{path::Path as FsPath, sync::Arc};

use object_store::{buffered::BufWriter as UploadWriter, path::Path, ObjectStore};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter, DuplexStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bufferpool::{PooledBuffer, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE},
    error::{with_cleanup, BlockError},
    executor::recover_panic,
    observability::{log_debug, log_warn},
};

const COPY_BUFFER_SIZE: usize = MIN_BUFFER_SIZE;

/// Sequential writer of a block object.
///
/// Bytes go through an in-process pipe to a background task that uploads
/// them, so the object is never held in memory as a whole. The writer keeps
/// the running offset used to build tables of contents.
///
/// The object only becomes visible after a successful [`Writer::close`].
/// [`Writer::close_with_error`], or dropping the writer, aborts the upload.
pub struct Writer {
    path: Path,
    buf: BufWriter<DuplexStream>,
    offset: u64,
    copy_buf: Option<PooledBuffer>,
    cancel: CancellationToken,
    upload: Option<JoinHandle<Result<(), BlockError>>>,
}

impl Writer {
    pub fn new(storage: Arc<dyn ObjectStore>, path: Path) -> Self {
        let (tx, rx) = tokio::io::duplex(MAX_BUFFER_SIZE);
        let cancel = CancellationToken::new();
        let upload = tokio::spawn(recover_panic(upload(
            storage,
            path.clone(),
            rx,
            cancel.clone(),
        )));
        Self {
            path,
            buf: BufWriter::with_capacity(MIN_BUFFER_SIZE, tx),
            offset: 0,
            copy_buf: None,
            cancel,
            upload: Some(upload),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes written so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), BlockError> {
        self.buf.write_all(data).await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Copy everything `reader` yields, returning the number of bytes copied.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> Result<u64, BlockError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = self
            .copy_buf
            .take()
            .unwrap_or_else(|| PooledBuffer::get(COPY_BUFFER_SIZE));
        chunk.resize(COPY_BUFFER_SIZE, 0);
        let mut copied = 0u64;
        let result: Result<u64, BlockError> = async {
            loop {
                let n = reader.read(&mut chunk[..]).await?;
                if n == 0 {
                    return Ok(copied);
                }
                self.buf.write_all(&chunk[..n]).await?;
                self.offset += n as u64;
                copied += n as u64;
            }
        }
        .await;
        self.copy_buf = Some(chunk);
        result
    }

    /// Append the named files of `dir` in order, returning the offset at
    /// which each of them starts.
    pub async fn read_from_files(
        &mut self,
        dir: &FsPath,
        names: &[&str],
    ) -> Result<Vec<u64>, BlockError> {
        let mut offsets = Vec::with_capacity(names.len());
        for name in names {
            offsets.push(self.offset);
            let mut file = tokio::fs::File::open(dir.join(name))
                .await
                .map_err(|err| BlockError::from(err).context(format!("opening {name}")))?;
            self.read_from(&mut file)
                .await
                .map_err(|err| err.context(format!("copying {name}")))?;
        }
        Ok(offsets)
    }

    /// Flush the remaining bytes and wait for the upload to complete.
    pub async fn close(mut self) -> Result<(), BlockError> {
        self.copy_buf = None;
        if let Err(err) = self.buf.shutdown().await {
            self.cancel.cancel();
            let waited = self.wait_upload().await;
            return Err(with_cleanup(err.into(), waited));
        }
        let result = self.wait_upload().await;
        self.cancel.cancel();
        if result.is_ok() {
            log_debug!(
                component = "writer",
                event = "upload_completed",
                path = %self.path,
                size = self.offset,
            );
        }
        result
    }

    /// Abort the upload; nothing is stored.
    pub async fn close_with_error(mut self, err: &BlockError) -> Result<(), BlockError> {
        self.copy_buf = None;
        self.cancel.cancel();
        log_warn!(
            component = "writer",
            event = "upload_aborted",
            path = %self.path,
            error = %err,
        );
        match self.wait_upload().await {
            Ok(()) | Err(BlockError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn wait_upload(&mut self) -> Result<(), BlockError> {
        match self.upload.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.upload.is_some() {
            self.cancel.cancel();
        }
    }
}

async fn upload(
    storage: Arc<dyn ObjectStore>,
    path: Path,
    mut rx: DuplexStream,
    cancel: CancellationToken,
) -> Result<(), BlockError> {
    let mut writer = UploadWriter::new(storage, path.clone());
    let copied = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BlockError::Cancelled),
        copied = tokio::io::copy(&mut rx, &mut writer) => copied.map_err(BlockError::from),
    };
    match copied {
        Ok(_) => {
            writer.shutdown().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(abort_err) = writer.abort().await {
                log_warn!(
                    component = "writer",
                    event = "upload_abort_failed",
                    path = %path,
                    error = %abort_err,
                );
            }
            Err(err)
        }
    }
}
