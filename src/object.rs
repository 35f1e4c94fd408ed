//! Reference-counted handles to block objects in storage.

use std::{fmt, future::Future, io::SeekFrom, ops::Range, sync::Arc};

use async_lock::Mutex;
use bytes::Bytes;
use futures_util::StreamExt;
use object_store::{path::Path, ObjectStore};
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    bufferpool::PooledBuffer,
    error::BlockError,
    executor::TaskGroup,
    fs::object_path,
    meta::BlockMeta,
    observability::{log_debug, log_warn},
    option::ObjectOptions,
};

#[derive(Default)]
struct RefState {
    refs: usize,
    err: Option<Arc<BlockError>>,
}

/// Reference counter with one-shot initialization and release.
///
/// The first `inc` runs the initializer while holding the counter, so
/// concurrent callers wait for it and observe its outcome. A failed
/// initialization, or a release with an error, poisons the counter: every
/// later `inc` fails with the remembered error.
#[derive(Default)]
pub(crate) struct RefCounter {
    state: Mutex<RefState>,
}

impl RefCounter {
    pub(crate) async fn inc<F, Fut>(&self, init: F) -> Result<(), BlockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), BlockError>>,
    {
        let mut state = self.state.lock().await;
        if let Some(err) = &state.err {
            return Err(BlockError::Shared(err.clone()));
        }
        if state.refs == 0 {
            if let Err(err) = init().await {
                let err = Arc::new(err);
                state.err = Some(err.clone());
                return Err(BlockError::Shared(err));
            }
        }
        state.refs += 1;
        Ok(())
    }

    /// Drop one reference; `release` runs when the last one goes away.
    pub(crate) async fn dec<F, Fut>(
        &self,
        err: Option<Arc<BlockError>>,
        release: F,
    ) -> Result<(), BlockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), BlockError>>,
    {
        let mut state = self.state.lock().await;
        if let Some(err) = err {
            state.err.get_or_insert(err);
        }
        match state.refs {
            0 => Ok(()),
            1 => {
                state.refs = 0;
                release().await
            }
            _ => {
                state.refs -= 1;
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn refs(&self) -> usize {
        self.state.lock().await.refs
    }
}

enum ObjectData {
    Memory(PooledBuffer),
    Local(NamedTempFile),
    Remote,
}

impl ObjectData {
    fn mode(&self) -> &'static str {
        match self {
            ObjectData::Memory(_) => "memory",
            ObjectData::Local(_) => "download",
            ObjectData::Remote => "remote",
        }
    }
}

/// One block object in storage.
///
/// Depending on its size and [`ObjectOptions`], opening an object buffers it
/// in memory, downloads it to a local file, or does nothing and serves reads
/// by range from storage.
pub struct Object {
    storage: Arc<dyn ObjectStore>,
    path: Path,
    meta: BlockMeta,
    options: ObjectOptions,
    refs: RefCounter,
    data: RwLock<Option<Arc<ObjectData>>>,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("path", &self.path)
            .field("size", &self.meta.size)
            .finish()
    }
}

impl Object {
    pub fn new(storage: Arc<dyn ObjectStore>, meta: BlockMeta, options: ObjectOptions) -> Self {
        Self {
            storage,
            path: object_path(&meta),
            meta,
            options,
            refs: RefCounter::default(),
            data: RwLock::new(None),
        }
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn options(&self) -> &ObjectOptions {
        &self.options
    }

    /// Whether the whole object is held in memory.
    pub fn is_buffered(&self) -> bool {
        matches!(self.data.read().as_deref(), Some(ObjectData::Memory(_)))
    }

    pub async fn open(&self, cancel: &CancellationToken) -> Result<(), BlockError> {
        self.refs
            .inc(move || async move {
                let data = self
                    .load(cancel)
                    .await
                    .map_err(|err| err.context(format!("opening object {}", self.path)))?;
                log_debug!(
                    component = "object",
                    event = "object_loaded",
                    path = %self.path,
                    size = self.meta.size,
                    mode = data.mode(),
                );
                *self.data.write() = Some(Arc::new(data));
                Ok(())
            })
            .await
    }

    pub async fn close(&self) -> Result<(), BlockError> {
        self.close_with_error(None).await
    }

    /// Release a reference. With an error, the object is poisoned: later
    /// opens fail with it.
    pub async fn close_with_error(&self, err: Option<Arc<BlockError>>) -> Result<(), BlockError> {
        self.refs
            .dec(err, move || async move {
                let data = self.data.write().take();
                // Readers still holding the data drop it later.
                if let Some(Ok(ObjectData::Local(file))) = data.map(Arc::try_unwrap) {
                    file.close()?;
                }
                Ok(())
            })
            .await
    }

    async fn load(&self, cancel: &CancellationToken) -> Result<ObjectData, BlockError> {
        if cancel.is_cancelled() {
            return Err(BlockError::Cancelled);
        }
        let size = self.meta.size;
        if size < self.options.memory_threshold {
            let bytes = self.storage.get(&self.path).await?.bytes().await?;
            self.check_size(bytes.len() as u64)?;
            let mut buf = PooledBuffer::get(bytes.len());
            buf.extend_from_slice(&bytes);
            return Ok(ObjectData::Memory(buf));
        }
        let Some(dir) = &self.options.download_dir else {
            return Ok(ObjectData::Remote);
        };

        let tmp = NamedTempFile::new_in(dir)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);
        let mut stream = self.storage.get(&self.path).await?.into_stream();
        let mut downloaded = 0u64;
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(BlockError::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;
        self.check_size(downloaded)?;
        Ok(ObjectData::Local(tmp))
    }

    fn check_size(&self, size: u64) -> Result<(), BlockError> {
        if size != self.meta.size {
            return Err(BlockError::corrupted(format!(
                "object {} holds {size} bytes, its metadata declares {}",
                self.path, self.meta.size
            )));
        }
        Ok(())
    }

    /// Read a byte range of the object.
    pub async fn read_range(&self, range: Range<u64>) -> Result<Bytes, BlockError> {
        if range.start > range.end || range.end > self.meta.size {
            return Err(BlockError::corrupted(format!(
                "range {range:?} is outside of object {} of {} bytes",
                self.path, self.meta.size
            )));
        }
        let data = self.data.read().clone();
        match data.as_deref() {
            None => Err(BlockError::corrupted(format!(
                "object {} is not open",
                self.path
            ))),
            Some(ObjectData::Memory(buf)) => buf
                .get(range.start as usize..range.end as usize)
                .map(Bytes::copy_from_slice)
                .ok_or_else(|| {
                    BlockError::corrupted(format!(
                        "range {range:?} is outside of the {} bytes loaded from {}",
                        buf.len(),
                        self.path
                    ))
                }),
            Some(ObjectData::Local(file)) => {
                let mut file = tokio::fs::File::open(file.path()).await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; (range.end - range.start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            Some(ObjectData::Remote) => Ok(self
                .storage
                .get_range(&self.path, range.start as usize..range.end as usize)
                .await?),
        }
    }

    #[cfg(test)]
    pub(crate) async fn refs(&self) -> usize {
        self.refs.refs().await
    }
}

/// The source objects of a compaction.
pub struct Objects(Vec<Arc<Object>>);

impl Objects {
    pub fn new(objects: Vec<Arc<Object>>) -> Self {
        Objects(objects)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Object>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Open every object concurrently. On failure, objects that did open are
    /// closed again.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<(), BlockError> {
        let mut group = TaskGroup::new(cancel);
        for (i, object) in self.0.iter().enumerate() {
            let object = object.clone();
            let token = group.token();
            group.spawn(async move { object.open(&token).await.map(|_| i) });
        }
        let (opened, err) = group.join().await;
        let Some(err) = err else {
            return Ok(());
        };
        for i in opened {
            if let Err(close_err) = self.0[i].close().await {
                log_warn!(
                    component = "object",
                    event = "object_close_failed",
                    path = %self.0[i].path,
                    error = %close_err,
                );
            }
        }
        Err(err)
    }

    pub async fn close(&self, err: Option<Arc<BlockError>>) -> Result<(), BlockError> {
        let mut merr = crate::error::MultiError::new();
        for object in &self.0 {
            merr.add(object.close_with_error(err.clone()).await);
        }
        merr.into_result()
    }
}
