use std::{path::PathBuf, sync::Arc};

use object_store::ObjectStore;

use crate::compaction::SampleObserver;

/// Objects smaller than this are read into memory as a whole.
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 1 << 20;

/// How block objects are loaded when opened.
#[derive(Debug, Clone)]
pub struct ObjectOptions {
    pub(crate) memory_threshold: u64,
    pub(crate) download_dir: Option<PathBuf>,
}

impl Default for ObjectOptions {
    fn default() -> Self {
        ObjectOptions {
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            download_dir: None,
        }
    }
}

impl ObjectOptions {
    pub fn memory_threshold(self, memory_threshold: u64) -> Self {
        ObjectOptions {
            memory_threshold,
            ..self
        }
    }

    /// Download objects at or above the memory threshold into `dir` instead
    /// of reading them by range from storage.
    pub fn download_dir(self, dir: impl Into<PathBuf>) -> Self {
        ObjectOptions {
            download_dir: Some(dir.into()),
            ..self
        }
    }
}

#[derive(Clone)]
pub struct CompactionOptions {
    pub(crate) object_options: ObjectOptions,
    pub(crate) destination: Option<Arc<dyn ObjectStore>>,
    pub(crate) temp_dir: PathBuf,
    pub(crate) dataset_index: bool,
    pub(crate) sample_observer: Option<Arc<dyn SampleObserver>>,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        CompactionOptions {
            object_options: ObjectOptions::default(),
            destination: None,
            temp_dir: std::env::temp_dir(),
            dataset_index: true,
            sample_observer: None,
        }
    }
}

impl CompactionOptions {
    pub fn object_options(self, object_options: ObjectOptions) -> Self {
        CompactionOptions {
            object_options,
            ..self
        }
    }

    /// Store compacted blocks here rather than in the source storage.
    pub fn destination(self, destination: Arc<dyn ObjectStore>) -> Self {
        CompactionOptions {
            destination: Some(destination),
            ..self
        }
    }

    pub fn temp_dir(self, temp_dir: impl Into<PathBuf>) -> Self {
        CompactionOptions {
            temp_dir: temp_dir.into(),
            ..self
        }
    }

    /// Emit a per-tenant dataset index alongside the compacted datasets.
    /// On by default.
    pub fn dataset_index(self, dataset_index: bool) -> Self {
        CompactionOptions {
            dataset_index,
            ..self
        }
    }

    pub fn sample_observer(self, observer: Arc<dyn SampleObserver>) -> Self {
        CompactionOptions {
            sample_observer: Some(observer),
            ..self
        }
    }
}

impl std::fmt::Debug for CompactionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionOptions")
            .field("object_options", &self.object_options)
            .field(
                "destination",
                &self.destination.as_ref().map(|store| store.to_string()),
            )
            .field("temp_dir", &self.temp_dir)
            .field("dataset_index", &self.dataset_index)
            .field("sample_observer", &self.sample_observer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use object_store::memory::InMemory;

    use super::{CompactionOptions, ObjectOptions, DEFAULT_MEMORY_THRESHOLD};
    use crate::{compaction::SampleObserver, stream::ProfileEntry};

    struct Noop;

    impl SampleObserver for Noop {
        fn observe(&self, _: &str, _: &ProfileEntry) {}
    }

    #[test]
    fn builders() {
        let options = CompactionOptions::default();
        assert_eq!(options.object_options.memory_threshold, DEFAULT_MEMORY_THRESHOLD);
        assert!(options.destination.is_none());
        assert!(options.dataset_index);
        assert!(options.sample_observer.is_none());

        let options = options
            .object_options(ObjectOptions::default().memory_threshold(10).download_dir("/tmp/x"))
            .destination(Arc::new(InMemory::new()))
            .temp_dir("/tmp/work")
            .dataset_index(false)
            .sample_observer(Arc::new(Noop));
        assert_eq!(options.object_options.memory_threshold, 10);
        assert_eq!(
            options.object_options.download_dir.as_deref(),
            Some(std::path::Path::new("/tmp/x"))
        );
        assert!(options.destination.is_some());
        assert!(!options.dataset_index);
        assert!(options.sample_observer.is_some());
        assert!(format!("{options:?}").contains("InMemory"));
    }
}
