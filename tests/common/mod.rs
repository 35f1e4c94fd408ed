#![allow(dead_code)]

use std::{
    fmt,
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use object_store::{
    memory::InMemory, path::Path, GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta,
    ObjectStore, PutMultipartOpts, PutOptions, PutPayload, PutResult,
};
use profblock::{
    section::Section,
    stream::dataset_rows,
    tsdb::Labels,
    BlockBuilder, BlockMeta, Dataset, Object, ObjectOptions, RawProfile, RawSample,
};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// In-memory store counting the requests it serves.
#[derive(Debug)]
pub struct CountingStore {
    inner: InMemory,
    gets: AtomicUsize,
    range_gets: AtomicUsize,
    heads: AtomicUsize,
    puts: AtomicUsize,
    fail_reads: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calls {
    pub gets: usize,
    pub range_gets: usize,
    pub heads: usize,
    pub puts: usize,
}

impl Calls {
    pub fn total(&self) -> usize {
        self.gets + self.range_gets + self.heads + self.puts
    }

    pub fn since(&self, before: Calls) -> Calls {
        Calls {
            gets: self.gets - before.gets,
            range_gets: self.range_gets - before.range_gets,
            heads: self.heads - before.heads,
            puts: self.puts - before.puts,
        }
    }
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemory::new(),
            gets: AtomicUsize::new(0),
            range_gets: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Calls {
        Calls {
            gets: self.gets.load(Ordering::SeqCst),
            range_gets: self.range_gets.load(Ordering::SeqCst),
            heads: self.heads.load(Ordering::SeqCst),
            puts: self.puts.load(Ordering::SeqCst),
        }
    }

    /// Make every following read fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl fmt::Display for CountingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountingStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        let counter = if options.head {
            &self.heads
        } else if options.range.is_some() {
            &self.range_gets
        } else {
            &self.gets
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(object_store::Error::Generic {
                store: "counting",
                source: "injected read failure".into(),
            });
        }
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

pub fn labels(service: &str, pod: &str, profile_type: &str) -> Labels {
    Labels::new([
        ("service_name", service),
        ("pod", pod),
        ("__profile_type__", profile_type),
    ])
}

pub fn profile(tenant: &str, labels: Labels, ts: i64, stacks: &[(&[&str], i64)]) -> RawProfile {
    RawProfile {
        tenant: tenant.to_string(),
        dataset: labels.get("service_name").unwrap_or_default().to_string(),
        labels,
        time_nanos: ts,
        stacktrace_partition: 1,
        samples: stacks
            .iter()
            .map(|(frames, value)| RawSample {
                frames: frames.iter().map(|f| f.to_string()).collect(),
                value: *value,
            })
            .collect(),
    }
}

/// Build a block with a deterministic id taken from `id_time`.
pub async fn block(
    storage: Arc<dyn ObjectStore>,
    shard: u32,
    level: u32,
    id_time: u64,
    profiles: Vec<RawProfile>,
) -> BlockMeta {
    let mut builder = BlockBuilder::new(shard)
        .compaction_level(level)
        .id(Ulid::from_parts(id_time, id_time as u128));
    for profile in profiles {
        builder.add(profile);
    }
    builder.build(storage).await.unwrap()
}

/// A profile row as read back from a block, with resolved stack traces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub labels: Labels,
    pub time_nanos: i64,
    pub stacks: Vec<(Vec<String>, i64)>,
}

pub struct DatasetContents {
    pub rows: Vec<Row>,
    pub series: usize,
}

fn dataset_meta<'a>(meta: &'a BlockMeta, tenant: &str, name: &str) -> &'a profblock::DatasetMeta {
    meta.datasets
        .iter()
        .find(|ds| meta.string(ds.tenant) == tenant && meta.string(ds.name) == name)
        .unwrap_or_else(|| panic!("dataset {tenant}/{name} not found in block {}", meta.id))
}

/// Read every row of a dataset through the public section readers.
pub async fn read_dataset(
    storage: Arc<dyn ObjectStore>,
    meta: &BlockMeta,
    tenant: &str,
    name: &str,
) -> DatasetContents {
    let object = Arc::new(Object::new(storage, meta.clone(), ObjectOptions::default()));
    let dataset = Arc::new(Dataset::new(
        dataset_meta(meta, tenant, name).clone(),
        object,
    ));
    let cancel = CancellationToken::new();
    dataset
        .open(&cancel, &[Section::Profiles, Section::Tsdb, Section::Symbols])
        .await
        .unwrap();

    let symbols = dataset.symbols().unwrap();
    let series = dataset.index().unwrap().series_count();
    let entries: Vec<_> = dataset_rows(0, &dataset)
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    let rows = entries
        .into_iter()
        .map(|entry| {
            let partition = symbols.partition(entry.row.stacktrace_partition).unwrap();
            let stacks = entry
                .row
                .stacktrace_ids
                .iter()
                .zip(&entry.row.values)
                .map(|(&id, &value)| {
                    let frames = partition.stacktrace(id).unwrap();
                    (frames.into_iter().map(str::to_string).collect(), value)
                })
                .collect();
            Row {
                labels: (*entry.labels).clone(),
                time_nanos: entry.row.time_nanos,
                stacks,
            }
        })
        .collect();
    dataset.close().await.unwrap();
    DatasetContents { rows, series }
}

pub fn profile_types<'a>(meta: &'a BlockMeta, name: &str) -> Vec<&'a str> {
    let ds = meta
        .datasets
        .iter()
        .find(|ds| meta.string(ds.name) == name)
        .unwrap();
    ds.profile_types.iter().map(|&t| meta.string(t)).collect()
}

pub fn time_range(meta: &BlockMeta, name: &str) -> Range<i64> {
    let ds = meta
        .datasets
        .iter()
        .find(|ds| meta.string(ds.name) == name)
        .unwrap();
    ds.min_time..ds.max_time
}

pub fn is_empty_dir(dir: &std::path::Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

pub fn dataset_labels<'a>(meta: &'a BlockMeta, name: &str) -> Vec<Vec<(&'a str, &'a str)>> {
    let ds = meta
        .datasets
        .iter()
        .find(|ds| meta.string(ds.name) == name)
        .unwrap();
    meta.dataset_labels(ds).unwrap()
}
