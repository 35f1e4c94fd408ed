//! Writing fresh segment blocks from raw profiles.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use object_store::ObjectStore;
use parquet::arrow::ArrowWriter;
use ulid::Ulid;

use crate::{
    bufferpool::MIN_BUFFER_SIZE,
    compaction::rewrite::{writer_properties, IndexRewriter},
    error::{with_cleanup, BlockError},
    fs::object_path,
    meta::{
        encode_with_trailer, encoded_len, BlockMeta, DatasetMeta, BLOCK_FORMAT_VERSION,
        DATASET_FORMAT_V1,
    },
    observability::log_debug,
    schema::{profile_schema, rows_to_batch, ProfileRow},
    stream::ProfileEntry,
    strings::{LabelBuilder, StringTable},
    symdb::SymDb,
    tsdb::Labels,
    writer::Writer,
};

/// Label holding the profile type of a profile.
pub const PROFILE_TYPE_LABEL: &str = "__profile_type__";
pub const SERVICE_NAME_LABEL: &str = "service_name";

/// One stack trace of a profile and the value observed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    /// Frame names, leaf first.
    pub frames: Vec<String>,
    pub value: i64,
}

/// A profile as received from a client.
#[derive(Debug, Clone)]
pub struct RawProfile {
    pub tenant: String,
    /// Dataset the profile belongs to, usually the service name.
    pub dataset: String,
    pub labels: Labels,
    pub time_nanos: i64,
    pub stacktrace_partition: u64,
    pub samples: Vec<RawSample>,
}

/// Builds a block out of raw profiles.
///
/// Profiles are grouped into datasets by tenant and dataset name, and sorted
/// by series labels, then time, the order compaction relies on.
#[derive(Debug)]
pub struct BlockBuilder {
    shard: u32,
    compaction_level: u32,
    id: Option<Ulid>,
    datasets: BTreeMap<(String, String), Vec<RawProfile>>,
}

impl BlockBuilder {
    /// A builder of a segment, a level 0 block, of `shard`.
    pub fn new(shard: u32) -> Self {
        Self {
            shard,
            compaction_level: 0,
            id: None,
            datasets: BTreeMap::new(),
        }
    }

    /// Use `id` instead of a fresh ULID.
    pub fn id(self, id: Ulid) -> Self {
        BlockBuilder {
            id: Some(id),
            ..self
        }
    }

    /// Build a block of another level. Blocks above level 0 hold a single
    /// tenant.
    pub fn compaction_level(self, compaction_level: u32) -> Self {
        BlockBuilder {
            compaction_level,
            ..self
        }
    }

    pub fn add(&mut self, profile: RawProfile) {
        self.datasets
            .entry((profile.tenant.clone(), profile.dataset.clone()))
            .or_default()
            .push(profile);
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Write the block to `storage` and return its metadata.
    pub async fn build(self, storage: Arc<dyn ObjectStore>) -> Result<BlockMeta, BlockError> {
        let mut strings = StringTable::new();
        let tenants: BTreeSet<&str> = self.datasets.keys().map(|(t, _)| t.as_str()).collect();
        let tenant = match (self.compaction_level, tenants.len()) {
            (0, _) => 0,
            (_, 1) => strings.put(tenants.first().copied().unwrap_or_default()),
            (level, n) => {
                return Err(BlockError::corrupted(format!(
                    "a level {level} block must hold exactly one tenant, got {n}"
                )))
            }
        };
        let mut meta = BlockMeta {
            format_version: BLOCK_FORMAT_VERSION,
            id: self.id.unwrap_or_else(Ulid::new).to_string(),
            tenant,
            shard: self.shard,
            compaction_level: self.compaction_level,
            ..Default::default()
        };
        meta.string_table = strings.strings().to_vec();
        let path = object_path(&meta);

        let mut writer = Writer::new(storage, path.clone());
        match write_block(&mut writer, &mut meta, &mut strings, self.datasets).await {
            Ok(()) => writer.close().await?,
            Err(err) => {
                let aborted = writer.close_with_error(&err).await;
                return Err(with_cleanup(err, aborted).context(format!("building block {path}")));
            }
        }
        log_debug!(
            component = "builder",
            event = "block_built",
            block = %meta.id,
            path = %path,
            datasets = meta.datasets.len(),
            size = meta.size,
        );
        Ok(meta)
    }
}

async fn write_block(
    writer: &mut Writer,
    meta: &mut BlockMeta,
    strings: &mut StringTable,
    datasets: BTreeMap<(String, String), Vec<RawProfile>>,
) -> Result<(), BlockError> {
    let mut min_time = i64::MAX;
    let mut max_time = i64::MIN;
    for ((tenant, name), profiles) in datasets {
        let mut dataset = DatasetMeta {
            format: DATASET_FORMAT_V1,
            tenant: strings.put(&tenant),
            name: strings.put(&name),
            ..Default::default()
        };
        let sections = encode_dataset(&name, profiles, &mut dataset, strings).await?;
        let start = writer.offset();
        for section in sections {
            dataset.table_of_contents.push(writer.offset());
            writer.write(&section).await?;
        }
        dataset.size = writer.offset() - start;
        min_time = min_time.min(dataset.min_time);
        max_time = max_time.max(dataset.max_time);
        meta.datasets.push(dataset);
    }
    if !meta.datasets.is_empty() {
        meta.min_time = min_time;
        meta.max_time = max_time;
    }

    meta.string_table = strings.strings().to_vec();
    meta.metadata_offset = writer.offset();
    meta.size = meta.metadata_offset + encoded_len(meta);
    let buf = encode_with_trailer(meta).await?;
    writer.write(&buf).await
}

/// Encode the sections of one dataset, in table of contents order.
async fn encode_dataset(
    name: &str,
    mut profiles: Vec<RawProfile>,
    meta: &mut DatasetMeta,
    strings: &mut StringTable,
) -> Result<[Vec<u8>; 3], BlockError> {
    profiles.sort_by(|a, b| {
        a.labels
            .cmp(&b.labels)
            .then(a.time_nanos.cmp(&b.time_nanos))
    });

    let mut symbols = SymDb::new();
    let mut index = IndexRewriter::default();
    let mut rows = Vec::with_capacity(profiles.len());
    let mut profile_types = BTreeSet::new();
    let mut previous: Option<Arc<Labels>> = None;
    meta.min_time = i64::MAX;
    meta.max_time = i64::MIN;

    for profile in profiles {
        meta.min_time = meta.min_time.min(profile.time_nanos);
        meta.max_time = meta.max_time.max(profile.time_nanos);
        if let Some(profile_type) = profile.labels.get(PROFILE_TYPE_LABEL) {
            profile_types.insert(profile_type.to_string());
        }

        let partition = symbols.partition_mut(profile.stacktrace_partition);
        let (stacktrace_ids, values): (Vec<u32>, Vec<i64>) = profile
            .samples
            .iter()
            .map(|s| (partition.add_stacktrace(s.frames.as_slice()), s.value))
            .unzip();

        let labels = match previous.take() {
            Some(labels) if *labels == profile.labels => labels,
            _ => Arc::new(profile.labels),
        };
        previous = Some(labels.clone());
        let mut entry = ProfileEntry {
            source: 0,
            fingerprint: labels.fingerprint(),
            labels,
            row: ProfileRow {
                series_index: 0,
                time_nanos: profile.time_nanos,
                stacktrace_partition: profile.stacktrace_partition,
                stacktrace_ids,
                values,
            },
        };
        index.rewrite_row(&mut entry);
        rows.push(entry.row);
    }
    meta.profile_types = profile_types.iter().map(|t| strings.put(t)).collect();
    let mut labels = LabelBuilder::new();
    for profile_type in &profile_types {
        labels.add([(SERVICE_NAME_LABEL, name), (PROFILE_TYPE_LABEL, profile_type.as_str())]);
    }
    meta.labels = labels.build(strings);

    let mut profiles_buf = Vec::new();
    let mut profiles_writer = ArrowWriter::try_new(
        &mut profiles_buf,
        profile_schema().clone(),
        Some(writer_properties(MIN_BUFFER_SIZE)),
    )?;
    for chunk in rows.chunks(1024) {
        profiles_writer.write(&rows_to_batch(chunk)?)?;
    }
    profiles_writer.close()?;

    Ok([profiles_buf, index.encode().await?, symbols.encode().await?])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use object_store::{memory::InMemory, ObjectStore};
    use ulid::Ulid;

    use super::{BlockBuilder, RawProfile, RawSample};
    use crate::{
        fs::object_path,
        meta::read_block_meta,
        tsdb::Labels,
    };

    fn profile(tenant: &str, service: &str, ts: i64) -> RawProfile {
        RawProfile {
            tenant: tenant.into(),
            dataset: service.into(),
            labels: Labels::new([
                ("service_name", service),
                ("__profile_type__", "cpu"),
            ]),
            time_nanos: ts,
            stacktrace_partition: 1,
            samples: vec![RawSample {
                frames: vec!["leaf".into(), "main".into()],
                value: ts,
            }],
        }
    }

    #[tokio::test]
    async fn build_segment() {
        let storage: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let id = Ulid::from_parts(1_700_000_000_000, 42);
        let mut builder = BlockBuilder::new(2).id(id);
        builder.add(profile("t-b", "api", 30));
        builder.add(profile("t-a", "web", 10));
        builder.add(profile("t-a", "api", 20));

        let meta = builder.build(storage.clone()).await.unwrap();
        assert_eq!(meta.id, id.to_string());
        assert_eq!(meta.compaction_level, 0);
        assert_eq!(meta.tenant_name(), "");
        assert_eq!((meta.min_time, meta.max_time), (10, 30));
        let datasets: Vec<_> = meta
            .datasets
            .iter()
            .map(|ds| (meta.string(ds.tenant), meta.string(ds.name)))
            .collect();
        assert_eq!(datasets, vec![("t-a", "api"), ("t-a", "web"), ("t-b", "api")]);
        for ds in &meta.datasets {
            assert_eq!(ds.table_of_contents.len(), 3);
            let types: Vec<_> = ds.profile_types.iter().map(|&t| meta.string(t)).collect();
            assert_eq!(types, vec!["cpu"]);
            assert_eq!(
                meta.dataset_labels(ds).unwrap(),
                vec![vec![
                    ("__profile_type__", "cpu"),
                    ("service_name", meta.string(ds.name)),
                ]]
            );
        }

        let path = object_path(&meta);
        assert!(path.as_ref().starts_with("segments/2/anonymous/"));
        let stored = read_block_meta(storage.as_ref(), &path).await.unwrap();
        assert_eq!(stored, meta);
    }

    #[tokio::test]
    async fn single_tenant_above_level_zero() {
        let storage: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut builder = BlockBuilder::new(1).compaction_level(2);
        builder.add(profile("t-a", "api", 1));
        builder.add(profile("t-b", "api", 1));
        assert!(builder.build(storage.clone()).await.is_err());

        let mut builder = BlockBuilder::new(1).compaction_level(2);
        builder.add(profile("t-a", "api", 1));
        let meta = builder.build(storage).await.unwrap();
        assert_eq!(meta.tenant_name(), "t-a");
        assert!(object_path(&meta).as_ref().starts_with("blocks/1/t-a/"));
    }
}
