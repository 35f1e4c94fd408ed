use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use object_store::{path::Path, ObjectStore};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use super::{
    dataset::DatasetCompaction,
    rewrite::DatasetIndexWriter,
    CompactionStats,
};
use crate::{
    dataset::Dataset,
    error::{with_cleanup, BlockError},
    fs::build_object_path,
    id::UlidGenerator,
    meta::{
        encode_with_trailer, encoded_len, BlockMeta, DatasetMeta, BLOCK_FORMAT_VERSION,
        DATASET_FORMAT_V1, LABEL_NAME_TENANT_DATASET, LABEL_VALUE_DATASET_TSDB_INDEX,
    },
    object::{Object, Objects},
    observability::{log_debug, log_info},
    option::CompactionOptions,
    strings::{LabelBuilder, StringTable},
    writer::Writer,
};

/// Source datasets of one output dataset.
struct DatasetGroup {
    datasets: Vec<Arc<Dataset>>,
    min_time: i64,
    max_time: i64,
    profile_types: BTreeSet<String>,
    labels: LabelBuilder,
}

impl DatasetGroup {
    fn new() -> Self {
        Self {
            datasets: Vec::new(),
            min_time: i64::MAX,
            max_time: i64::MIN,
            profile_types: BTreeSet::new(),
            labels: LabelBuilder::new(),
        }
    }

    fn append(&mut self, object: &Arc<Object>, meta: &DatasetMeta) -> Result<(), BlockError> {
        let block = object.meta();
        self.labels.put(&meta.labels, &block.string_table)?;
        self.min_time = self.min_time.min(meta.min_time);
        self.max_time = self.max_time.max(meta.max_time);
        self.profile_types.extend(
            meta.profile_types
                .iter()
                .map(|&t| block.string(t).to_string()),
        );
        self.datasets
            .push(Arc::new(Dataset::new(meta.clone(), object.clone())));
        Ok(())
    }
}

/// Group the datasets of `objects` into one plan per tenant.
///
/// Planning does no I/O and is deterministic: the same set of objects, in
/// any order, yields the same plans with the same block ids. Plans are
/// ordered by tenant, datasets within a plan by name. Anonymous datasets
/// are skipped; they are rebuilt from the compacted contents.
pub fn plan_compaction(objects: &Objects) -> Result<Vec<CompactionPlan>, BlockError> {
    let first = objects.iter().next().ok_or(BlockError::NoBlocksToMerge)?;
    let shard = first.meta().shard;
    let mut level = 0;
    for object in objects.iter() {
        if object.meta().shard != shard {
            return Err(BlockError::ShardMergeMismatch);
        }
        level = level.max(object.meta().compaction_level);
    }
    let level = level + 1;
    let mut generator = UlidGenerator::from_ids(objects.iter().map(|o| o.meta().id.as_str()))?;

    let mut sorted: Vec<&Arc<Object>> = objects.iter().collect();
    sorted.sort_by(|a, b| a.meta().id.cmp(&b.meta().id));

    let mut tenants: BTreeMap<String, BTreeMap<String, DatasetGroup>> = BTreeMap::new();
    for object in sorted {
        let meta = object.meta();
        for ds in &meta.datasets {
            let name = meta.string(ds.name);
            if name.is_empty() {
                continue;
            }
            tenants
                .entry(meta.string(ds.tenant).to_string())
                .or_default()
                .entry(name.to_string())
                .or_insert_with(DatasetGroup::new)
                .append(object, ds)
                .map_err(|err| err.context(format!("block {}: dataset {name}", meta.id)))?;
        }
    }

    let plans: Vec<CompactionPlan> = tenants
        .into_iter()
        .map(|(tenant, groups)| CompactionPlan::new(generator.ulid(), tenant, shard, level, groups))
        .collect();
    for plan in &plans {
        log_debug!(
            component = "compaction",
            event = "plan_built",
            tenant = %plan.tenant,
            block = %plan.meta.id,
            level = level,
            datasets = plan.datasets.len(),
            sources = plan.source_count(),
        );
    }
    Ok(plans)
}

/// The output block of one tenant.
pub struct CompactionPlan {
    tenant: String,
    path: Path,
    meta: BlockMeta,
    strings: StringTable,
    datasets: Vec<DatasetCompaction>,
    stats: CompactionStats,
}

impl CompactionPlan {
    fn new(
        id: Ulid,
        tenant: String,
        shard: u32,
        level: u32,
        groups: BTreeMap<String, DatasetGroup>,
    ) -> Self {
        let id = id.to_string();
        let mut strings = StringTable::new();
        let mut meta = BlockMeta {
            format_version: BLOCK_FORMAT_VERSION,
            tenant: strings.put(&tenant),
            shard,
            compaction_level: level,
            min_time: i64::MAX,
            max_time: i64::MIN,
            ..Default::default()
        };
        let mut datasets = Vec::with_capacity(groups.len());
        for (name, group) in groups {
            meta.min_time = meta.min_time.min(group.min_time);
            meta.max_time = meta.max_time.max(group.max_time);
            let dataset = DatasetMeta {
                format: DATASET_FORMAT_V1,
                tenant: meta.tenant,
                name: strings.put(&name),
                min_time: group.min_time,
                max_time: group.max_time,
                profile_types: group.profile_types.iter().map(|t| strings.put(t)).collect(),
                labels: group.labels.build(&mut strings),
                ..Default::default()
            };
            datasets.push(DatasetCompaction::new(name, dataset, group.datasets));
        }
        let path = build_object_path(&tenant, shard, level, &id);
        meta.id = id;
        Self {
            tenant,
            path,
            meta,
            strings,
            datasets,
            stats: CompactionStats::default(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Where the block is uploaded.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata of the output block. Datasets, offsets and size are only
    /// known after [`CompactionPlan::compact`].
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn dataset_names(&self) -> impl Iterator<Item = &str> {
        self.datasets.iter().map(DatasetCompaction::name)
    }

    /// Number of input datasets merged into this block.
    pub fn source_count(&self) -> usize {
        self.datasets.iter().map(|ds| ds.datasets().len()).sum()
    }

    /// Totals of the last compaction.
    pub fn stats(&self) -> CompactionStats {
        self.stats
    }

    /// Compact the datasets in order and upload the block to `destination`.
    ///
    /// The objects holding the source datasets must be open. Nothing is
    /// stored if any stage fails.
    pub async fn compact(
        &mut self,
        cancel: &CancellationToken,
        destination: Arc<dyn ObjectStore>,
        options: &CompactionOptions,
    ) -> Result<BlockMeta, BlockError> {
        self.meta.datasets.clear();
        self.stats = CompactionStats::default();

        let mut writer = Writer::new(destination, self.path.clone());
        if let Err(err) = self.write_block(cancel, &mut writer, options).await {
            let aborted = writer.close_with_error(&err).await;
            return Err(with_cleanup(err, aborted).context(format!("compacting block {}", self.path)));
        }
        writer
            .close()
            .await
            .map_err(|err| err.context(format!("uploading block {}", self.path)))?;

        for ds in &self.datasets {
            self.stats += ds.stats();
        }
        log_info!(
            component = "compaction",
            event = "block_compacted",
            tenant = %self.tenant,
            block = %self.meta.id,
            level = self.meta.compaction_level,
            datasets = self.datasets.len(),
            size = self.meta.size,
            series = self.stats.series,
            profiles = self.stats.profiles,
            samples = self.stats.samples,
        );
        Ok(self.meta.clone())
    }

    async fn write_block(
        &mut self,
        cancel: &CancellationToken,
        writer: &mut Writer,
        options: &CompactionOptions,
    ) -> Result<(), BlockError> {
        let mut dataset_index = options.dataset_index.then(DatasetIndexWriter::default);
        for (i, ds) in self.datasets.iter_mut().enumerate() {
            if let Some(index) = dataset_index.as_mut() {
                index.set_dataset(i as u32);
            }
            ds.compact(cancel, writer, options, i, dataset_index.as_mut())
                .await
                .map_err(|err| err.context(format!("compacting dataset {}", ds.name())))?;
            self.meta.datasets.push(ds.meta().clone());
        }
        if let Some(index) = dataset_index {
            self.write_dataset_index(writer, index)
                .await
                .map_err(|err| err.context("writing tenant dataset index"))?;
        }

        self.meta.string_table = self.strings.strings().to_vec();
        self.meta.metadata_offset = writer.offset();
        self.meta.size = self.meta.metadata_offset + encoded_len(&self.meta);
        let buf = encode_with_trailer(&self.meta).await?;
        writer.write(&buf).await
    }

    async fn write_dataset_index(
        &mut self,
        writer: &mut Writer,
        index: DatasetIndexWriter,
    ) -> Result<(), BlockError> {
        let buf = index.finish().await?;
        let labels = LabelBuilder::new()
            .add([(LABEL_NAME_TENANT_DATASET, LABEL_VALUE_DATASET_TSDB_INDEX)])
            .build(&mut self.strings);
        let offset = writer.offset();
        writer.write(&buf).await?;
        self.meta.datasets.push(DatasetMeta {
            format: DATASET_FORMAT_V1,
            tenant: self.meta.tenant,
            name: 0,
            min_time: self.meta.min_time,
            max_time: self.meta.max_time,
            table_of_contents: vec![offset],
            size: buf.len() as u64,
            profile_types: Vec::new(),
            labels,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use object_store::memory::InMemory;
    use ulid::Ulid;

    use super::plan_compaction;
    use crate::{
        error::BlockError,
        meta::{BlockMeta, DatasetMeta},
        object::{Object, Objects},
        option::ObjectOptions,
        strings::{label_sets, LabelBuilder, StringTable},
    };

    struct Ds<'a> {
        tenant: &'a str,
        name: &'a str,
        time: (i64, i64),
        profile_types: &'a [&'a str],
    }

    fn block(ts: u64, shard: u32, level: u32, datasets: &[Ds<'_>]) -> BlockMeta {
        let mut strings = StringTable::new();
        let datasets = datasets
            .iter()
            .map(|ds| {
                let mut labels = LabelBuilder::new();
                for t in ds.profile_types {
                    labels.add([("service_name", ds.name), ("__profile_type__", *t)]);
                }
                DatasetMeta {
                    format: 1,
                    tenant: strings.put(ds.tenant),
                    name: strings.put(ds.name),
                    min_time: ds.time.0,
                    max_time: ds.time.1,
                    table_of_contents: vec![0, 10, 20],
                    size: 30,
                    profile_types: ds.profile_types.iter().map(|t| strings.put(t)).collect(),
                    labels: labels.build(&mut strings),
                }
            })
            .collect();
        BlockMeta {
            format_version: 1,
            id: Ulid::from_parts(ts, ts as u128).to_string(),
            shard,
            compaction_level: level,
            size: 100,
            datasets,
            string_table: strings.into_strings(),
            ..Default::default()
        }
    }

    fn objects(blocks: Vec<BlockMeta>) -> Objects {
        let storage = Arc::new(InMemory::new());
        Objects::new(
            blocks
                .into_iter()
                .map(|meta| Arc::new(Object::new(storage.clone(), meta, ObjectOptions::default())))
                .collect(),
        )
    }

    fn inputs() -> Vec<BlockMeta> {
        vec![
            block(
                1_000,
                3,
                0,
                &[
                    Ds { tenant: "t-b", name: "svc-2", time: (10, 20), profile_types: &["cpu"] },
                    Ds { tenant: "t-a", name: "svc-1", time: (5, 8), profile_types: &["mem", "cpu"] },
                    Ds { tenant: "t-a", name: "", time: (5, 8), profile_types: &[] },
                ],
            ),
            block(
                2_000,
                3,
                2,
                &[
                    Ds { tenant: "t-b", name: "svc-1", time: (1, 2), profile_types: &["cpu"] },
                    Ds { tenant: "t-b", name: "svc-2", time: (15, 40), profile_types: &["alloc"] },
                ],
            ),
        ]
    }

    #[test]
    fn empty_input() {
        assert!(matches!(
            plan_compaction(&objects(vec![])),
            Err(BlockError::NoBlocksToMerge)
        ));
    }

    #[test]
    fn shard_mismatch() {
        let mut blocks = inputs();
        blocks[1].shard = 4;
        assert!(matches!(
            plan_compaction(&objects(blocks)),
            Err(BlockError::ShardMergeMismatch)
        ));
    }

    #[test]
    fn plans_by_tenant_and_dataset() {
        let plans = plan_compaction(&objects(inputs())).unwrap();
        let tenants: Vec<_> = plans.iter().map(|p| p.tenant()).collect();
        assert_eq!(tenants, vec!["t-a", "t-b"]);

        let a = &plans[0];
        assert_eq!(a.dataset_names().collect::<Vec<_>>(), vec!["svc-1"]);
        assert_eq!(a.source_count(), 1);
        assert_eq!(a.meta().compaction_level, 3);
        assert_eq!((a.meta().min_time, a.meta().max_time), (5, 8));
        assert_eq!(a.path().as_ref(), format!("blocks/3/t-a/{}/block.bin", a.id()));

        let b = &plans[1];
        assert_eq!(b.dataset_names().collect::<Vec<_>>(), vec!["svc-1", "svc-2"]);
        assert_eq!(b.source_count(), 3);
        assert_eq!((b.meta().min_time, b.meta().max_time), (1, 40));

        let svc2 = b.datasets[1].meta();
        assert_eq!((svc2.min_time, svc2.max_time), (10, 40));
        let types: Vec<_> = svc2
            .profile_types
            .iter()
            .map(|&t| b.strings.lookup(t).unwrap())
            .collect();
        assert_eq!(types, vec!["alloc", "cpu"]);
        assert_eq!(
            label_sets(&svc2.labels, b.strings.strings()).unwrap(),
            vec![
                vec![("__profile_type__", "alloc"), ("service_name", "svc-2")],
                vec![("__profile_type__", "cpu"), ("service_name", "svc-2")],
            ]
        );
    }

    #[test]
    fn ids_do_not_depend_on_input_order() {
        let plans = plan_compaction(&objects(inputs())).unwrap();
        let mut reversed = inputs();
        reversed.reverse();
        let again = plan_compaction(&objects(reversed)).unwrap();

        let ids: Vec<_> = plans.iter().map(|p| p.id().to_string()).collect();
        let ids_again: Vec<_> = again.iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, ids_again);
        assert_ne!(ids[0], ids[1]);
        for (x, y) in plans.iter().zip(&again) {
            assert_eq!(x.strings.strings(), y.strings.strings());
        }
        // The timestamp comes from the oldest input.
        let id = Ulid::from_string(&ids[0]).unwrap();
        assert_eq!(id.timestamp_ms(), 1_000);
    }
}
