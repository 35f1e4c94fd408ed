use async_stream::try_stream;
use futures_util::StreamExt;
use parquet::arrow::ParquetRecordBatchStreamBuilder;

use super::{ProfileEntry, ProfileStream};
use crate::{dataset::Dataset, error::BlockError, schema::batch_to_rows};

const ROW_BATCH_SIZE: usize = 1024;

/// Stream the rows of an opened dataset, resolving each row's series in the
/// dataset's time index. `source` tags every entry with the dataset position.
pub fn dataset_rows(source: usize, dataset: &Dataset) -> Result<ProfileStream, BlockError> {
    let reader = dataset.profiles()?;
    let index = dataset.index()?;
    let name = dataset.name().to_string();

    Ok(Box::pin(try_stream! {
        let mut batches = ParquetRecordBatchStreamBuilder::new(reader)
            .await
            .map_err(BlockError::from)?
            .with_batch_size(ROW_BATCH_SIZE)
            .build()
            .map_err(BlockError::from)?;
        while let Some(batch) = batches.next().await {
            let batch = batch.map_err(BlockError::from)?;
            for row in batch_to_rows(&batch)? {
                let series = index.series(row.series_index).ok_or_else(|| {
                    BlockError::corrupted(format!(
                        "dataset {name}: row refers to unknown series {}",
                        row.series_index
                    ))
                })?;
                yield ProfileEntry {
                    source,
                    labels: series.labels.clone(),
                    fingerprint: series.fingerprint,
                    row,
                };
            }
        }
    }))
}
