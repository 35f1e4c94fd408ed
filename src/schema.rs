//! Arrow schema of the profile table and conversion between record batches
//! and [`ProfileRow`]s.

use std::sync::Arc;

use arrow::{
    array::{
        Array, ArrayRef, AsArray, Int64Array, ListArray, RecordBatch, StructArray, UInt32Array,
        UInt64Array,
    },
    buffer::OffsetBuffer,
    datatypes::{DataType, Field, FieldRef, Fields, Int64Type, Schema, SchemaRef, UInt32Type, UInt64Type},
};
use once_cell::sync::Lazy;

use crate::error::BlockError;

pub const SERIES_INDEX: &str = "series_index";
pub const TIME_NANOS: &str = "time_nanos";
pub const STACKTRACE_PARTITION: &str = "stacktrace_partition";
pub const SAMPLES: &str = "samples";
pub const STACKTRACE_ID: &str = "stacktrace_id";
pub const VALUE: &str = "value";

static SAMPLE_FIELDS: Lazy<Fields> = Lazy::new(|| {
    Fields::from(vec![
        Field::new(STACKTRACE_ID, DataType::UInt32, false),
        Field::new(VALUE, DataType::Int64, false),
    ])
});

static SAMPLE_ITEM: Lazy<FieldRef> = Lazy::new(|| {
    Arc::new(Field::new(
        "item",
        DataType::Struct(SAMPLE_FIELDS.clone()),
        false,
    ))
});

static SCHEMA: Lazy<SchemaRef> = Lazy::new(|| {
    Arc::new(Schema::new(vec![
        Field::new(SERIES_INDEX, DataType::UInt32, false),
        Field::new(TIME_NANOS, DataType::Int64, false),
        Field::new(STACKTRACE_PARTITION, DataType::UInt64, false),
        Field::new(SAMPLES, DataType::List(SAMPLE_ITEM.clone()), false),
    ]))
});

pub fn profile_schema() -> &'static SchemaRef {
    &SCHEMA
}

/// One row of the profile table.
///
/// Samples are kept as parallel columns so stack trace ids can be rewritten
/// in place.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileRow {
    pub series_index: u32,
    pub time_nanos: i64,
    pub stacktrace_partition: u64,
    pub stacktrace_ids: Vec<u32>,
    pub values: Vec<i64>,
}

impl ProfileRow {
    pub fn sample_count(&self) -> usize {
        self.stacktrace_ids.len()
    }
}

pub fn rows_to_batch(rows: &[ProfileRow]) -> Result<RecordBatch, BlockError> {
    let series = UInt32Array::from_iter_values(rows.iter().map(|r| r.series_index));
    let times = Int64Array::from_iter_values(rows.iter().map(|r| r.time_nanos));
    let partitions = UInt64Array::from_iter_values(rows.iter().map(|r| r.stacktrace_partition));

    let ids = UInt32Array::from_iter_values(rows.iter().flat_map(|r| r.stacktrace_ids.iter().copied()));
    let values = Int64Array::from_iter_values(rows.iter().flat_map(|r| r.values.iter().copied()));
    if ids.len() != values.len() {
        return Err(BlockError::corrupted("profile row samples are misaligned"));
    }
    let samples = StructArray::try_new(
        SAMPLE_FIELDS.clone(),
        vec![Arc::new(ids) as ArrayRef, Arc::new(values) as ArrayRef],
        None,
    )?;
    let offsets = OffsetBuffer::<i32>::from_lengths(rows.iter().map(|r| r.stacktrace_ids.len()));
    let samples = ListArray::try_new(SAMPLE_ITEM.clone(), offsets, Arc::new(samples), None)?;

    Ok(RecordBatch::try_new(
        SCHEMA.clone(),
        vec![
            Arc::new(series),
            Arc::new(times),
            Arc::new(partitions),
            Arc::new(samples),
        ],
    )?)
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef, BlockError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| BlockError::corrupted(format!("profile table has no {name} column")))
}

fn type_mismatch(name: &str) -> BlockError {
    BlockError::corrupted(format!("profile table column {name} has an unexpected type"))
}

pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<ProfileRow>, BlockError> {
    let series = column(batch, SERIES_INDEX)?
        .as_primitive_opt::<UInt32Type>()
        .ok_or_else(|| type_mismatch(SERIES_INDEX))?;
    let times = column(batch, TIME_NANOS)?
        .as_primitive_opt::<Int64Type>()
        .ok_or_else(|| type_mismatch(TIME_NANOS))?;
    let partitions = column(batch, STACKTRACE_PARTITION)?
        .as_primitive_opt::<UInt64Type>()
        .ok_or_else(|| type_mismatch(STACKTRACE_PARTITION))?;
    let samples = column(batch, SAMPLES)?
        .as_list_opt::<i32>()
        .ok_or_else(|| type_mismatch(SAMPLES))?;
    let sample_struct = samples
        .values()
        .as_struct_opt()
        .ok_or_else(|| type_mismatch(SAMPLES))?;
    let ids = sample_struct
        .column_by_name(STACKTRACE_ID)
        .and_then(|c| c.as_primitive_opt::<UInt32Type>())
        .ok_or_else(|| type_mismatch(STACKTRACE_ID))?;
    let values = sample_struct
        .column_by_name(VALUE)
        .and_then(|c| c.as_primitive_opt::<Int64Type>())
        .ok_or_else(|| type_mismatch(VALUE))?;

    let offsets = samples.value_offsets();
    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let start = offsets[i] as usize;
        let end = offsets[i + 1] as usize;
        rows.push(ProfileRow {
            series_index: series.value(i),
            time_nanos: times.value(i),
            stacktrace_partition: partitions.value(i),
            stacktrace_ids: ids.values()[start..end].to_vec(),
            values: values.values()[start..end].to_vec(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<ProfileRow> {
        vec![
            ProfileRow {
                series_index: 0,
                time_nanos: 10,
                stacktrace_partition: 1,
                stacktrace_ids: vec![0, 1],
                values: vec![5, 7],
            },
            ProfileRow {
                series_index: 1,
                time_nanos: 11,
                stacktrace_partition: 2,
                stacktrace_ids: vec![],
                values: vec![],
            },
            ProfileRow {
                series_index: 1,
                time_nanos: 12,
                stacktrace_partition: 2,
                stacktrace_ids: vec![3],
                values: vec![-1],
            },
        ]
    }

    #[test]
    fn batch_round_trip() {
        let rows = rows();
        let batch = rows_to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.schema(), *profile_schema());
        assert_eq!(batch_to_rows(&batch).unwrap(), rows);

        let sliced = batch.slice(1, 2);
        assert_eq!(batch_to_rows(&sliced).unwrap(), rows[1..]);
    }

    #[test]
    fn misaligned_samples() {
        let mut rows = rows();
        rows[0].values.pop();
        assert!(rows_to_batch(&rows).is_err());
    }
}
