//! Ordered streams of profile rows.
//!
//! Every opened dataset yields its rows sorted by series labels, then
//! timestamp. [`merge_row_profiles`] combines the rows of many datasets into
//! one stream with the same ordering, dropping duplicates.

pub(crate) mod dedup;
pub(crate) mod merge;
pub(crate) mod rows;

use std::{cmp::Ordering, sync::Arc};

use futures_core::stream::BoxStream;

pub use self::{dedup::DedupStream, merge::MergeStream, rows::dataset_rows};
use crate::{error::BlockError, schema::ProfileRow, tsdb::Labels};

/// A profile row along with the series it belongs to.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    /// Position of the dataset the row was read from.
    pub source: usize,
    pub labels: Arc<Labels>,
    pub fingerprint: u64,
    pub row: ProfileRow,
}

impl ProfileEntry {
    pub fn timestamp(&self) -> i64 {
        self.row.time_nanos
    }

    /// Order by series labels, then timestamp.
    pub fn compare(&self, other: &Self) -> Ordering {
        let labels = if Arc::ptr_eq(&self.labels, &other.labels) {
            Ordering::Equal
        } else {
            self.labels.cmp(&other.labels)
        };
        labels.then(self.timestamp().cmp(&other.timestamp()))
    }
}

pub type ProfileStream = BoxStream<'static, Result<ProfileEntry, BlockError>>;

/// Merge per-dataset row streams into one ordered, deduplicated stream.
///
/// A single stream is returned as is.
pub fn merge_row_profiles(mut streams: Vec<ProfileStream>) -> ProfileStream {
    if streams.len() == 1 {
        if let Some(stream) = streams.pop() {
            return stream;
        }
    }
    Box::pin(DedupStream::new(MergeStream::new(streams)))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use futures_util::{stream, StreamExt};

    use super::{merge_row_profiles, ProfileEntry, ProfileStream};
    use crate::{schema::ProfileRow, tsdb::Labels};

    pub(crate) fn entry(source: usize, service: &str, ts: i64) -> ProfileEntry {
        let labels = Labels::new([("service", service)]);
        ProfileEntry {
            source,
            fingerprint: labels.fingerprint(),
            labels: Arc::new(labels),
            row: ProfileRow {
                time_nanos: ts,
                ..Default::default()
            },
        }
    }

    pub(crate) fn source(entries: Vec<ProfileEntry>) -> ProfileStream {
        Box::pin(stream::iter(entries.into_iter().map(Ok)))
    }

    fn keys(entries: &[ProfileEntry]) -> Vec<(String, i64, usize)> {
        entries
            .iter()
            .map(|e| {
                (
                    e.labels.get("service").unwrap_or_default().to_string(),
                    e.timestamp(),
                    e.source,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn single_source_is_not_deduplicated() {
        let merged = merge_row_profiles(vec![source(vec![entry(0, "a", 1), entry(0, "a", 1)])]);
        let out: Vec<_> = merged.map(Result::unwrap).collect().await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn merge_then_deduplicate() {
        let merged = merge_row_profiles(vec![
            source(vec![entry(0, "a", 1), entry(0, "b", 1), entry(0, "b", 3)]),
            source(vec![entry(1, "a", 1), entry(1, "a", 2), entry(1, "c", 0)]),
            source(vec![]),
        ]);
        let out: Vec<_> = merged.map(Result::unwrap).collect().await;
        assert_eq!(
            keys(&out),
            vec![
                ("a".to_string(), 1, 0),
                ("a".to_string(), 2, 1),
                ("b".to_string(), 1, 0),
                ("b".to_string(), 3, 0),
                ("c".to_string(), 0, 1),
            ]
        );
    }
}
