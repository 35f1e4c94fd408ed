use std::time::{SystemTime, UNIX_EPOCH};

use ulid::Ulid;
use xxhash_rust::xxh64::xxh64;

use crate::error::BlockError;

/// Identifier of a block object.
pub type BlockId = Ulid;

/// Monotonic ULID source seeded from the identifiers of the input blocks.
///
/// Compacting the same set of blocks twice yields the same sequence of
/// identifiers, whatever the order the blocks are listed in: the seed is a
/// hash of the sorted input ids and the timestamp is taken from the oldest
/// input.
pub struct UlidGenerator {
    timestamp: u64,
    rng: fastrand::Rng,
    previous: Option<Ulid>,
}

impl UlidGenerator {
    pub fn from_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Result<Self, BlockError> {
        let mut ids: Vec<&str> = ids.into_iter().collect();
        ids.sort_unstable();

        let Some(oldest) = ids.first() else {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            return Ok(Self {
                timestamp: now,
                rng: fastrand::Rng::new(),
                previous: None,
            });
        };
        let timestamp = Ulid::from_string(oldest)?.timestamp_ms();

        let mut buf = Vec::with_capacity(ids.iter().map(|id| id.len()).sum());
        for id in &ids {
            buf.extend_from_slice(id.as_bytes());
        }
        Ok(Self {
            timestamp,
            rng: fastrand::Rng::with_seed(xxh64(&buf, 0)),
            previous: None,
        })
    }

    pub fn ulid(&mut self) -> Ulid {
        let next = self
            .previous
            .and_then(|previous| previous.increment())
            .unwrap_or_else(|| Ulid::from_parts(self.timestamp, self.rng.u128(..)));
        self.previous = Some(next);
        next
    }
}
