//! Object layout in storage and readers over byte ranges of block objects.

pub mod reader;

use object_store::path::Path;

use crate::meta::BlockMeta;

pub const BLOCKS_DIR: &str = "blocks";
pub const SEGMENTS_DIR: &str = "segments";
/// Tenant directory of segments, which hold data of many tenants.
pub const ANONYMOUS_TENANT_DIR: &str = "anonymous";
pub const DATA_OBJECT_FILE: &str = "block.bin";

pub const PROFILES_FILE: &str = "profiles.parquet";
pub const INDEX_FILE: &str = "index.tsdb";
pub const SYMBOLS_FILE: &str = "symbols.symdb";

/// `<blocks|segments>/<shard>/<tenant|anonymous>/<id>/block.bin`
pub fn build_object_path(tenant: &str, shard: u32, compaction_level: u32, id: &str) -> Path {
    let (top, tenant) = if compaction_level == 0 {
        (SEGMENTS_DIR, ANONYMOUS_TENANT_DIR)
    } else {
        (BLOCKS_DIR, tenant)
    };
    Path::from(format!("{top}/{shard}/{tenant}/{id}/{DATA_OBJECT_FILE}"))
}

pub fn object_path(meta: &BlockMeta) -> Path {
    build_object_path(
        meta.tenant_name(),
        meta.shard,
        meta.compaction_level,
        &meta.id,
    )
}
