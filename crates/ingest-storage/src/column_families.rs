//! Column family definitions for RocksDB.
//!
//! The metadata store is a flat ordered key space, so a single column
//! family holds everything. Keys are `/`-separated paths (see [`crate::keys`]).

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for all metadata keys
pub const CF_MAINDB: &str = "maindb";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_MAINDB];

fn maindb_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![ColumnFamilyDescriptor::new(CF_MAINDB, maindb_options())]
}
