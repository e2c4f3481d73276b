//! Bulk storage: immutable files of finalized headers.

pub mod archive;
pub mod fetcher;
pub mod file;

pub use archive::{BulkArchive, BulkFile, BulkTip, LOCAL_MANIFEST_NAME};
pub use fetcher::{join_url, BulkFileFetcher, HttpFileFetcher};
pub use file::{
    file_content_hash, select_heaviest_branch, validate_file_data, BulkFileSource,
    BulkHeaderFileInfo, BulkHeaderFilesManifest,
};
