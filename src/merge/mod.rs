//! Offline post-processing of persisted streams.
//!
//! - [`stream`]: aligns a session's multi-rate streams onto one time base and
//!   trims them to the motion window
//! - [`concat`]: appends part files of the same task or of the controller log

pub mod concat;
pub mod stream;

pub use concat::{
    collect_part_files, concat_parts, concat_task_groups, group_files_by_keyword, merge_controller_parts,
    merge_task_parts, part_sort_key, ConcatOptions, PartTable,
};
pub use stream::{
    interpolate, merge_stream_files, read_stream_csv, MergedDataset, PersistedStream, StreamMerger,
};
