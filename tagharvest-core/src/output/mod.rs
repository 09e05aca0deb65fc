//! Result rows and where they are written.

pub mod record;
pub mod writer;

pub use record::{
    RESULT_HEADER, ResultRecord, UNRESOLVED_HEADER, UnresolvedRecord, format_timestamp,
    format_value,
};
pub use writer::{
    CsvOutput, CsvResultFiles, MemoryResultSink, ResultSink, ResultSinkFactory,
    stamped_file_name,
};
