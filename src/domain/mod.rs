pub mod outcome;
pub mod records;
pub mod task;

pub use outcome::{CollectionOutcome, DiffReport, ErrorKind};
pub use records::{Fields, IdentitySummary, NormalizedRecord, RecordKey};
pub use task::{
    CollectionTask, ExecutionMode, SourceIdentity, TaskOptions, TaskParameters, TimeWindow,
};
