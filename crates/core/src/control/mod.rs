//! Status and control operations: submit, query, cancel, resubmit, annotate.

mod service;
mod types;

pub use service::{
    validate_study_reference, JobControl, MAX_ANNOTATION_LEN, MAX_STUDY_REFERENCE_LEN,
};
pub use types::{ControlError, JobDetail, JobPage, SubmitRequest};
