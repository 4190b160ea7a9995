//! Subject data: segments, immutable snapshots, and the references holding them

mod reference;
mod segment;
mod subject_data;

pub use reference::{Change, ChangeListener, SubjectDataReference};
pub use segment::{Segment, DEFAULT_PERMISSION};
pub use subject_data::{ImmutableSubjectData, SegmentRecord};
