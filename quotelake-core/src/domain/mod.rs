//! Domain types shared by every pipeline stage.

pub mod observation;
pub mod row;

pub use observation::RawObservation;
pub use row::FlattenedRow;
