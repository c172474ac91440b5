//! Run records, Allan-deviation analysis and persistence.

pub mod allan;
pub mod run;
pub mod storage;
