//! Pipeline worker — task dispatch and execution for staged processing
//! pipelines.

pub mod alert;
pub mod config;
pub mod error;
pub mod filestore;
pub mod messaging;
pub mod module;
pub mod pipeline;
pub mod status;
pub mod store;
pub mod transaction;
pub mod worker;
