pub mod bench;
pub mod comm;
pub mod config;
pub mod error;
pub mod groupfile;
pub mod hierarchy;
pub mod partition;
pub mod report;
pub mod storage;
pub mod synth;
pub mod timing;
