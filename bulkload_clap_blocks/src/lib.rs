//! Building blocks for [`clap`]-driven configuration of the bulk-load dataflow.

pub mod dataflow;
