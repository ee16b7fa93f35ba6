pub mod classifier;
pub mod config;
pub mod error;
pub mod filter;
pub mod link;
pub mod lookup;
pub mod messages;
pub mod pipeline;
pub mod run;
pub mod runtime;
pub mod sequencer;
