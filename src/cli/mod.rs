//! CLI command handling

pub mod checkpoints;
pub mod output;
pub mod replay;
pub mod run;

pub use checkpoints::*;
pub use output::*;
pub use replay::*;
pub use run::*;
