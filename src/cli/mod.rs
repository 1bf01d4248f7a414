pub mod types;
mod attribute;
mod sweep;

pub use types::{AttributeArgs, Cli, Command, SweepArgs, TokenizerSpec};
pub use attribute::cmd_attribute;
pub use sweep::cmd_sweep;
