pub mod plan;
pub mod subscription;
pub mod usage;
pub mod wallet;
pub mod webhook;

pub use plan::*;
pub use subscription::*;
pub use usage::*;
pub use wallet::*;
pub use webhook::*;
