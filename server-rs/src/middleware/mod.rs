pub mod internal;
pub mod rate_limit;
pub mod tenant;

pub use internal::*;
pub use rate_limit::*;
pub use tenant::*;
