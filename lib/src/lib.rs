pub mod convert;
pub mod error;
pub mod format;
pub mod util;
