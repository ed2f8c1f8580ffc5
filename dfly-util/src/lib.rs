pub mod digest;
pub mod fs;
pub mod id;
pub mod limit;
pub mod log;
pub mod sync;

#[doc(hidden)]
pub use ctor as __ctor;
