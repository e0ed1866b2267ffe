pub mod calls;
pub mod config;
pub mod relay;
pub mod transport;

#[doc(hidden)]
pub mod test_utils;
