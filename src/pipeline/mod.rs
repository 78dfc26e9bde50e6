pub mod builder;
pub mod checkpoint;
pub mod defaults;
pub mod runtime;
#[cfg(test)]
pub(crate) mod test_support;
pub mod traits;
