pub mod sse;

#[doc(hidden)]
pub mod test_support;
