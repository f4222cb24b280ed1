pub mod context;
pub mod dynamic_value;

pub use context::Context;
pub use dynamic_value::DynamicValue;
