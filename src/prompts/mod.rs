pub mod compatibility;
pub mod divination;

pub use compatibility::build_compatibility_prompt;
pub use divination::build_divination_prompt;
