//! Plan definitions: TOML parsing and goal decomposition.

pub mod generate;
pub mod parser;
pub mod toml_format;

pub use generate::{build_decomposition_prompt, decompose_goal};
pub use parser::{PlanParseError, parse_plan_toml};
pub use toml_format::{PlanMeta, PlanToml, TaskToml};
