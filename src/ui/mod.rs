pub mod icons;
pub mod report;

pub use report::{print_plan, print_summary};
