pub mod planner;

pub use planner::{PlanFragment, PlanNode, ScanRequest, plan_scan};
