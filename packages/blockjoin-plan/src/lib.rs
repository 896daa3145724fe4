//! Semi-join flattening and cost-based join-order planning.
//!
//! Rewrites qualifying `IN (subquery)` predicates into semi-join nests,
//! enumerates join orders while tracking the four duplicate-removal
//! strategies, and translates the chosen plan into an executor.

pub mod bitmap;
pub mod config;
pub mod cost;
pub mod error;
pub mod expr;
pub mod flatten;
pub mod planner;
pub mod query;
pub mod setup;

pub use config::{OptimizerSwitch, PlannerConfig};
pub use error::PlanError;

use blockjoin_core::exec::Join;
use blockjoin_core::ExecConfig;

use cost::CostModel;
use planner::Plan;
use query::{Catalog, QueryBlock};

/// Full optimization pipeline: flatten subqueries, choose a join order,
/// build the executor.
pub fn optimize(
    query: &mut QueryBlock,
    catalog: &Catalog,
    cfg: &PlannerConfig,
    cost: &CostModel,
    exec_cfg: ExecConfig,
) -> Result<(Plan, Join), PlanError> {
    flatten::convert_join_subqueries_to_semijoins(query, catalog, cfg)?;
    // Subqueries this engine cannot flatten have no execution method.
    let mut predicates: Vec<&expr::Expr> = Vec::new();
    if let Some(w) = &query.where_clause {
        predicates.extend(w.conjuncts());
    }
    for node in &query.nodes {
        if let Some(on) = &node.on_expr {
            predicates.extend(on.conjuncts());
        }
    }
    if predicates
        .iter()
        .any(|p| matches!(p, expr::Expr::InSubquery { .. }))
    {
        return Err(PlanError::UnsupportedSubquery);
    }
    let plan = planner::choose_plan(query, catalog, cfg, cost)?;
    let join = setup::build_join(query, catalog, &plan, cfg, exec_cfg)?;
    Ok((plan, join))
}
