//! Hierarchical timeout budgets.
//!
//! A request starts with a root budget; each layer it passes through derives
//! a smaller child from whatever budget is ambient for the current task.
//! Cancelling a budget cancels everything derived from it.

mod layer;
mod tree;

use std::future::Future;

pub use layer::{BudgetConfig, Layer, LayerShare};
pub use tree::TimeoutBudget;

tokio::task_local! {
    pub(crate) static CURRENT_BUDGET: TimeoutBudget;
}

/// Run `f` with `budget` as the ambient budget.
pub async fn with_budget<F: Future>(budget: TimeoutBudget, f: F) -> F::Output {
    CURRENT_BUDGET.scope(budget, f).await
}

/// The ambient budget of the current task, if any.
pub fn current_budget() -> Option<TimeoutBudget> {
    CURRENT_BUDGET.try_with(TimeoutBudget::clone).ok()
}

/// Derive a budget for `layer` from the ambient budget, or use the layer's
/// default when there is none.
pub fn child_budget(layer: Layer) -> TimeoutBudget {
    match current_budget() {
        Some(parent) => parent.child(layer),
        None => TimeoutBudget::for_layer(layer, BudgetConfig::default()),
    }
}
