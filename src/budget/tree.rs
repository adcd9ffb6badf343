//! Per-request budget arena.
//!
//! All budgets of one request live in a single `BudgetTree`. Parents are
//! referenced by index, so handles are cheap clones of `(tree, id)` and the
//! parent/child relation never forms a reference cycle.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::layer::{BudgetConfig, Layer};
use super::CURRENT_BUDGET;
use crate::error::{PalisadeError, Result};

#[derive(Debug)]
struct Node {
    layer: String,
    total: Duration,
    consumed: Duration,
    parent: Option<usize>,
    token: CancellationToken,
    started: Instant,
    /// Set while a `run` is in flight on this budget.
    deadline: Option<Instant>,
}

impl Node {
    /// What is left by accounting alone, ignoring in-flight runs.
    fn unspent(&self) -> Duration {
        self.total.saturating_sub(self.consumed)
    }
}

/// Time left for `id`: its unspent share, bounded by the deadline of any run
/// in flight on it or on an ancestor.
fn remaining_at(nodes: &[Node], id: usize, now: Instant) -> Duration {
    let mut remaining = nodes[id].unspent();
    let mut cursor = Some(id);
    while let Some(i) = cursor {
        let node = &nodes[i];
        if let Some(deadline) = node.deadline {
            remaining = remaining.min(deadline.saturating_duration_since(now));
        }
        cursor = node.parent;
    }
    remaining
}

#[derive(Debug)]
struct BudgetTree {
    nodes: Mutex<Vec<Node>>,
    config: BudgetConfig,
}

/// Handle to one budget of a request's budget tree.
#[derive(Clone)]
pub struct TimeoutBudget {
    tree: Arc<BudgetTree>,
    id: usize,
}

impl TimeoutBudget {
    /// Start a new tree with an `api` root of `total`.
    pub fn root(total: Duration) -> Self {
        Self::root_with(Layer::Api.as_str(), total, BudgetConfig::default())
    }

    /// Start a new tree whose children are derived with `config`.
    pub fn root_with(layer: impl Into<String>, total: Duration, config: BudgetConfig) -> Self {
        let layer = layer.into();
        debug!(layer = %layer, total_ms = total.as_millis() as u64, "Created root budget");
        let node = Node {
            layer,
            total,
            consumed: Duration::ZERO,
            parent: None,
            token: CancellationToken::new(),
            started: Instant::now(),
            deadline: None,
        };
        Self {
            tree: Arc::new(BudgetTree {
                nodes: Mutex::new(vec![node]),
                config,
            }),
            id: 0,
        }
    }

    /// A standalone budget for `layer` using its parentless default.
    pub fn for_layer(layer: Layer, config: BudgetConfig) -> Self {
        let total = config.share(layer).default;
        Self::root_with(layer.as_str(), total, config)
    }

    /// Derive the budget of `layer` from this budget's remaining time.
    pub fn child(&self, layer: Layer) -> Self {
        let remaining = self.remaining();
        let total = self.tree.config.share(layer).derive(remaining);
        self.child_with_total(layer.as_str(), total)
    }

    /// Derive a named child with an explicit total, capped at what remains here.
    pub fn child_with_total(&self, layer: impl Into<String>, total: Duration) -> Self {
        let layer = layer.into();
        let mut nodes = self.tree.nodes.lock();
        let total = total.min(remaining_at(&nodes, self.id, Instant::now()));
        let parent = &nodes[self.id];
        let token = parent.token.child_token();
        trace!(
            layer = %layer,
            parent = %parent.layer,
            total_ms = total.as_millis() as u64,
            "Derived child budget"
        );
        nodes.push(Node {
            layer,
            total,
            consumed: Duration::ZERO,
            parent: Some(self.id),
            token,
            started: Instant::now(),
            deadline: None,
        });
        Self {
            tree: Arc::clone(&self.tree),
            id: nodes.len() - 1,
        }
    }

    pub fn layer(&self) -> String {
        self.tree.nodes.lock()[self.id].layer.clone()
    }

    pub fn total(&self) -> Duration {
        self.tree.nodes.lock()[self.id].total
    }

    pub fn consumed(&self) -> Duration {
        self.tree.nodes.lock()[self.id].consumed
    }

    /// Time left, counting wall time of runs still in flight here or above.
    pub fn remaining(&self) -> Duration {
        remaining_at(&self.tree.nodes.lock(), self.id, Instant::now())
    }

    /// Wall time since this budget was created.
    pub fn elapsed(&self) -> Duration {
        self.tree.nodes.lock()[self.id].started.elapsed()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn parent(&self) -> Option<Self> {
        let parent = self.tree.nodes.lock()[self.id].parent?;
        Some(Self {
            tree: Arc::clone(&self.tree),
            id: parent,
        })
    }

    /// Children derived from this budget are cancelled along with it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.tree.nodes.lock()[self.id].token.clone()
    }

    /// Cancel this budget and every budget derived from it.
    pub fn cancel(&self) {
        let nodes = self.tree.nodes.lock();
        let node = &nodes[self.id];
        debug!(layer = %node.layer, "Budget cancelled");
        node.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.tree.nodes.lock()[self.id].token.is_cancelled()
    }

    /// Charge `amount` to this budget and its ancestors.
    ///
    /// Returns what is left here. Fails once nothing is left; ancestors are
    /// charged either way but never fail on behalf of a child.
    pub fn consume(&self, amount: Duration) -> Result<Duration> {
        let mut nodes = self.tree.nodes.lock();
        let mut cursor = Some(self.id);
        while let Some(id) = cursor {
            let node = &mut nodes[id];
            node.consumed = node.consumed.saturating_add(amount);
            cursor = node.parent;
        }

        let node = &nodes[self.id];
        if node.unspent().is_zero() {
            warn!(
                layer = %node.layer,
                total_ms = node.total.as_millis() as u64,
                consumed_ms = node.consumed.as_millis() as u64,
                "Budget exceeded"
            );
            return Err(PalisadeError::BudgetExceeded {
                layer: node.layer.clone(),
                total: node.total,
                elapsed: node.consumed,
            });
        }
        Ok(remaining_at(&nodes, self.id, Instant::now()))
    }

    /// Run `op` bounded by the remaining budget, with this budget ambient.
    ///
    /// On success the wall time spent is charged, minus whatever nested
    /// budgets already charged here while `op` ran.
    pub async fn run<F: Future>(&self, op: F) -> Result<F::Output> {
        self.run_with_fallback(op, None).await
    }

    /// Like [`run`](Self::run), answering with `fallback` instead of an error
    /// when the budget runs out or is cancelled.
    pub async fn run_with_fallback<F: Future>(
        &self,
        op: F,
        fallback: Option<F::Output>,
    ) -> Result<F::Output> {
        let remaining = self.remaining();
        let token = self.cancellation_token();
        if remaining.is_zero() || token.is_cancelled() {
            return self.fall_back(fallback, token.is_cancelled(), Duration::ZERO);
        }

        let charged_before = self.consumed();
        let started = Instant::now();
        let outer_deadline = self.set_deadline(Some(started + remaining));
        let scoped = CURRENT_BUDGET.scope(self.clone(), op);

        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(remaining, scoped) => Some(result),
        };
        let elapsed = started.elapsed();
        self.set_deadline(outer_deadline);

        match outcome {
            Some(Ok(value)) => {
                let charged_inside = self.consumed().saturating_sub(charged_before);
                // Ending exactly on the deadline still succeeded.
                let _ = self.consume(elapsed.saturating_sub(charged_inside));
                Ok(value)
            }
            Some(Err(_)) => {
                // Children still running under this budget must stop too.
                self.cancel();
                self.fall_back(fallback, false, elapsed)
            }
            None => self.fall_back(fallback, true, elapsed),
        }
    }

    /// Replace the in-flight deadline, returning the previous one.
    fn set_deadline(&self, deadline: Option<Instant>) -> Option<Instant> {
        std::mem::replace(&mut self.tree.nodes.lock()[self.id].deadline, deadline)
    }

    fn fall_back<T>(&self, fallback: Option<T>, cancelled: bool, elapsed: Duration) -> Result<T> {
        let exhausted = self.consume(elapsed).err();
        if let Some(value) = fallback {
            debug!(layer = %self.layer(), cancelled, "Budget ran out, using fallback");
            return Ok(value);
        }
        if cancelled {
            return Err(PalisadeError::BudgetCancelled { layer: self.layer() });
        }
        Err(exhausted.unwrap_or_else(|| {
            let nodes = self.tree.nodes.lock();
            let node = &nodes[self.id];
            PalisadeError::BudgetExceeded {
                layer: node.layer.clone(),
                total: node.total,
                elapsed: node.consumed,
            }
        }))
    }
}

impl fmt::Debug for TimeoutBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = self.tree.nodes.lock();
        let node = &nodes[self.id];
        f.debug_struct("TimeoutBudget")
            .field("layer", &node.layer)
            .field("total", &node.total)
            .field("remaining", &remaining_at(&nodes, self.id, Instant::now()))
            .field("parent", &node.parent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{child_budget, current_budget, with_budget};

    #[test]
    fn test_service_gets_ninety_percent_of_root() {
        let root = TimeoutBudget::root(Duration::from_secs(10));
        let service = root.child(Layer::Service);
        assert_eq!(service.total(), Duration::from_secs(9));
        assert_eq!(service.layer(), "service");
        assert_eq!(service.parent().unwrap().layer(), "api");
    }

    #[test]
    fn test_child_never_exceeds_parent_remaining() {
        let root = TimeoutBudget::root(Duration::from_secs(10));
        root.consume(Duration::from_secs(8)).unwrap();
        let child = root.child_with_total("custom", Duration::from_secs(5));
        assert_eq!(child.total(), Duration::from_secs(2));
    }

    #[test]
    fn test_consume_reports_layer_total_and_elapsed() {
        let root = TimeoutBudget::root(Duration::from_secs(10));
        let db = root.child(Layer::Database);
        assert_eq!(db.total(), Duration::from_secs(2));

        assert_eq!(db.consume(Duration::from_secs(1)).unwrap(), Duration::from_secs(1));
        match db.consume(Duration::from_millis(1_500)) {
            Err(PalisadeError::BudgetExceeded {
                layer,
                total,
                elapsed,
            }) => {
                assert_eq!(layer, "database");
                assert_eq!(total, Duration::from_secs(2));
                assert_eq!(elapsed, Duration::from_millis(2_500));
            }
            other => panic!("expected BudgetExceeded, got {:?}", other),
        }
        // The parent was charged but is not exhausted.
        assert_eq!(root.remaining(), Duration::from_millis(7_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_charges_elapsed_time_once() {
        let root = TimeoutBudget::root(Duration::from_secs(10));
        let service = root.child(Layer::Service);

        let value = root
            .run(async {
                service
                    .run(tokio::time::sleep(Duration::from_secs(2)))
                    .await
                    .unwrap();
                7
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(service.remaining(), Duration::from_secs(7));
        assert_eq!(root.remaining(), Duration::from_secs(8));

        // A sibling derived now sees the reduced allowance.
        assert_eq!(root.child(Layer::Service).total(), Duration::from_millis(7_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_children_derived_mid_run_see_elapsed_time() {
        let root = TimeoutBudget::root(Duration::from_secs(10));

        let (remaining, service, ambient) = root
            .run(async {
                tokio::time::sleep(Duration::from_secs(8)).await;
                let budget = current_budget().unwrap();
                (
                    budget.remaining(),
                    budget.child(Layer::Service).total(),
                    child_budget(Layer::Agent).total(),
                )
            })
            .await
            .unwrap();

        assert_eq!(remaining, Duration::from_secs(2));
        assert_eq!(service, Duration::from_millis(1_800));
        assert_eq!(ambient, Duration::from_millis(1_700));
        // Once the run is over, only charged time counts.
        assert_eq!(root.consumed(), Duration::from_secs(8));
        assert_eq!(root.remaining(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_remaining_bounded_by_running_parent() {
        let root = TimeoutBudget::root(Duration::from_secs(10));
        let agent = root.child(Layer::Agent);
        assert_eq!(agent.total(), Duration::from_millis(8_500));

        let left = root
            .run(async {
                tokio::time::sleep(Duration::from_secs(9)).await;
                agent.remaining()
            })
            .await
            .unwrap();
        assert_eq!(left, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_with_and_without_fallback() {
        let root = TimeoutBudget::root(Duration::from_secs(10));
        let external = root.child(Layer::ExternalApi);
        assert_eq!(external.total(), Duration::from_secs(4));

        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "late"
        };
        assert_eq!(
            external.run_with_fallback(slow, Some("cached")).await.unwrap(),
            "cached"
        );

        let other = root.child(Layer::Database);
        let err = other
            .run(tokio::time::sleep(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, PalisadeError::BudgetExceeded { ref layer, .. } if layer == "database"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_stops_child_run() {
        let root = TimeoutBudget::root(Duration::from_secs(30));
        let service = root.child(Layer::Service);

        let canceller = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = service
            .run(tokio::time::sleep(Duration::from_secs(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, PalisadeError::BudgetCancelled { .. }));
        assert!(service.is_cancelled());
    }

    #[tokio::test]
    async fn test_ambient_budget_propagation() {
        assert!(current_budget().is_none());
        assert_eq!(child_budget(Layer::Agent).total(), Duration::from_secs(25));

        let root = TimeoutBudget::root(Duration::from_secs(10));
        let total = with_budget(root.clone(), async { child_budget(Layer::Service).total() }).await;
        assert_eq!(total, Duration::from_secs(9));

        let layer = root
            .run(async { current_budget().map(|b| b.layer()) })
            .await
            .unwrap();
        assert_eq!(layer.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_does_not_run() {
        let root = TimeoutBudget::root(Duration::from_secs(1));
        let _ = root.consume(Duration::from_secs(1));
        let ran = std::sync::atomic::AtomicBool::new(false);

        let result = root
            .run(async { ran.store(true, std::sync::atomic::Ordering::SeqCst) })
            .await;
        assert!(result.is_err());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
