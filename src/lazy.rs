//! Memoized lazy evaluation graph with fork/join-parallel demand.
//!
//! A node is a compute-once cell plus an evaluator and the list of upstream
//! nodes it combines. `get` evaluates depth-first on the calling thread;
//! `fork_join` submits unset dependencies to a work-stealing pool and
//! combines once they land. The compute-once cell resolves the set-once
//! race: concurrent callers agree on exactly one evaluation, including on
//! diamond-shaped graphs where one node feeds several downstream consumers.
//! Reads after the value is set take no lock.
//!
//! Failures are not memoized: an evaluator error leaves the node unset and
//! a later demand re-attempts. Whether to retry is the caller's decision.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::exec::ForkJoin;

type Eval<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// A value computed at most once, with declared upstream dependencies.
pub struct Lazy<T> {
    cell: OnceCell<T>,
    deps: Vec<Arc<dyn Dependency>>,
    eval: Eval<T>,
}

/// Type-erased upstream node: enough to skip it when already set and to
/// force it on a pool when not.
trait Dependency: Send + Sync {
    fn is_set(&self) -> bool;
    fn force(&self, pool: &ForkJoin) -> Result<()>;
}

impl<T: Send + Sync + 'static> Dependency for Lazy<T> {
    fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }

    fn force(&self, pool: &ForkJoin) -> Result<()> {
        self.fork_join(pool).map(|_| ())
    }
}

impl<T: Send + Sync + 'static> Lazy<T> {
    /// Leaf node evaluated by `f` on first demand.
    pub fn new(f: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
        Self::try_new(move || Ok(f()))
    }

    /// Leaf node with a fallible evaluator. An `Err` leaves the node unset.
    pub fn try_new(f: impl Fn() -> Result<T> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            cell: OnceCell::new(),
            deps: Vec::new(),
            eval: Box::new(f),
        })
    }

    /// Node pre-set to `value`; never evaluates anything.
    pub fn of(value: T) -> Arc<Self> {
        let cell = OnceCell::new();
        let _ = cell.set(value);
        Arc::new(Self {
            cell,
            deps: Vec::new(),
            eval: Box::new(|| Err(Error::Unset)),
        })
    }

    /// Placeholder that fails every demand until replaced.
    pub fn unset() -> Arc<Self> {
        Self::try_new(|| Err(Error::Unset))
    }

    /// First demand runs the evaluator, recursively demanding dependencies
    /// on this thread; later demands return the cached value lock-free.
    pub fn get(&self) -> Result<&T> {
        self.cell.get_or_try_init(|| (self.eval)())
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn if_set(&self, f: impl FnOnce(&T)) {
        if let Some(value) = self.cell.get() {
            f(value);
        }
    }

    /// Demand this node, evaluating unset dependencies in parallel on the
    /// work-stealing pool. Already-set dependencies are not resubmitted.
    /// Concurrent calls on a shared node evaluate it exactly once.
    pub fn fork_join(&self, pool: &ForkJoin) -> Result<&T> {
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }
        let pending: Vec<&Arc<dyn Dependency>> =
            self.deps.iter().filter(|dep| !dep.is_set()).collect();
        match pending.len() {
            0 => {}
            1 => pending[0].force(pool)?,
            _ => {
                let failure: Mutex<Option<Error>> = Mutex::new(None);
                pool.pool().in_place_scope(|scope| {
                    for dep in pending {
                        let failure = &failure;
                        scope.spawn(move |_| {
                            if let Err(e) = dep.force(pool) {
                                failure.lock().get_or_insert(e);
                            }
                        });
                    }
                });
                if let Some(e) = failure.into_inner() {
                    return Err(e);
                }
            }
        }
        self.cell.get_or_try_init(|| (self.eval)())
    }

    /// Demand on the process-wide default pool.
    pub fn fork_join_common(&self) -> Result<&T> {
        self.fork_join(&ForkJoin::common())
    }

    /// Derived node applying `f` to this node's value.
    pub fn map<E: Send + Sync + 'static>(
        self: &Arc<Self>,
        f: impl Fn(&T) -> E + Send + Sync + 'static,
    ) -> Arc<Lazy<E>> {
        let upstream = Arc::clone(self);
        Arc::new(Lazy {
            cell: OnceCell::new(),
            deps: vec![Arc::clone(self) as Arc<dyn Dependency>],
            eval: Box::new(move || Ok(f(upstream.get()?))),
        })
    }

    /// Derived node that passes the value through after observing it.
    pub fn and_then(self: &Arc<Self>, f: impl Fn(&T) + Send + Sync + 'static) -> Arc<Lazy<T>>
    where
        T: Clone,
    {
        self.map(move |value| {
            f(value);
            value.clone()
        })
    }
}

/// Combine two upstream nodes.
pub fn zip<A, B, T>(
    a: &Arc<Lazy<A>>,
    b: &Arc<Lazy<B>>,
    f: impl Fn(&A, &B) -> T + Send + Sync + 'static,
) -> Arc<Lazy<T>>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    let (ua, ub) = (Arc::clone(a), Arc::clone(b));
    Arc::new(Lazy {
        cell: OnceCell::new(),
        deps: vec![
            Arc::clone(a) as Arc<dyn Dependency>,
            Arc::clone(b) as Arc<dyn Dependency>,
        ],
        eval: Box::new(move || Ok(f(ua.get()?, ub.get()?))),
    })
}

/// Combine three upstream nodes.
pub fn zip3<A, B, C, T>(
    a: &Arc<Lazy<A>>,
    b: &Arc<Lazy<B>>,
    c: &Arc<Lazy<C>>,
    f: impl Fn(&A, &B, &C) -> T + Send + Sync + 'static,
) -> Arc<Lazy<T>>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    C: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    let (ua, ub, uc) = (Arc::clone(a), Arc::clone(b), Arc::clone(c));
    Arc::new(Lazy {
        cell: OnceCell::new(),
        deps: vec![
            Arc::clone(a) as Arc<dyn Dependency>,
            Arc::clone(b) as Arc<dyn Dependency>,
            Arc::clone(c) as Arc<dyn Dependency>,
        ],
        eval: Box::new(move || Ok(f(ua.get()?, ub.get()?, uc.get()?))),
    })
}

/// Combine a uniform list of upstream nodes.
pub fn all<T, R>(
    nodes: &[Arc<Lazy<T>>],
    f: impl Fn(&[&T]) -> R + Send + Sync + 'static,
) -> Arc<Lazy<R>>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    let upstream: Vec<Arc<Lazy<T>>> = nodes.to_vec();
    Arc::new(Lazy {
        cell: OnceCell::new(),
        deps: nodes
            .iter()
            .map(|n| Arc::clone(n) as Arc<dyn Dependency>)
            .collect(),
        eval: Box::new(move || {
            let values: Result<Vec<&T>> = upstream.iter().map(|n| n.get()).collect();
            Ok(f(&values?))
        }),
    })
}

/// A plain single-slot mutable cell: scratch state for reducers and callers.
#[derive(Debug, Default)]
pub struct Mutable<T> {
    it: Option<T>,
}

impl<T> Mutable<T> {
    pub fn new() -> Self {
        Self { it: None }
    }

    pub fn of(value: T) -> Self {
        Self { it: Some(value) }
    }

    pub fn is_set(&self) -> bool {
        self.it.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.it.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.it.as_mut()
    }

    pub fn set(&mut self, value: T) -> &mut T {
        self.it.insert(value)
    }

    pub fn take(&mut self) -> Option<T> {
        self.it.take()
    }

    pub fn into_option(self) -> Option<T> {
        self.it
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::delay;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_get_memoizes_exactly_once() {
        let evals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evals);
        let node = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            21 * 2
        });
        assert!(!node.is_set());
        assert_eq!(*node.get().unwrap(), 42);
        assert_eq!(*node.get().unwrap(), 42);
        assert!(node.is_set());
        assert_eq!(evals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_get_evaluates_once() {
        let evals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evals);
        let node = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            delay(Duration::from_millis(20));
            7
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let node = Arc::clone(&node);
            handles.push(thread::spawn(move || *node.get().unwrap()));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
        assert_eq!(evals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_not_memoized() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let node = Lazy::try_new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Configuration("first attempt fails".to_string()))
            } else {
                Ok(5)
            }
        });

        assert!(node.get().is_err());
        assert!(!node.is_set());
        assert_eq!(*node.get().unwrap(), 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_diamond_fork_join_evaluates_shared_node_once() {
        let evals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evals);
        let a = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            delay(Duration::from_millis(15));
            1
        });
        let b = a.map(|v| v + 10);
        let c = a.map(|v| v + 100);
        let d = zip(&b, &c, |x, y| x + y);

        let pool = ForkJoin::new(4).unwrap();
        let left = {
            let d = Arc::clone(&d);
            let pool = pool.clone();
            thread::spawn(move || *d.fork_join(&pool).unwrap())
        };
        let right = {
            let d = Arc::clone(&d);
            let pool = pool.clone();
            thread::spawn(move || *d.fork_join(&pool).unwrap())
        };
        assert_eq!(left.join().unwrap(), 112);
        assert_eq!(right.join().unwrap(), 112);
        assert_eq!(evals.load(Ordering::SeqCst), 1, "shared node must evaluate once");
    }

    #[test]
    fn test_fork_join_skips_already_set_dependencies() {
        let evals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evals);
        let a = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            2
        });
        let b = Lazy::of(3);
        assert_eq!(*a.get().unwrap(), 2);

        let sum = zip(&a, &b, |x, y| x + y);
        assert_eq!(*sum.fork_join_common().unwrap(), 5);
        assert_eq!(evals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dependency_failure_propagates_and_caches_nothing() {
        let good = Lazy::of(1);
        let bad: Arc<Lazy<i32>> = Lazy::unset();
        let sum = zip(&good, &bad, |x, y| x + y);

        let pool = ForkJoin::new(2).unwrap();
        match sum.fork_join(&pool) {
            Err(Error::Unset) => {}
            other => panic!("expected Unset, got {other:?}"),
        }
        assert!(!sum.is_set());
    }

    #[test]
    fn test_zip3_and_all_combine_values() {
        let a = Lazy::of(1);
        let b = Lazy::of(2);
        let c = Lazy::of(3);
        let total = zip3(&a, &b, &c, |x, y, z| x + y + z);
        assert_eq!(*total.get().unwrap(), 6);

        let nodes = vec![Lazy::of(10), Lazy::of(20), Lazy::of(30)];
        let summed = all(&nodes, |values| values.iter().map(|v| **v).sum::<i32>());
        assert_eq!(*summed.fork_join_common().unwrap(), 60);
    }

    #[test]
    fn test_if_set_and_and_then() {
        let observed = Arc::new(AtomicUsize::new(0));
        let node = Lazy::of(9);
        let watcher = Arc::clone(&observed);
        let peeked = node.and_then(move |v| {
            watcher.store(*v as usize, Ordering::SeqCst);
        });

        let mut called = false;
        peeked.if_set(|_| called = true);
        assert!(!called, "if_set must not force evaluation");

        assert_eq!(*peeked.get().unwrap(), 9);
        assert_eq!(observed.load(Ordering::SeqCst), 9);
        peeked.if_set(|_| called = true);
        assert!(called);
    }

    #[test]
    fn test_mutable_cell() {
        let mut cell = Mutable::new();
        assert!(!cell.is_set());
        cell.set(4);
        assert_eq!(cell.get(), Some(&4));
        assert_eq!(cell.take(), Some(4));
        assert!(!cell.is_set());
        assert_eq!(Mutable::of(8).into_option(), Some(8));
    }
}
