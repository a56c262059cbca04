//! Turning ordinary functions into graph-building primitives.
//!
//! [`wrap`] takes a callable and returns a [`Delayed`]. Calling it with
//! [`Delayed::call`] doesn't run anything: it records a new task whose
//! arguments are the given parameters, and returns a [`Lazy`] handle to the
//! future result.
//!
//! ## Task keys and deduplication
//!
//! A task key is derived from the callable identity and the fingerprints of all
//! literal arguments, so identical invocations coalesce into one task. The
//! callable identity is:
//!
//! * for zero-sized callables (function items and closures that capture
//!   nothing), their `TypeId`. Such a callable's behaviour is fully determined
//!   by its type, so two `wrap`s of the same function share keys.
//! * for anything else, a token unique to that `wrap` call. Calling the same
//!   `Delayed` twice with the same arguments still deduplicates.
//!
//! If any argument can't be fingerprinted (see [`Opaque`](crate::Opaque)) the
//! key is made unique instead. Deduplication is an optimisation only; results
//! never depend on it.

use std::any::TypeId;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::{ArcStr, Blake3Hasher, Dynamic, Hash32};
use crate::graph::{Arg, Call, CallFn, Input, Task, TaskGraph, TaskKey};
use crate::lazy::Lazy;
use crate::param::Param;

/// Graph fragments contributed by the lazy arguments of a single call.
///
/// Collected while arguments are turned into specs, then merged into the
/// graph of the new task.
#[derive(Default)]
pub struct Fragments {
    graphs: Vec<Arc<TaskGraph>>,
}

impl Fragments {
    pub(crate) fn push(&mut self, graph: Arc<TaskGraph>) {
        if !self.graphs.iter().any(|known| Arc::ptr_eq(known, &graph)) {
            self.graphs.push(graph);
        }
    }

    /// Merge all fragments and add `task` under `key`.
    ///
    /// The largest fragment is reused as the base, so chains of calls only
    /// copy the smaller side. A base no other handle refers to is extended in
    /// place; a shared one is copied first.
    pub(crate) fn finish(mut self, key: TaskKey, task: Task) -> Arc<TaskGraph> {
        self.graphs.sort_by_key(|graph| std::cmp::Reverse(graph.len()));

        let mut fragments = self.graphs.into_iter();
        let Some(base) = fragments.next() else {
            let mut graph = TaskGraph::new();
            graph.insert(key, task);
            return Arc::new(graph);
        };

        let rest: Vec<_> = fragments.collect();
        let complete = base.contains(&key)
            && rest
                .iter()
                .all(|fragment| fragment.keys().all(|key| base.contains(key)));

        if complete {
            return base;
        }

        let mut base = base;
        let graph = Arc::make_mut(&mut base);
        for fragment in &rest {
            graph.merge(fragment);
        }

        if !graph.contains(&key) {
            graph.insert(key, task);
        }

        base
    }
}

/// A wrapped callable; calling it builds a task instead of running it.
///
/// `A` is the argument the callable receives (a tuple for several arguments)
/// and `R` is its output.
pub struct Delayed<F, A, R> {
    name: ArcStr,
    func: Arc<F>,
    identity: Hash32,
    _phantom: PhantomData<fn(A) -> R>,
}

/// Wrap `func` so that calling it defers execution.
///
/// `name` becomes the prefix of every task key created by this callable.
///
/// ```rust
/// use lazygraph::wrap;
///
/// let inc = wrap("inc", |x: i64| Ok(x + 1));
/// let add = wrap("add", |(x, y): (i64, i64)| Ok(x + y));
///
/// let total = add.call((inc.call(15_i64), inc.call(30_i64)));
/// assert_eq!(total.compute().unwrap(), 47);
/// ```
pub fn wrap<F, A, R>(name: impl Into<Arc<str>>, func: F) -> Delayed<F, A, R>
where
    F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    A: 'static,
    R: Send + Sync + 'static,
{
    let name: ArcStr = name.into();

    let identity = if size_of::<F>() == 0 {
        let mut hasher = Blake3Hasher::default();
        TypeId::of::<F>().hash(&mut hasher);
        name.hash(&mut hasher);
        hasher.into()
    } else {
        Hash32::unique()
    };

    Delayed {
        name,
        func: Arc::new(func),
        identity,
        _phantom: PhantomData,
    }
}

impl<F, A, R> Delayed<F, A, R>
where
    F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    A: 'static,
    R: Send + Sync + 'static,
{
    /// Record an invocation with `params` and return a handle to its result.
    ///
    /// Handles may be passed by reference or by value. The new task is added
    /// to a copy of the argument graph while any other handle still shares
    /// it, so a long chain built from `&prev` copies the graph at every step.
    /// Passing `prev` by value lets the graph be extended in place:
    ///
    /// ```rust
    /// use lazygraph::{Lazy, wrap};
    ///
    /// let inc = wrap("inc", |x: i64| Ok(x + 1));
    ///
    /// let mut value = Lazy::value(0_i64);
    /// for _ in 0..100 {
    ///     value = inc.call(value);
    /// }
    /// assert_eq!(value.compute().unwrap(), 100);
    /// ```
    pub fn call<P>(&self, params: P) -> Lazy<R>
    where
        P: Param<Value = A>,
    {
        let mut fragments = Fragments::default();
        let args = params.to_args(&mut fragments);
        let key = self.key_for(&args);

        let func = erase(Arc::clone(&self.func), P::extract_args);
        let call = Call::from_erased(self.name.clone(), func, args);

        tracing::trace!(task = %key, "recorded call");

        let graph = fragments.finish(key.clone(), Task::Call(Arc::new(call)));
        Lazy::from_parts(key, graph)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key_for(&self, args: &[Arg]) -> TaskKey {
        let mut hasher = Blake3Hasher::default();
        std::hash::Hasher::write(&mut hasher, self.identity.as_bytes());
        std::hash::Hasher::write_usize(&mut hasher, args.len());

        let token = if args.iter().all(|arg| arg.fingerprint(&mut hasher)) {
            hasher.into()
        } else {
            Hash32::unique()
        };

        TaskKey::derive(&self.name, token)
    }
}

impl<F, A, R> Clone for Delayed<F, A, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: self.func.clone(),
            identity: self.identity,
            _phantom: PhantomData,
        }
    }
}

impl<F, A, R> std::fmt::Debug for Delayed<F, A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Delayed({})", self.name)
    }
}

// Kept apart from `Delayed::call` so that the closure doesn't carry the
// parameter type, which may borrow.
fn erase<F, A, R>(func: Arc<F>, extract: fn(&[Input]) -> anyhow::Result<A>) -> CallFn
where
    F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    A: 'static,
    R: Send + Sync + 'static,
{
    Arc::new(move |inputs: &[Input]| {
        let args = extract(inputs)?;
        let output = func(args)?;
        Ok(Arc::new(output) as Dynamic)
    })
}
