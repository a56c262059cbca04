use std::any::type_name;
use std::convert::Infallible;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{Index, Range};
use std::sync::Arc;

use anyhow::anyhow;

use crate::builder::wrap;
use crate::config::ComputeConfig;
use crate::core::{Dynamic, Hash32};
use crate::error::{ComputeError, UnsupportedOperation, UnsupportedOperationError};
use crate::executor::{self, Diagnostics};
use crate::graph::{Literal, Task, TaskGraph, TaskKey};
use crate::param::{Lit, Param};

/// A handle to the future result of type `T`.
///
/// A `Lazy<T>` pairs a task key with the graph that knows how to compute it.
/// Handles are immutable and cheap to clone; every handle derived from a
/// common ancestor shares the ancestor's graph.
///
/// Combining handles (through [`wrap`], the arithmetic operators or the
/// methods below) never runs anything. Call [`Lazy::compute`] to execute the
/// graph and get the value.
///
/// # Diamond Dependencies
///
/// If two handles both depend on the same computation, it is stored once in
/// the merged graph and executed once per `compute()`.
pub struct Lazy<T> {
    key: TaskKey,
    graph: Arc<TaskGraph>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            graph: self.graph.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lazy<{}>({})", type_name::<T>(), self.key)
    }
}

impl<T> Lazy<T> {
    pub(crate) fn from_parts(key: TaskKey, graph: Arc<TaskGraph>) -> Self {
        Self {
            key,
            graph,
            _phantom: PhantomData,
        }
    }

    pub(crate) fn into_parts(self) -> (TaskKey, Arc<TaskGraph>) {
        (self.key, self.graph)
    }

    /// Point a handle at `key` in a hand-built graph.
    ///
    /// Nothing is checked here; missing keys, dangling dependencies and cycles
    /// are reported by `compute`.
    pub fn from_graph(graph: impl Into<Arc<TaskGraph>>, key: impl Into<TaskKey>) -> Self {
        Self::from_parts(key.into(), graph.into())
    }

    /// The key of the task producing this value.
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Read-only view of the underlying task graph.
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    fn unsupported(&self, operation: UnsupportedOperation) -> UnsupportedOperationError {
        UnsupportedOperationError {
            operation,
            key: self.key.clone(),
        }
    }

    /// Iteration needs the concrete value, so this always fails.
    pub fn iter(&self) -> Result<Infallible, UnsupportedOperationError> {
        Err(self.unsupported(UnsupportedOperation::Iterate))
    }

    /// Truthiness needs the concrete value, so this always fails.
    pub fn truthy(&self) -> Result<bool, UnsupportedOperationError> {
        Err(self.unsupported(UnsupportedOperation::BoolCoercion))
    }

    /// Handles are immutable, so this always fails.
    pub fn set_item<I, V>(&mut self, _index: I, _value: V) -> Result<(), UnsupportedOperationError> {
        Err(self.unsupported(UnsupportedOperation::Mutate))
    }

    /// Handles are immutable, so this always fails.
    pub fn assign(&mut self, _value: T) -> Result<(), UnsupportedOperationError> {
        Err(self.unsupported(UnsupportedOperation::Mutate))
    }
}

impl<T> TryFrom<&Lazy<T>> for bool {
    type Error = UnsupportedOperationError;

    fn try_from(value: &Lazy<T>) -> Result<Self, Self::Error> {
        value.truthy()
    }
}

impl<T> Lazy<T>
where
    T: Send + Sync + 'static,
{
    /// A known value as a graph leaf. Equal values share a key.
    pub fn value(value: T) -> Self
    where
        T: Hash,
    {
        let token = Literal::new(value);
        let key = TaskKey::derive("value", token.fingerprint().unwrap_or_else(Hash32::unique));
        Self::leaf(key, Task::Data(token.value().clone()))
    }

    /// A known value as a graph leaf, without hashing it. Always a new key.
    pub fn opaque(value: T) -> Self {
        Self::leaf(TaskKey::derive("value", Hash32::unique()), Task::data(value))
    }

    fn leaf(key: TaskKey, task: Task) -> Self {
        let mut graph = TaskGraph::new();
        graph.insert(key.clone(), task);
        Self::from_parts(key, Arc::new(graph))
    }
}

impl<T> Lazy<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Execute the graph with the default configuration.
    pub fn compute(&self) -> Result<T, ComputeError> {
        self.compute_with(&ComputeConfig::default())
    }

    pub fn compute_with(&self, config: &ComputeConfig) -> Result<T, ComputeError> {
        self.compute_with_diagnostics(config)
            .map(|(value, _)| value)
    }

    /// Execute the graph and also return what happened during the run.
    pub fn compute_with_diagnostics(
        &self,
        config: &ComputeConfig,
    ) -> Result<(T, Diagnostics), ComputeError> {
        let (result, diagnostics) = self.compute_report(config);
        Ok((result?, diagnostics))
    }

    /// Execute the graph, keeping the diagnostics even when the run fails.
    ///
    /// The task states tell which tasks failed, which were skipped because
    /// they depend on a failure, and which were cancelled by a fail-fast
    /// abort.
    pub fn compute_report(
        &self,
        config: &ComputeConfig,
    ) -> (Result<T, ComputeError>, Diagnostics) {
        let (result, diagnostics) = executor::run(&self.graph, &self.key, config);
        (result.and_then(|value| self.take(value)), diagnostics)
    }

    fn take(&self, value: Dynamic) -> Result<T, ComputeError> {
        let value = value
            .downcast::<T>()
            .map_err(|_| ComputeError::TargetType {
                key: self.key.clone(),
                expected: type_name::<T>(),
            })?;

        Ok(Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone()))
    }

    /// Apply `func` to the value. Shorthand for `wrap(name, func).call(self)`.
    pub fn map<F, R>(&self, name: impl Into<Arc<str>>, func: F) -> Lazy<R>
    where
        F: Fn(T) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        wrap(name, func).call(self)
    }

    /// `value[index]`, cloned out of the container.
    ///
    /// An out of bounds index panics inside the task, which fails the task
    /// rather than the caller.
    pub fn item<I>(&self, index: I) -> Lazy<T::Output>
    where
        T: Index<I>,
        T::Output: Clone + Send + Sync + Sized + 'static,
        I: Hash + Clone + Send + Sync + 'static,
    {
        wrap(Operator::Item.name(), kernels::item::<T, I>()).call((self, Lit(index)))
    }

    /// Read a field or property of the value.
    pub fn attr<F, O>(&self, name: &str, accessor: F) -> Lazy<O>
    where
        F: Fn(&T) -> O + Send + Sync + 'static,
        O: Send + Sync + 'static,
    {
        let name = format!("{}.{name}", Operator::Attribute.name());
        wrap(name, kernels::attr::<T, O, F>(accessor)).call(self)
    }

    /// Call a method on the value, with further arguments.
    pub fn method<P, F, O>(&self, name: &str, func: F, params: P) -> Lazy<O>
    where
        P: Param,
        F: Fn(T, P::Value) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Send + Sync + 'static,
    {
        let name = format!("{}.{name}", Operator::Method.name());
        wrap(name, kernels::method::<T, P::Value, O, F>(func)).call((self, params))
    }
}

impl<E> Lazy<Vec<E>>
where
    E: Clone + Send + Sync + 'static,
{
    /// `value[range]` as a new vector. Fails the task when out of bounds.
    pub fn slice(&self, range: Range<usize>) -> Lazy<Vec<E>> {
        wrap(Operator::Slice.name(), kernels::slice::<E>()).call((self, Lit(range)))
    }

    /// Number of elements.
    pub fn len(&self) -> Lazy<usize> {
        self.attr("len", Vec::len)
    }

    pub fn is_empty(&self) -> Lazy<bool> {
        self.attr("is_empty", Vec::is_empty)
    }
}

/// The closed set of operations a [`Lazy`] handle supports directly.
///
/// Each one desugars into a call of a wrapped function, so operator results
/// deduplicate exactly like explicit calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Not,
    BitAnd,
    BitOr,
    BitXor,
    Item,
    Slice,
    Attribute,
    Method,
}

impl Operator {
    pub const fn name(self) -> &'static str {
        match self {
            Operator::Add => "add",
            Operator::Sub => "sub",
            Operator::Mul => "mul",
            Operator::Div => "div",
            Operator::Rem => "rem",
            Operator::Neg => "neg",
            Operator::Not => "not",
            Operator::BitAnd => "and",
            Operator::BitOr => "or",
            Operator::BitXor => "xor",
            Operator::Item => "getitem",
            Operator::Slice => "slice",
            Operator::Attribute => "getattr",
            Operator::Method => "method",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Callables backing the operators.
///
/// They live in free functions generic over value types only: the closures
/// capture nothing, stay zero-sized and `'static`, and so produce stable keys.
mod kernels {
    use std::ops::{Index, Range};

    use super::*;

    macro_rules! binary_kernels {
        ($($name:ident => $Trait:ident, $op:tt;)*) => {
            $(
                pub(super) fn $name<L, R>()
                    -> impl Fn((L, R)) -> anyhow::Result<<L as std::ops::$Trait<R>>::Output>
                        + Send + Sync + 'static
                where
                    L: std::ops::$Trait<R> + 'static,
                    R: 'static,
                {
                    |(lhs, rhs)| Ok(lhs $op rhs)
                }
            )*
        };
    }

    binary_kernels! {
        add => Add, +;
        sub => Sub, -;
        mul => Mul, *;
        div => Div, /;
        rem => Rem, %;
        bitand => BitAnd, &;
        bitor => BitOr, |;
        bitxor => BitXor, ^;
    }

    pub(super) fn neg<T>() -> impl Fn(T) -> anyhow::Result<T::Output> + Send + Sync + 'static
    where
        T: std::ops::Neg + 'static,
    {
        |value| Ok(-value)
    }

    pub(super) fn not<T>() -> impl Fn(T) -> anyhow::Result<T::Output> + Send + Sync + 'static
    where
        T: std::ops::Not + 'static,
    {
        |value| Ok(!value)
    }

    pub(super) fn item<T, I>()
    -> impl Fn((T, I)) -> anyhow::Result<T::Output> + Send + Sync + 'static
    where
        T: Index<I> + 'static,
        T::Output: Clone + Sized,
        I: 'static,
    {
        |(container, index)| Ok(container[index].clone())
    }

    pub(super) fn slice<E>()
    -> impl Fn((Vec<E>, Range<usize>)) -> anyhow::Result<Vec<E>> + Send + Sync + 'static
    where
        E: Clone + 'static,
    {
        |(items, range)| {
            items.get(range.clone()).map(<[E]>::to_vec).ok_or_else(|| {
                anyhow!("Slice {range:?} out of bounds for length {}", items.len())
            })
        }
    }

    pub(super) fn attr<T, O, F>(accessor: F) -> impl Fn(T) -> anyhow::Result<O> + Send + Sync + 'static
    where
        F: Fn(&T) -> O + Send + Sync + 'static,
        T: 'static,
        O: 'static,
    {
        move |value| Ok(accessor(&value))
    }

    pub(super) fn method<T, V, O, F>(
        func: F,
    ) -> impl Fn((T, V)) -> anyhow::Result<O> + Send + Sync + 'static
    where
        F: Fn(T, V) -> anyhow::Result<O> + Send + Sync + 'static,
        T: 'static,
        V: 'static,
        O: 'static,
    {
        move |(value, args)| func(value, args)
    }
}

macro_rules! binary_operator {
    ($Trait:ident, $method:ident, $variant:ident) => {
        impl<L, P> std::ops::$Trait<P> for &Lazy<L>
        where
            L: std::ops::$Trait<P::Value> + Clone + Send + Sync + 'static,
            <L as std::ops::$Trait<P::Value>>::Output: Send + Sync + 'static,
            P: Param,
        {
            type Output = Lazy<<L as std::ops::$Trait<P::Value>>::Output>;

            fn $method(self, rhs: P) -> Self::Output {
                wrap(
                    Operator::$variant.name(),
                    kernels::$method::<L, P::Value>(),
                )
                .call((self, rhs))
            }
        }

        impl<L, P> std::ops::$Trait<P> for Lazy<L>
        where
            L: std::ops::$Trait<P::Value> + Clone + Send + Sync + 'static,
            <L as std::ops::$Trait<P::Value>>::Output: Send + Sync + 'static,
            P: Param,
        {
            type Output = Lazy<<L as std::ops::$Trait<P::Value>>::Output>;

            fn $method(self, rhs: P) -> Self::Output {
                std::ops::$Trait::$method(&self, rhs)
            }
        }
    };
}

binary_operator!(Add, add, Add);
binary_operator!(Sub, sub, Sub);
binary_operator!(Mul, mul, Mul);
binary_operator!(Div, div, Div);
binary_operator!(Rem, rem, Rem);
binary_operator!(BitAnd, bitand, BitAnd);
binary_operator!(BitOr, bitor, BitOr);
binary_operator!(BitXor, bitxor, BitXor);

macro_rules! unary_operator {
    ($Trait:ident, $method:ident, $variant:ident) => {
        impl<T> std::ops::$Trait for &Lazy<T>
        where
            T: std::ops::$Trait + Clone + Send + Sync + 'static,
            T::Output: Send + Sync + 'static,
        {
            type Output = Lazy<T::Output>;

            fn $method(self) -> Self::Output {
                wrap(Operator::$variant.name(), kernels::$method::<T>()).call(self)
            }
        }

        impl<T> std::ops::$Trait for Lazy<T>
        where
            T: std::ops::$Trait + Clone + Send + Sync + 'static,
            T::Output: Send + Sync + 'static,
        {
            type Output = Lazy<T::Output>;

            fn $method(self) -> Self::Output {
                std::ops::$Trait::$method(&self)
            }
        }
    };
}

unary_operator!(Neg, neg, Neg);
unary_operator!(Not, not, Not);
