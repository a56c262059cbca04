//! The task graph: plain data describing deferred computations.
//!
//! A [`TaskGraph`] maps every [`TaskKey`] to a [`Task`]. A task is either a
//! known value (a leaf) or a call of an opaque function over an ordered list of
//! argument specs. Argument specs ([`Arg`]) are literals embedded in the graph,
//! references to other tasks (the dependency edges), or nested lists and maps of
//! those.
//!
//! The graph itself has no behaviour beyond bookkeeping. Building happens in
//! [`builder`](crate::builder) and execution in [`executor`](crate::executor).

use std::any::{TypeId, type_name};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::anyhow;

use crate::core::{ArcStr, Blake3Hasher, Dynamic, Hash32};
use crate::error::DanglingDependencyError;

/// Unique identifier of a task in a [`TaskGraph`].
///
/// Keys created by the graph builder look like `inc-3f9a…` and are derived
/// from the callable and its arguments, so that identical invocations share a
/// key. Keys for hand-built graphs can be made from any string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(ArcStr);

impl TaskKey {
    pub(crate) fn derive(name: &str, token: Hash32) -> Self {
        let hex = token.to_hex();
        TaskKey(format!("{name}-{}", &hex[..32]).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name part of a derived key (everything before the token).
    pub fn name(&self) -> &str {
        match self.0.rsplit_once('-') {
            Some((name, token)) if token.len() == 32 => name,
            _ => &self.0,
        }
    }
}

impl From<&str> for TaskKey {
    fn from(value: &str) -> Self {
        TaskKey(value.into())
    }
}

impl From<String> for TaskKey {
    fn from(value: String) -> Self {
        TaskKey(value.into())
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskKey({})", self.0)
    }
}

/// A value embedded directly in a task's arguments.
///
/// Literals which can be hashed carry a fingerprint, which takes part in the
/// derivation of the task key. Literals without one make the task key unique.
#[derive(Clone)]
pub struct Literal {
    value: Dynamic,
    type_name: &'static str,
    fingerprint: Option<Hash32>,
}

impl Literal {
    /// Embed a hashable value.
    pub fn new<T>(value: T) -> Self
    where
        T: Hash + Send + Sync + 'static,
    {
        let fingerprint = fingerprint::<T>(&value);
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
            fingerprint: Some(fingerprint),
        }
    }

    /// Embed a value which is identified by `key` rather than by itself, for
    /// types such as floats which don't implement `Hash`.
    pub fn keyed<T, K>(value: T, key: K) -> Self
    where
        T: Send + Sync + 'static,
        K: Hash,
    {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
            fingerprint: Some(fingerprint::<T>(&key)),
        }
    }

    /// Embed a value without identifying it.
    pub fn opaque<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
            fingerprint: None,
        }
    }

    pub fn value(&self) -> &Dynamic {
        &self.value
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_fingerprinted(&self) -> bool {
        self.fingerprint.is_some()
    }

    pub(crate) fn fingerprint(&self) -> Option<Hash32> {
        self.fingerprint
    }
}

impl Debug for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Literal(<{}>)", self.type_name)
    }
}

/// Fingerprint `key` as the identity of a value of type `T`.
pub(crate) fn fingerprint<T: 'static>(key: &(impl Hash + ?Sized)) -> Hash32 {
    let mut hasher = Blake3Hasher::default();
    TypeId::of::<T>().hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.into()
}

/// A single argument spec of a computation task.
#[derive(Clone, Debug)]
pub enum Arg {
    /// A value embedded in the graph.
    Literal(Literal),
    /// The output of another task.
    Ref(TaskKey),
    /// An ordered sequence, traversed element-wise.
    List(Vec<Arg>),
    /// A string-keyed mapping, traversed element-wise.
    Map(BTreeMap<String, Arg>),
}

impl Arg {
    fn collect_dependencies(&self, seen: &mut HashSet<TaskKey>, out: &mut Vec<TaskKey>) {
        match self {
            Arg::Literal(_) => {}
            Arg::Ref(key) => {
                if seen.insert(key.clone()) {
                    out.push(key.clone());
                }
            }
            Arg::List(items) => {
                for item in items {
                    item.collect_dependencies(seen, out);
                }
            }
            Arg::Map(items) => {
                for item in items.values() {
                    item.collect_dependencies(seen, out);
                }
            }
        }
    }

    /// Feed this argument's structure into `hasher`. Returns `false` as soon as
    /// a part without a fingerprint is found.
    pub(crate) fn fingerprint(&self, hasher: &mut Blake3Hasher) -> bool {
        match self {
            Arg::Literal(literal) => match literal.fingerprint() {
                Some(hash) => {
                    hasher.write_u8(0);
                    hasher.write(hash.as_bytes());
                    true
                }
                None => false,
            },
            Arg::Ref(key) => {
                hasher.write_u8(1);
                key.as_str().hash(hasher);
                true
            }
            Arg::List(items) => {
                hasher.write_u8(2);
                hasher.write_usize(items.len());
                items.iter().all(|item| item.fingerprint(hasher))
            }
            Arg::Map(items) => {
                hasher.write_u8(3);
                hasher.write_usize(items.len());
                items.iter().all(|(key, item)| {
                    key.hash(hasher);
                    item.fingerprint(hasher)
                })
            }
        }
    }
}

/// An argument spec with every reference replaced by the computed value.
///
/// This is what a task's callable receives at execution time; the structure of
/// lists and maps is preserved.
#[derive(Clone)]
pub enum Input {
    Value(Dynamic),
    List(Vec<Input>),
    Map(BTreeMap<String, Input>),
}

impl Input {
    /// Clone the value out, checking it has the expected type.
    pub fn downcast<T: Clone + 'static>(&self) -> anyhow::Result<T> {
        match self {
            Input::Value(value) => value.downcast_ref::<T>().cloned().ok_or_else(|| {
                anyhow!("Expected a value of type {}", type_name::<T>())
            }),
            Input::List(_) => Err(anyhow!(
                "Expected a value of type {}, got a list",
                type_name::<T>()
            )),
            Input::Map(_) => Err(anyhow!(
                "Expected a value of type {}, got a map",
                type_name::<T>()
            )),
        }
    }
}

impl Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Input::Value(_) => write!(f, "Value(*)"),
            Input::List(items) => f.debug_list().entries(items).finish(),
            Input::Map(items) => f.debug_map().entries(items).finish(),
        }
    }
}

/// Type-erased callable of a computation task.
pub type CallFn = Arc<dyn Fn(&[Input]) -> anyhow::Result<Dynamic> + Send + Sync>;

/// A call of an opaque function over argument specs.
pub struct Call {
    name: ArcStr,
    func: CallFn,
    args: Vec<Arg>,
}

impl Call {
    pub(crate) fn from_erased(name: ArcStr, func: CallFn, args: Vec<Arg>) -> Self {
        Self { name, func, args }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }
}

impl Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

/// Descriptor of a single node in the task graph.
#[derive(Clone, Debug)]
pub enum Task {
    /// An already known value with no dependencies.
    Data(Dynamic),
    /// A computation over other tasks and literals.
    Call(Arc<Call>),
}

impl Task {
    pub fn data<T: Send + Sync + 'static>(value: T) -> Self {
        Task::Data(Arc::new(value))
    }

    /// Build a computation task by hand. The callable receives one [`Input`]
    /// per argument spec, in order.
    pub fn call<F, R>(name: impl Into<Arc<str>>, func: F, args: Vec<Arg>) -> Self
    where
        F: Fn(&[Input]) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let func: CallFn = Arc::new(move |inputs: &[Input]| {
            let output = func(inputs)?;
            Ok(Arc::new(output) as Dynamic)
        });

        Task::Call(Arc::new(Call::from_erased(name.into(), func, args)))
    }

    pub fn name(&self) -> &str {
        match self {
            Task::Data(_) => "data",
            Task::Call(call) => call.name(),
        }
    }

    /// Direct dependencies in order of first appearance, without duplicates.
    pub fn dependencies(&self) -> Vec<TaskKey> {
        match self {
            Task::Data(_) => vec![],
            Task::Call(call) => {
                let mut seen = HashSet::new();
                let mut out = Vec::new();
                for arg in &call.args {
                    arg.collect_dependencies(&mut seen, &mut out);
                }
                out
            }
        }
    }

    pub(crate) fn run(&self, inputs: &[Input]) -> anyhow::Result<Dynamic> {
        match self {
            Task::Data(value) => Ok(value.clone()),
            Task::Call(call) => (call.func)(inputs),
        }
    }
}

/// Mapping from task key to task descriptor.
#[derive(Clone, Default, Debug)]
pub struct TaskGraph {
    tasks: HashMap<TaskKey, Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task, returning the one previously stored under `key`.
    pub fn insert(&mut self, key: impl Into<TaskKey>, task: Task) -> Option<Task> {
        self.tasks.insert(key.into(), task)
    }

    pub fn get(&self, key: &TaskKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.tasks.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskKey, &Task)> {
        self.tasks.iter()
    }

    pub fn dependencies(&self, key: &TaskKey) -> Option<Vec<TaskKey>> {
        self.tasks.get(key).map(Task::dependencies)
    }

    /// Copy every task of `other` which isn't present yet. Identical keys are
    /// assumed to denote identical computations and are coalesced.
    pub fn merge(&mut self, other: &TaskGraph) {
        self.tasks.reserve(other.len());
        for (key, task) in &other.tasks {
            self.tasks
                .entry(key.clone())
                .or_insert_with(|| task.clone());
        }
    }

    /// Every key reachable from `target` (the target included), in
    /// depth-first discovery order.
    ///
    /// The caller is expected to check that `target` itself is present.
    pub fn reachable<'a>(
        &'a self,
        target: &'a TaskKey,
    ) -> Result<Vec<&'a TaskKey>, DanglingDependencyError> {
        let mut seen = HashSet::from([target]);
        let mut order = Vec::new();
        let mut stack = vec![target];

        while let Some(key) = stack.pop() {
            order.push(key);

            let Some(task) = self.tasks.get(key) else {
                continue;
            };

            for dependency in task.dependencies() {
                let Some((dependency, _)) = self.tasks.get_key_value(&dependency) else {
                    return Err(DanglingDependencyError {
                        task: key.clone(),
                        missing: dependency,
                    });
                };

                if seen.insert(dependency) {
                    stack.push(dependency);
                }
            }
        }

        Ok(order)
    }
}

impl Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.tasks.keys().collect();
        keys.sort();

        for key in keys {
            let task = &self.tasks[key];
            match task {
                Task::Data(_) => writeln!(f, "{key} (data)")?,
                Task::Call(_) => {
                    let dependencies = task
                        .dependencies()
                        .iter()
                        .map(TaskKey::as_str)
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(f, "{key} <- [{dependencies}]")?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_task(a: &str, b: &str) -> Task {
        Task::call(
            "add",
            |inputs| Ok(inputs[0].downcast::<i64>()? + inputs[1].downcast::<i64>()?),
            vec![Arg::Ref(a.into()), Arg::Ref(b.into())],
        )
    }

    #[test]
    fn test_dependencies_are_ordered_and_unique() {
        let task = Task::call(
            "f",
            |_| Ok(()),
            vec![
                Arg::Ref("b".into()),
                Arg::List(vec![Arg::Ref("a".into()), Arg::Ref("b".into())]),
                Arg::Map(BTreeMap::from([("k".to_string(), Arg::Ref("c".into()))])),
                Arg::Literal(Literal::new(1u8)),
            ],
        );

        let deps = task.dependencies();
        assert_eq!(deps, vec!["b".into(), "a".into(), "c".into()]);
    }

    #[test]
    fn test_merge_coalesces_keys() {
        let mut left = TaskGraph::new();
        left.insert("x", Task::data(1i64));
        left.insert("y", Task::data(2i64));

        let mut right = TaskGraph::new();
        right.insert("y", Task::data(2i64));
        right.insert("z", add_task("x", "y"));

        left.merge(&right);
        assert_eq!(left.len(), 3);
        assert!(left.contains(&"z".into()));
    }

    #[test]
    fn test_reachable_skips_unrelated() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert("y", Task::data(2i64));
        graph.insert("unrelated", Task::data(3i64));
        graph.insert("z", add_task("x", "y"));

        let target = TaskKey::from("z");
        let reachable = graph.reachable(&target).unwrap();
        assert_eq!(reachable.len(), 3);
        assert_eq!(reachable[0], &target);
        assert!(!reachable.contains(&&TaskKey::from("unrelated")));
    }

    #[test]
    fn test_reachable_reports_dangling() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert("z", add_task("x", "ghost"));

        let target = TaskKey::from("z");
        let err = graph.reachable(&target).unwrap_err();
        assert_eq!(err.task, target);
        assert_eq!(err.missing, TaskKey::from("ghost"));
    }

    #[test]
    fn test_literal_fingerprints() {
        let a = Literal::new(5i64);
        let b = Literal::new(5i64);
        let c = Literal::new(5i32);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(!Literal::opaque(5i64).is_fingerprinted());
    }

    #[test]
    fn test_fingerprint_distinguishes_structure() {
        let digest = |arg: &Arg| {
            let mut hasher = Blake3Hasher::default();
            assert!(arg.fingerprint(&mut hasher));
            Hash32::from(hasher)
        };

        let one = Arg::Literal(Literal::new(1i64));
        let flat = Arg::List(vec![one.clone(), one.clone()]);
        let nested = Arg::List(vec![Arg::List(vec![one.clone()]), one.clone()]);
        assert_ne!(digest(&flat), digest(&nested));
    }

    #[test]
    fn test_key_name() {
        let key = TaskKey::derive("inc", Hash32::unique());
        assert_eq!(key.name(), "inc");
        assert_eq!(TaskKey::from("plain").name(), "plain");
    }

    #[test]
    fn test_display_lists_dependencies() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert("z", add_task("x", "x"));

        let text = graph.to_string();
        assert!(text.contains("x (data)"));
        assert!(text.contains("z <- [x]"));
    }
}
