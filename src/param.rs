//! How call arguments are embedded into the graph and handed back to callables.
//!
//! Every argument of [`Delayed::call`](crate::Delayed::call) implements
//! [`Param`]. A parameter knows two things:
//!
//! * **At build time**: how to turn itself into an [`Arg`] spec. Lazy handles
//!   become dependency edges (and contribute their graph), literals are
//!   embedded, containers are traversed element-wise.
//! * **At run time**: how to rebuild the value the callable expects from the
//!   resolved [`Input`] tree.
//!
//! Tuples are the multi-argument form: `(a, b)` is two top-level argument
//! specs, and the callable receives `(A, B)`.
//!
//! `Vec<P>` and `BTreeMap<String, P>` hold a single parameter type. To mix
//! known values and handles in one container, use [`MaybeLazy`]:
//!
//! ```rust
//! use lazygraph::{MaybeLazy, wrap};
//!
//! let inc = wrap("inc", |x: i64| Ok(x + 1));
//! let sum = wrap("sum", |xs: Vec<i64>| Ok(xs.iter().sum::<i64>()));
//!
//! let total = sum.call(vec![MaybeLazy::Literal(1), MaybeLazy::Lazy(inc.call(1_i64))]);
//! assert_eq!(total.compute().unwrap(), 3);
//! ```

use std::collections::BTreeMap;
use std::hash::Hash;

use anyhow::{anyhow, bail};

use crate::builder::Fragments;
use crate::graph::{Arg, Input, Literal};
use crate::lazy::Lazy;

/// Something that can be passed as an argument to a wrapped callable.
pub trait Param: Sized {
    /// The value the callable receives in place of this parameter.
    type Value: 'static;

    /// Turn this parameter into a single argument spec.
    fn to_arg(self, fragments: &mut Fragments) -> Arg;

    /// Rebuild the value from a resolved argument.
    fn extract(input: &Input) -> anyhow::Result<Self::Value>;

    /// Turn this parameter into the top-level argument list of a call.
    fn to_args(self, fragments: &mut Fragments) -> Vec<Arg> {
        vec![self.to_arg(fragments)]
    }

    /// Rebuild the value from the top-level argument list of a call.
    fn extract_args(inputs: &[Input]) -> anyhow::Result<Self::Value> {
        match inputs {
            [input] => Self::extract(input),
            _ => Err(anyhow!("Expected 1 argument, got {}", inputs.len())),
        }
    }
}

/// Embeds any hashable value as a single literal argument.
///
/// Containers such as `Vec<u8>` are otherwise traversed element by element;
/// wrapping them in `Lit` embeds them whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lit<T>(pub T);

impl<T> Param for Lit<T>
where
    T: Hash + Clone + Send + Sync + 'static,
{
    type Value = T;

    fn to_arg(self, _: &mut Fragments) -> Arg {
        Arg::Literal(Literal::new(self.0))
    }

    fn extract(input: &Input) -> anyhow::Result<Self::Value> {
        input.downcast::<T>()
    }
}

/// Embeds a value that can't be hashed. Calls receiving an `Opaque` argument
/// are never deduplicated.
#[derive(Debug, Clone)]
pub struct Opaque<T>(pub T);

impl<T> Param for Opaque<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn to_arg(self, _: &mut Fragments) -> Arg {
        Arg::Literal(Literal::opaque(self.0))
    }

    fn extract(input: &Input) -> anyhow::Result<Self::Value> {
        input.downcast::<T>()
    }
}

impl<T> Param for Lazy<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn to_arg(self, fragments: &mut Fragments) -> Arg {
        let (key, graph) = self.into_parts();
        fragments.push(graph);
        Arg::Ref(key)
    }

    fn extract(input: &Input) -> anyhow::Result<Self::Value> {
        input.downcast::<T>()
    }
}

impl<T> Param for &Lazy<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn to_arg(self, fragments: &mut Fragments) -> Arg {
        self.clone().to_arg(fragments)
    }

    fn extract(input: &Input) -> anyhow::Result<Self::Value> {
        input.downcast::<T>()
    }
}

/// Either a known value or a handle to one, for containers mixing both.
#[derive(Clone)]
pub enum MaybeLazy<T> {
    Literal(T),
    Lazy(Lazy<T>),
}

impl<T> From<Lazy<T>> for MaybeLazy<T> {
    fn from(value: Lazy<T>) -> Self {
        MaybeLazy::Lazy(value)
    }
}

impl<T> From<&Lazy<T>> for MaybeLazy<T> {
    fn from(value: &Lazy<T>) -> Self {
        MaybeLazy::Lazy(value.clone())
    }
}

impl<T> Param for MaybeLazy<T>
where
    T: Hash + Clone + Send + Sync + 'static,
{
    type Value = T;

    fn to_arg(self, fragments: &mut Fragments) -> Arg {
        match self {
            MaybeLazy::Literal(value) => Arg::Literal(Literal::new(value)),
            MaybeLazy::Lazy(lazy) => lazy.to_arg(fragments),
        }
    }

    fn extract(input: &Input) -> anyhow::Result<Self::Value> {
        input.downcast::<T>()
    }
}

impl<P: Param> Param for Vec<P> {
    type Value = Vec<P::Value>;

    fn to_arg(self, fragments: &mut Fragments) -> Arg {
        Arg::List(self.into_iter().map(|p| p.to_arg(fragments)).collect())
    }

    fn extract(input: &Input) -> anyhow::Result<Self::Value> {
        match input {
            Input::List(items) => items.iter().map(P::extract).collect(),
            _ => bail!("Expected a list argument"),
        }
    }
}

impl<P: Param> Param for BTreeMap<String, P> {
    type Value = BTreeMap<String, P::Value>;

    fn to_arg(self, fragments: &mut Fragments) -> Arg {
        Arg::Map(
            self.into_iter()
                .map(|(key, p)| (key, p.to_arg(fragments)))
                .collect(),
        )
    }

    fn extract(input: &Input) -> anyhow::Result<Self::Value> {
        match input {
            Input::Map(items) => items
                .iter()
                .map(|(key, item)| Ok((key.clone(), P::extract(item)?)))
                .collect(),
            _ => bail!("Expected a map argument"),
        }
    }
}

macro_rules! impl_param_literal {
    ($($T:ty),*) => {
        $(
            impl Param for $T {
                type Value = $T;

                fn to_arg(self, _: &mut Fragments) -> Arg {
                    Arg::Literal(Literal::new(self))
                }

                fn extract(input: &Input) -> anyhow::Result<Self::Value> {
                    input.downcast::<$T>()
                }
            }
        )*
    };
}

impl_param_literal!(
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    String,
    &'static str
);

macro_rules! impl_param_float {
    ($($T:ty),*) => {
        $(
            impl Param for $T {
                type Value = $T;

                fn to_arg(self, _: &mut Fragments) -> Arg {
                    Arg::Literal(Literal::keyed(self, self.to_bits()))
                }

                fn extract(input: &Input) -> anyhow::Result<Self::Value> {
                    input.downcast::<$T>()
                }
            }
        )*
    };
}

impl_param_float!(f32, f64);

/// The empty argument list.
impl Param for () {
    type Value = ();

    fn to_arg(self, _: &mut Fragments) -> Arg {
        Arg::List(vec![])
    }

    fn extract(input: &Input) -> anyhow::Result<Self::Value> {
        match input {
            Input::List(items) => Self::extract_args(items),
            _ => bail!("Expected an empty tuple argument"),
        }
    }

    fn to_args(self, _: &mut Fragments) -> Vec<Arg> {
        vec![]
    }

    fn extract_args(inputs: &[Input]) -> anyhow::Result<Self::Value> {
        match inputs {
            [] => Ok(()),
            _ => Err(anyhow!("Expected no arguments, got {}", inputs.len())),
        }
    }
}

macro_rules! impl_param_tuple {
    ($len:literal; $($P:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($P: Param),*> Param for ($($P,)*) {
            type Value = ($($P::Value,)*);

            fn to_arg(self, fragments: &mut Fragments) -> Arg {
                Arg::List(self.to_args(fragments))
            }

            fn extract(input: &Input) -> anyhow::Result<Self::Value> {
                match input {
                    Input::List(items) => Self::extract_args(items),
                    _ => bail!("Expected a tuple argument"),
                }
            }

            fn to_args(self, fragments: &mut Fragments) -> Vec<Arg> {
                let ($($P,)*) = self;
                vec![$($P.to_arg(fragments)),*]
            }

            fn extract_args(inputs: &[Input]) -> anyhow::Result<Self::Value> {
                let [$($P),*] = inputs else {
                    bail!("Expected {} arguments, got {}", $len, inputs.len());
                };

                Ok(($($P::extract($P)?,)*))
            }
        }
    };
}

impl_param_tuple!(1; A);
impl_param_tuple!(2; A, B);
impl_param_tuple!(3; A, B, C);
impl_param_tuple!(4; A, B, C, D);
impl_param_tuple!(5; A, B, C, D, E);
impl_param_tuple!(6; A, B, C, D, E, F);
impl_param_tuple!(7; A, B, C, D, E, F, G);
impl_param_tuple!(8; A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::Dynamic;

    fn value<T: Send + Sync + 'static>(v: T) -> Input {
        Input::Value(Arc::new(v) as Dynamic)
    }

    #[test]
    fn test_tuple_flattens_into_arguments() {
        let mut fragments = Fragments::default();
        let args = (1i64, "two", 3.0f64).to_args(&mut fragments);
        assert_eq!(args.len(), 3);
        assert!(matches!(args[0], Arg::Literal(_)));
    }

    #[test]
    fn test_nested_tuple_is_a_list() {
        let mut fragments = Fragments::default();
        let args = vec![(1i64, 2i64), (3, 4)].to_args(&mut fragments);
        assert_eq!(args.len(), 1);
        match &args[0] {
            Arg::List(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[0], Arg::List(pair) if pair.len() == 2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_extract_tuple() {
        let inputs = [value(1i64), value(String::from("a"))];
        let (a, b) = <(i64, String)>::extract_args(&inputs).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, "a");
    }

    #[test]
    fn test_extract_wrong_arity() {
        let inputs = [value(1i64)];
        assert!(<(i64, i64)>::extract_args(&inputs).is_err());
    }

    #[test]
    fn test_extract_wrong_type() {
        let err = i64::extract(&value("nope")).unwrap_err();
        assert!(err.to_string().contains("i64"));
    }

    #[test]
    fn test_extract_map() {
        let input = Input::Map(BTreeMap::from([
            ("a".to_string(), value(1u32)),
            ("b".to_string(), value(2u32)),
        ]));

        let map = BTreeMap::<String, u32>::extract(&input).unwrap();
        assert_eq!(map["a"], 1);
        assert_eq!(map["b"], 2);
    }

    #[test]
    fn test_unit_takes_no_arguments() {
        let mut fragments = Fragments::default();
        assert!(().to_args(&mut fragments).is_empty());
        assert!(<()>::extract_args(&[]).is_ok());
        assert!(<()>::extract_args(&[value(1u8)]).is_err());
    }

    #[test]
    fn test_float_literals_fingerprint() {
        let mut fragments = Fragments::default();
        match 0.5f64.to_arg(&mut fragments) {
            Arg::Literal(literal) => assert!(literal.is_fingerprinted()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_mixed_list_of_literals_and_handles() {
        let handle = Lazy::value(5i64);
        let items = vec![MaybeLazy::Literal(1i64), MaybeLazy::from(&handle)];

        let mut fragments = Fragments::default();
        match items.to_arg(&mut fragments) {
            Arg::List(items) => {
                assert!(matches!(&items[0], Arg::Literal(literal) if literal.is_fingerprinted()));
                assert!(matches!(&items[1], Arg::Ref(key) if key == handle.key()));
            }
            other => panic!("unexpected {other:?}"),
        }

        let input = Input::List(vec![value(1i64), value(5i64)]);
        assert_eq!(Vec::<MaybeLazy<i64>>::extract(&input).unwrap(), [1, 5]);
    }

    #[test]
    fn test_opaque_is_not_fingerprinted() {
        let mut fragments = Fragments::default();
        match Opaque(vec![1, 2, 3]).to_arg(&mut fragments) {
            Arg::Literal(literal) => assert!(!literal.is_fingerprinted()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
