//! Executable predicates produced by the restrictor and check compilers
//!
//! A predicate is a shareable async function from an input to `Result<bool>`.
//! Combinators evaluate their children strictly left to right and stop at the
//! first child that decides the outcome.

use crate::error::Result;
use crate::types::{CheckPermContext, Entity};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

/// Compiled async predicate over `T`
pub type Predicate<T> = Arc<dyn Fn(Arc<T>) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Predicate over an entity (compiled restrictor)
pub type EntityPredicate = Predicate<Entity>;

/// Predicate over a request context (compiled condition tree)
pub type CheckPredicate = Predicate<CheckPermContext>;

/// Wrap an async function as a predicate
pub fn predicate<T, F, Fut>(f: F) -> Predicate<T>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(move |input: Arc<T>| f(input).boxed())
}

/// Wrap a synchronous test as a predicate
pub fn sync_predicate<T, F>(f: F) -> Predicate<T>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(move |input: Arc<T>| {
        let outcome: Result<bool> = Ok(f(&input));
        futures::future::ready(outcome).boxed()
    })
}

/// Predicate with a fixed outcome
pub fn constant<T>(outcome: bool) -> Predicate<T>
where
    T: Send + Sync + 'static,
{
    Arc::new(move |_input: Arc<T>| {
        let outcome: Result<bool> = Ok(outcome);
        futures::future::ready(outcome).boxed()
    })
}

/// Conjunction; empty is `true`, a single child is returned unwrapped
pub fn all_of<T>(mut children: Vec<Predicate<T>>) -> Predicate<T>
where
    T: Send + Sync + 'static,
{
    match children.len() {
        0 => constant(true),
        1 => children.remove(0),
        _ => {
            let children: Arc<[Predicate<T>]> = children.into();
            predicate(move |input| eval_all(Arc::clone(&children), input))
        }
    }
}

/// Disjunction; empty is `false`, a single child is returned unwrapped
pub fn any_of<T>(mut children: Vec<Predicate<T>>) -> Predicate<T>
where
    T: Send + Sync + 'static,
{
    match children.len() {
        0 => constant(false),
        1 => children.remove(0),
        _ => {
            let children: Arc<[Predicate<T>]> = children.into();
            predicate(move |input| eval_any(Arc::clone(&children), input))
        }
    }
}

/// Negation
pub fn negate<T>(inner: Predicate<T>) -> Predicate<T>
where
    T: Send + Sync + 'static,
{
    predicate(move |input| eval_not(Arc::clone(&inner), input))
}

async fn eval_not<T>(inner: Predicate<T>, input: Arc<T>) -> Result<bool> {
    Ok(!inner(input).await?)
}

async fn eval_all<T>(children: Arc<[Predicate<T>]>, input: Arc<T>) -> Result<bool> {
    for child in children.iter() {
        if !child(Arc::clone(&input)).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn eval_any<T>(children: Arc<[Predicate<T>]>, input: Arc<T>) -> Result<bool> {
    for child in children.iter() {
        if child(Arc::clone(&input)).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(outcome: bool, calls: Arc<AtomicUsize>) -> Predicate<u32> {
        sync_predicate(move |_: &u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            outcome
        })
    }

    #[tokio::test]
    async fn test_all_of_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = all_of(vec![
            counting(true, calls.clone()),
            counting(false, calls.clone()),
            counting(true, calls.clone()),
        ]);

        assert!(!p(Arc::new(0)).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_any_of_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = any_of(vec![
            counting(false, calls.clone()),
            counting(true, calls.clone()),
            counting(false, calls.clone()),
        ]);

        assert!(p(Arc::new(0)).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_combinators() {
        assert!(all_of::<u32>(vec![])(Arc::new(0)).await.unwrap());
        assert!(!any_of::<u32>(vec![])(Arc::new(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_child_is_unwrapped() {
        let only = constant::<u32>(true);
        let wrapped = all_of(vec![Arc::clone(&only)]);
        assert!(Arc::ptr_eq(&only, &wrapped));
    }

    #[tokio::test]
    async fn test_negate() {
        assert!(!negate(constant::<u32>(true))(Arc::new(0)).await.unwrap());
        assert!(negate(constant::<u32>(false))(Arc::new(0)).await.unwrap());
    }
}
