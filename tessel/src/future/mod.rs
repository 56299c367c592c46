//! Single-assignment result cells and continuation chaining.

mod ext;
pub(crate) use ext::guarded;
pub use ext::{DeferredExt, Finally, HandleException, OrElse, Then, ThenAsync, ThenWrapped};

mod promise;
pub use promise::{failed, promise, ready, Deferred, Promise};

use crate::error::Result;
use futures::future::{join_all, LocalBoxFuture};
use std::future::Future;

/// Keeps `value` alive, at a stable heap address, until the future produced
/// by `f(&mut value)` resolves. The value is dropped right after, on success,
/// failure or cancellation of the returned future alike.
///
/// ```ignore
/// let len = do_with(Vec::new(), |buf| Box::pin(async move {
///     buf.extend_from_slice(b"abc");
///     Ok(buf.len())
/// })).await?;
/// ```
pub fn do_with<T, R, F>(value: T, f: F) -> LocalBoxFuture<'static, Result<R>>
where
    T: 'static,
    R: 'static,
    F: for<'a> FnOnce(&'a mut T) -> LocalBoxFuture<'a, Result<R>> + 'static,
{
    Box::pin(async move {
        let mut value = value;
        let fut = guarded(|| f(&mut value))?;
        fut.await
    })
}

/// Waits for every future and returns all results in input order.
pub async fn when_all<I, F, T>(futures: I) -> Vec<Result<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    join_all(futures).await
}

/// Runs `f` for every item concurrently. Every invocation is awaited even
/// when one fails; the first failure in input order is returned.
pub async fn parallel_for_each<I, F, Fut>(items: I, f: F) -> Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    join_all(items.into_iter().map(f))
        .await
        .into_iter()
        .collect()
}
