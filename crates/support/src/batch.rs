//! Bounded parallel map.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::num::NonZeroUsize;

/// Apply `f` to every item with at most `concurrency` calls in flight.
///
/// Output order follows input order regardless of completion order. The
/// first error is returned as soon as it is observed; calls still in flight
/// are dropped rather than awaited. A concurrency of one processes the items
/// strictly one after another.
pub async fn map_bounded<I, T, E, F, Fut>(
    items: I,
    concurrency: NonZeroUsize,
    f: F,
) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut in_flight = std::pin::pin!(indexed(items, concurrency, f));
    let mut slots: Vec<Option<T>> = Vec::new();

    while let Some((index, result)) = in_flight.next().await {
        let value = result?;
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        slots[index] = Some(value);
    }

    Ok(slots.into_iter().flatten().collect())
}

/// Like [`map_bounded`], but runs every item and returns each result in input order.
pub async fn map_bounded_settled<I, T, E, F, Fut>(
    items: I,
    concurrency: NonZeroUsize,
    f: F,
) -> Vec<Result<T, E>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut results: Vec<(usize, Result<T, E>)> = indexed(items, concurrency, f).collect().await;
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

fn indexed<I, T, E, F, Fut>(
    items: I,
    concurrency: NonZeroUsize,
    mut f: F,
) -> impl futures::Stream<Item = (usize, Result<T, E>)>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    stream::iter(items.into_iter().enumerate())
        .map(move |(index, item)| {
            let call = f(item);
            async move { (index, call.await) }
        })
        .buffer_unordered(concurrency.get())
}
