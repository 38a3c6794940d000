use std::future::Future;

use anyhow::{anyhow, Result};

/// Run independent sub-query futures with bounded fan-out.
///
/// Tasks are admitted in waves of at most `limit`; the next wave starts
/// only after the whole active wave completes, so at no point do more
/// than `limit` tasks run. Each result lands in its index-addressed slot
/// (output order == input order) and a panicking worker is converted into
/// a per-item error instead of taking down the batch.
pub async fn run_batch<T, Fut>(tasks: Vec<Fut>, limit: usize) -> Vec<Result<T>>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let limit = limit.max(1);
    let total = tasks.len();
    let mut slots: Vec<Option<Result<T>>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);

    let mut wave: Vec<(usize, tokio::task::JoinHandle<Result<T>>)> = Vec::with_capacity(limit);
    for (idx, task) in tasks.into_iter().enumerate() {
        wave.push((idx, tokio::spawn(task)));
        let wave_full = wave.len() == limit || idx == total - 1;
        if !wave_full {
            continue;
        }
        for (slot_idx, handle) in wave.drain(..) {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    Err(anyhow!("worker panicked: {join_err}"))
                }
                Err(join_err) => Err(anyhow!("worker cancelled: {join_err}")),
            };
            slots[slot_idx] = Some(outcome);
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(anyhow!("worker produced no result"))))
        .collect()
}
