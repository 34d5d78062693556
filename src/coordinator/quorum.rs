use {
    crate::{RingError, RingResult},
    futures::{StreamExt, stream::FuturesUnordered},
    std::{future::Future, time::Duration},
    tokio::time::{Instant, timeout, timeout_at},
};

/// Runs a replica call, failing with [`RingError::Timeout`] past `limit`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = RingResult<T>>,
) -> RingResult<T> {
    timeout(limit, call).await.unwrap_or(Err(RingError::Timeout))
}

/// Drives replica calls until none is left, or until `grace` has passed
/// since the `quorum`-th success.
///
/// `handle` inspects every response, may queue follow-up calls (for example
/// a handoff write replacing a failed primary) and tells whether the
/// response counts as a success. Calls still outstanding when the grace
/// period ends are dropped. Returns the number of successes.
pub(crate) async fn gather<F, T>(
    mut pending: FuturesUnordered<F>,
    quorum: usize,
    grace: Duration,
    mut handle: impl FnMut(T, &mut FuturesUnordered<F>) -> bool,
) -> usize
where
    F: Future<Output = T>,
{
    let mut successes = 0;
    let mut deadline: Option<Instant> = None;
    loop {
        let next = match deadline {
            None => pending.next().await,
            Some(deadline) => match timeout_at(deadline, pending.next()).await {
                Ok(next) => next,
                Err(_) => break,
            },
        };
        let Some(response) = next else {
            break;
        };
        if handle(response, &mut pending) {
            successes += 1;
            if successes >= quorum && deadline.is_none() {
                deadline = Some(Instant::now() + grace);
            }
        }
    }
    successes
}

#[cfg(test)]
mod tests {
    use {super::*, std::pin::Pin};

    type Call = Pin<Box<dyn Future<Output = (u64, bool)>>>;

    fn call(delay_ms: u64, ok: bool) -> Call {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            (delay_ms, ok)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_grace() {
        let pending: FuturesUnordered<Call> =
            [call(10, true), call(20, true), call(5_000, true)].into_iter().collect();
        let started = Instant::now();
        let mut seen = Vec::new();
        let successes = gather(pending, 2, Duration::from_millis(100), |(delay, ok), _| {
            seen.push(delay);
            ok
        })
        .await;

        assert_eq!(successes, 2);
        assert_eq!(seen, vec![10, 20]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(120) && elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn follow_ups_count() {
        let pending: FuturesUnordered<Call> = [call(10, false), call(20, true)].into_iter().collect();
        let mut retried = false;
        let successes = gather(pending, 2, Duration::ZERO, |(_, ok), pending| {
            if !ok && !retried {
                retried = true;
                pending.push(call(30, true));
            }
            ok
        })
        .await;
        assert_eq!(successes, 2);

        let slow = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(slow, Err(RingError::Timeout)));
    }
}
