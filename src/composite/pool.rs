//! # 有界 worker 池
//!
//! ## 设计思路
//!
//! 直接加载池与 HTML 渲染池共用同一个原语：固定数量的 worker 从共享队列领取任务，
//! 全部 join 后返回。结构化并发保证函数返回时不存在游离任务。
//!
//! ## 实现思路
//!
//! - 队列为 `Mutex<vec::IntoIter<T>>`，临界区只有一次 `next()`
//! - 每个任务与 `CancelToken::cancelled()` 竞争，取消后在途 future 被直接丢弃
//! - 取消后 worker 不再领取新任务
//! - 每个任务在独立 task 中运行，任务 panic 只计数，worker 继续消费队列

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::{JoinHandle, JoinSet};

use super::CancelToken;

/// 池运行摘要。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolReport {
    /// 实际启动的 worker 数。
    pub(crate) workers: usize,
    /// panic 的任务数，每个对应一个既未成功也未记录失败的元素。
    pub(crate) panicked: usize,
}

/// 离开作用域时中止任务，外层 future 被丢弃（超时）时不留下游离任务。
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 以最多 `workers` 个并发 worker 消费 `items`，每个元素调用一次 `job`。
///
/// `job` 自行负责把结果写入调用方的累加器。
pub(crate) async fn run_bounded<T, F, Fut>(
    label: &'static str,
    items: Vec<T>,
    workers: usize,
    cancel: &CancelToken,
    job: F,
) -> PoolReport
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if items.is_empty() {
        return PoolReport::default();
    }

    let worker_count = workers.max(1).min(items.len());
    let queue = Arc::new(Mutex::new(items.into_iter()));
    let job = Arc::new(job);
    let mut set = JoinSet::new();

    for worker_id in 0..worker_count {
        let queue = Arc::clone(&queue);
        let job = Arc::clone(&job);
        let cancel = cancel.clone();

        set.spawn(async move {
            let mut handled = 0usize;
            let mut panicked = 0usize;
            loop {
                if cancel.is_cancelled() {
                    log::debug!("🛑 [{}#{}] 收到取消信号，停止领取任务", label, worker_id);
                    break;
                }

                let next = match queue.lock() {
                    Ok(mut guard) => guard.next(),
                    Err(poisoned) => poisoned.into_inner().next(),
                };
                let Some(item) = next else {
                    break;
                };

                let mut task = AbortOnDrop(tokio::spawn((*job)(item)));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        log::debug!("🛑 [{}#{}] 在途任务已中止", label, worker_id);
                        break;
                    }
                    joined = &mut task.0 => match joined {
                        Ok(()) => handled += 1,
                        Err(err) if err.is_panic() => {
                            panicked += 1;
                            log::error!("❌ [{}#{}] 任务异常退出：{}", label, worker_id, err);
                        }
                        Err(err) => log::debug!("[{}#{}] 任务被中止：{}", label, worker_id, err),
                    },
                }
            }
            log::debug!(
                "[{}#{}] worker 退出，处理 {} 个任务，异常 {} 个",
                label,
                worker_id,
                handled,
                panicked
            );
            panicked
        });
    }

    let mut report = PoolReport {
        workers: worker_count,
        panicked: 0,
    };

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(panicked) => report.panicked += panicked,
            Err(err) => log::error!("❌ [{}] worker 异常退出：{}", label, err),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn every_item_is_handled_exactly_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let report = run_bounded("test", (0..50).collect(), 4, &CancelToken::new(), move |n: u32| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::task::yield_now().await;
                sink.lock().expect("sink lock").push(n);
            }
        })
        .await;

        let mut seen = seen.lock().expect("sink lock").clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
        assert_eq!(report.workers, 4);
        assert_eq!(report.panicked, 0);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_worker_count() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (active_c, peak_c) = (Arc::clone(&active), Arc::clone(&peak));

        run_bounded("test", vec![(); 24], 3, &CancelToken::new(), move |_| {
            let active = Arc::clone(&active_c);
            let peak = Arc::clone(&peak_c);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn worker_count_is_capped_by_item_count() {
        let report = run_bounded("test", vec![1, 2], 10, &CancelToken::new(), |_: i32| async {}).await;
        assert_eq!(report.workers, 2);

        let report = run_bounded("test", Vec::<i32>::new(), 10, &CancelToken::new(), |_| async {}).await;
        assert_eq!(report.workers, 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_and_stops_pulling() {
        let cancel = CancelToken::new();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (started_c, finished_c) = (Arc::clone(&started), Arc::clone(&finished));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            run_bounded("test", vec![(); 20], 2, &cancel, move |_| {
                let started = Arc::clone(&started_c);
                let finished = Arc::clone(&finished_c);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .await
        .expect("pool should drain promptly after cancellation");

        assert_eq!(report.workers, 2);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_siblings() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_c = Arc::clone(&count);

        let report = run_bounded("test", (0..10).collect(), 3, &CancelToken::new(), move |n: u32| {
            let count = Arc::clone(&count_c);
            async move {
                if n == 0 {
                    panic!("boom");
                }
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(report.panicked, 1);
        assert_eq!(count.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn every_panicking_job_is_counted_and_queue_still_drains() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_c = Arc::clone(&count);

        let report = run_bounded("test", (0..12).collect(), 2, &CancelToken::new(), move |n: u32| {
            let count = Arc::clone(&count_c);
            async move {
                if n % 2 == 0 {
                    panic!("boom {}", n);
                }
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(report.workers, 2);
        assert_eq!(report.panicked, 6);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }
}
