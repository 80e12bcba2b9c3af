use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use tracing::{error, info};

/// Runs `job` over `items` on at most `max_parallel` scoped worker threads.
///
/// Workers pull item indices from a shared queue and send results back over a
/// channel; `on_result` sees each result on the calling thread as it lands. A
/// panicking job is turned into a result with `on_panic` and does not stop the
/// other workers. Returns one result per item, in input order, once every item
/// has finished.
pub fn run_pool<T, R, F, P, O>(
    items: &[T],
    max_parallel: usize,
    job: F,
    on_panic: P,
    mut on_result: O,
) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
    P: Fn(&T, String) -> R + Sync,
    O: FnMut(&T, &R),
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = max_parallel.clamp(1, items.len());
    info!(items = items.len(), workers, "starting worker pool");

    let (queue_tx, queue_rx) = mpsc::channel::<usize>();
    for index in 0..items.len() {
        // the receiver outlives this loop, so the send cannot fail
        let _ = queue_tx.send(index);
    }
    drop(queue_tx);
    let queue = Mutex::new(queue_rx);

    let mut slots: Vec<Option<R>> = Vec::with_capacity(items.len());
    slots.resize_with(items.len(), || None);

    thread::scope(|scope| {
        let (result_tx, result_rx) = mpsc::channel::<(usize, R)>();
        for _ in 0..workers {
            let result_tx = result_tx.clone();
            let queue = &queue;
            let job = &job;
            let on_panic = &on_panic;
            scope.spawn(move || {
                while let Some(index) = next_index(queue) {
                    let item = &items[index];
                    let result = panic::catch_unwind(AssertUnwindSafe(|| job(item)))
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            error!(%message, "worker job panicked");
                            on_panic(item, message)
                        });
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for (index, result) in result_rx {
            on_result(&items[index], &result);
            slots[index] = Some(result);
        }
    });

    slots
        .into_iter()
        .zip(items)
        .map(|(slot, item)| slot.unwrap_or_else(|| on_panic(item, "worker exited".to_string())))
        .collect()
}

fn next_index(queue: &Mutex<mpsc::Receiver<usize>>) -> Option<usize> {
    let guard = match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.recv().ok()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn returns_results_in_input_order() {
        let items: Vec<u32> = (0..20).collect();
        let mut seen = 0;
        let results = run_pool(
            &items,
            4,
            |value| {
                thread::sleep(Duration::from_millis(u64::from(20 - value)));
                value * 2
            },
            |_, _| u32::MAX,
            |_, _| seen += 1,
        );
        assert_eq!(seen, 20);
        assert_eq!(results, (0..20).map(|v| v * 2).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_max_parallel() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<u32> = (0..16).collect();
        run_pool(
            &items,
            3,
            |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                active.fetch_sub(1, Ordering::SeqCst);
            },
            |_, _| (),
            |_, _| {},
        );
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn panics_become_results() {
        let items = vec!["ok", "boom", "ok"];
        let results = run_pool(
            &items,
            2,
            |item| {
                if *item == "boom" {
                    panic!("exploded on {item}");
                }
                Ok(item.len())
            },
            |_, message| Err(message),
            |_, _| {},
        );
        assert_eq!(results[0], Ok(2));
        assert_eq!(results[1], Err("exploded on boom".to_string()));
        assert_eq!(results[2], Ok(2));
    }
}
