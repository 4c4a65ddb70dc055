//! The reclaim worker
//!
//! One background thread per log. Each pass it closes an aged batching
//! window, runs the cache pressure checks, and dispatches pending array
//! write-outs. Head advancement itself happens inline in
//! `stripe_write_finished` as completions arrive; the worker is what keeps
//! the pipeline moving when no caller is pushing.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::log::LogInner;

/// Worker mailbox messages
pub(crate) enum WorkerMsg {
    /// Something changed; run a pass soon
    Wake,
    /// Stop after the current pass
    Shutdown,
}

/// Start the reclaim worker for `inner`
pub(crate) fn spawn(inner: Arc<LogInner>, rx: Receiver<WorkerMsg>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("stripecache-reclaim".into())
        .spawn(move || run(inner, rx))
        .expect("failed to spawn reclaim worker")
}

fn run(inner: Arc<LogInner>, rx: Receiver<WorkerMsg>) {
    let tick = Duration::from_millis(inner.config.worker_tick_ms);
    debug!("reclaim worker started");
    loop {
        match rx.recv_timeout(tick) {
            Ok(WorkerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(WorkerMsg::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
        // Coalesce a burst of wake-ups into one pass.
        let mut stop = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, WorkerMsg::Shutdown) {
                stop = true;
                break;
            }
        }
        service(&inner);
        if stop {
            break;
        }
    }
    debug!("reclaim worker stopped");
}

/// One maintenance pass
fn service(inner: &LogInner) {
    // Close the batching window once it has aged past the configured
    // latency budget.
    {
        let mut state = inner.state.lock();
        if state.quiesced {
            return;
        }
        let window = Duration::from_millis(inner.config.batch_window_ms);
        if state.builder.age().is_some_and(|age| age >= window) {
            let outcome = inner.close_window_locked(&mut state);
            drop(state);
            let _ = inner.run_window_callouts(outcome);
        }
    }

    // Cache pressure: free write-outs first, then the watermark, then
    // head-pinning stripes if the ring itself is running out.
    inner.check_cached_full_stripe();
    inner.check_cache_usage();
    inner.check_ring_pressure();

    // Dispatch array write-outs for durable records.
    loop {
        let stripe = {
            let mut state = inner.state.lock();
            if state.quiesced {
                return;
            }
            state.writeout_queue.pop_front()
        };
        let Some(stripe) = stripe else { break };
        if let Err(e) = inner.array.writeout(&stripe) {
            warn!(
                sector = stripe.sector(),
                error = %e,
                "array write-out failed, will retry"
            );
            inner.state.lock().writeout_queue.push_front(stripe);
            break;
        }
    }
}
