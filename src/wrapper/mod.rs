//! Per-plugin runtime adapters.
//!
//! A wrapper owns one plugin instance, registers its metric record, drives
//! its cadence and connects it to the runner's queues. Panics raised by the
//! plugin are recovered here and logged with the plugin description and the
//! stack captured at the panic site.

pub mod aggregator;
pub mod flusher;
pub mod input;
pub mod processor;
pub mod timer;

pub use aggregator::{AggregatorWrapperV1, AggregatorWrapperV2, BatchQueue, EventGroupQueue};
pub use flusher::{FlusherWrapperV1, FlusherWrapperV2};
pub use input::{
    InputCollector, GroupInputCollector, MetricWrapperV1, MetricWrapperV2, ServiceWrapperV1,
    ServiceWrapperV2,
};
pub use processor::{ProcessorWrapperV1, ProcessorWrapperV2};

use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use tracing::error;

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Chain a panic hook that stashes the panicking thread's stack. The unwind
/// is caught on the same thread, so the guard can pick it up afterwards.
fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let captured = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(captured));
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<String> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn report_panic(plugin: &str, payload: &(dyn Any + Send)) {
    let backtrace = take_backtrace().unwrap_or_else(|| "unavailable".to_string());
    error!(
        alarm = "PLUGIN_RUNTIME_ALARM",
        plugin = %plugin,
        panic = %panic_message(payload),
        backtrace = %backtrace,
        "plugin panicked"
    );
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Await a plugin future, turning a panic into `None` plus an alarm log.
pub(crate) async fn guard<F, T>(plugin: &str, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    install_backtrace_hook();
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Some(value),
        Err(payload) => {
            report_panic(plugin, payload.as_ref());
            None
        }
    }
}

/// Synchronous counterpart of [`guard`].
pub(crate) fn guard_sync<F, T>(plugin: &str, f: F) -> Option<T>
where
    F: FnOnce() -> T,
{
    install_backtrace_hook();
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            report_panic(plugin, payload.as_ref());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_recovers_async_panic() {
        let ok = guard("p", async { 3 }).await;
        assert_eq!(ok, Some(3));

        let recovered: Option<()> = guard("p", async { panic!("boom") }).await;
        assert!(recovered.is_none());
    }

    #[test]
    fn test_guard_sync_recovers_panic() {
        assert_eq!(guard_sync("p", || 1), Some(1));
        assert_eq!(guard_sync::<_, i32>("p", || panic!("boom")), None);
    }

    #[test]
    fn test_panic_stack_is_captured_and_consumed() {
        install_backtrace_hook();
        let caught = std::panic::catch_unwind(|| panic!("boom"));
        assert!(caught.is_err());
        let captured = take_backtrace().unwrap();
        assert!(!captured.is_empty());
        assert!(take_backtrace().is_none());

        // The guard consumes the stack it reports.
        assert_eq!(guard_sync::<_, i32>("p", || panic!("again")), None);
        assert!(take_backtrace().is_none());
    }
}
