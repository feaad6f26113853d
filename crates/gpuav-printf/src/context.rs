use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::config::DebugPrintfConfig;
use crate::dispatch::DeviceDispatch;
use crate::report::{Diagnostic, Reporter};
use crate::stats::DebugPrintfStats;

/// State shared by every debug printf component of one device.
///
/// Once [`DeviceContext::abort`] has been called, every hook becomes a no-op for the rest of the
/// device's life. The abort is reported exactly once no matter how many threads trip it.
pub struct DeviceContext {
    pub dispatch: Arc<dyn DeviceDispatch>,
    pub config: DebugPrintfConfig,
    pub reporter: Reporter,
    pub stats: Arc<DebugPrintfStats>,
    aborted: AtomicBool,
}

impl DeviceContext {
    pub fn new(
        dispatch: Arc<dyn DeviceDispatch>,
        config: DebugPrintfConfig,
        reporter: Reporter,
    ) -> Self {
        Self {
            dispatch,
            config,
            reporter,
            stats: Arc::new(DebugPrintfStats::new()),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Disables debug printf for the device, reporting `diagnostic` if this is the first abort.
    pub fn abort(&self, diagnostic: Diagnostic) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(kind = ?diagnostic.kind, "debug printf disabled: {}", diagnostic.message);
        self.reporter.diagnostic(&diagnostic);
    }

    /// Reports a diagnostic, aborting first when its kind is fatal.
    pub fn report(&self, diagnostic: Diagnostic) {
        if diagnostic.kind.is_fatal() {
            self.abort(diagnostic);
        } else {
            self.reporter.diagnostic(&diagnostic);
        }
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("config", &self.config)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}
