//! Notification hook contract.
//!
//! After every (re)load the store relinks `live/` and reports the set of
//! hostnames whose link changed. Whatever reloads services (hook scripts,
//! a systemd reload, …) plugs in behind [`Notifier`]; the store itself only
//! logs notifier failures, it never propagates them.

use std::path::Path;

use anyhow::Result;
use tracing::info;

pub trait Notifier: Send + Sync {
    /// `event` names the cause (currently always `live-updated`),
    /// `state_dir` is the root of the state directory, `hostnames` the
    /// names whose `live/` link changed.
    fn notify(&self, event: &str, state_dir: &Path, hostnames: &[String]) -> Result<()>;
}

/// Default notifier: records the change in the log and nothing else.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &str, _state_dir: &Path, hostnames: &[String]) -> Result<()> {
        if !hostnames.is_empty() {
            info!(event, ?hostnames, "live certificates updated");
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every notification for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub calls: Mutex<Vec<Vec<String>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, _event: &str, _state_dir: &Path, hostnames: &[String]) -> Result<()> {
            self.calls.lock().unwrap().push(hostnames.to_vec());
            Ok(())
        }
    }
}
