//! The error sink is the shared failure policy of the style and script
//! pipelines: a compile error is reported to the developer and swallowed, so
//! that a watch session survives a broken save and picks up the next one.

use std::process::{Command, Stdio};
use std::sync::Arc;

/// Something that can put a message in front of the developer.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Desktop notifications through the platform's command line tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    fn command(title: &str, message: &str) -> Option<Command> {
        if cfg!(target_os = "macos") {
            let quote = |s: &str| s.replace('\\', "\\\\").replace('"', "\\\"");
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                quote(message),
                quote(title)
            );

            let mut cmd = Command::new("osascript");
            cmd.arg("-e").arg(script);
            Some(cmd)
        } else if cfg!(unix) {
            let mut cmd = Command::new("notify-send");
            cmd.arg("--app-name=mintkit").arg(title).arg(message);
            Some(cmd)
        } else {
            None
        }
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, message: &str) {
        let Some(mut cmd) = Self::command(title, message) else {
            return;
        };

        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::debug!("notifier exited with {status}"),
            Err(e) => tracing::debug!("couldn't spawn notifier: {e}"),
        }
    }
}

#[derive(Clone)]
pub struct ErrorSink {
    notifier: Arc<dyn Notifier>,
}

impl ErrorSink {
    pub const TITLE: &'static str = "Compile Error";

    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn desktop() -> Self {
        Self::new(Arc::new(DesktopNotifier))
    }

    pub fn report(&self, task: &str, error: &anyhow::Error) {
        tracing::error!(task, "{error:#}");
        self.notifier.notify(Self::TITLE, &format!("{error:#}"));
    }

    /// Unwraps a successful result. A failure is reported and turned into
    /// `None`.
    pub fn absorb<T, E>(&self, task: &str, result: Result<T, E>) -> Option<T>
    where
        E: Into<anyhow::Error>,
    {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.report(task, &e.into());
                None
            }
        }
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::desktop()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Collects notifications instead of showing them.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) seen: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, message: &str) {
            self.seen
                .lock()
                .unwrap()
                .push((title.to_string(), message.to_string()));
        }
    }

    pub(crate) fn recording_sink() -> (ErrorSink, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        (ErrorSink::new(notifier.clone()), notifier)
    }

    #[test]
    fn test_absorb_ok_is_silent() {
        let (sink, notifier) = recording_sink();

        assert_eq!(sink.absorb::<_, anyhow::Error>("styles", Ok(3)), Some(3));
        assert!(notifier.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_absorb_err_notifies() {
        let (sink, notifier) = recording_sink();
        let result: Result<(), _> = Err(anyhow::anyhow!("expected \"}}\""));

        assert_eq!(sink.absorb("styles", result), None);

        let seen = notifier.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "Compile Error");
        assert!(seen[0].1.contains("expected"));
    }

    #[test]
    fn test_osascript_quoting() {
        if !cfg!(target_os = "macos") {
            return;
        }

        let cmd = DesktopNotifier::command("Compile Error", r#"bad "quote""#).unwrap();
        let script = cmd.get_args().nth(1).unwrap().to_str().unwrap().to_string();
        assert!(script.contains(r#"bad \"quote\""#));
    }
}
