//! Credential state and the retry-without-credentials combinator
//!
//! The helper can authenticate with a cookie file. When the platform reports
//! the cookies as invalid, their use is suspended process-wide for a cooldown
//! and the call is retried once without them. Every helper call goes through
//! [`CredentialedHelper::run`] so that rule lives in one place.

use crate::resolver::helper::{HelperError, HelperInvocation, HelperOutput, MediaHelper};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Process-wide credential availability
pub struct CredentialState {
    cookies_path: Option<PathBuf>,
    suspend_for: Duration,
    suspended_until: Mutex<Option<Instant>>,
}

impl CredentialState {
    pub fn new(cookies_path: Option<PathBuf>, suspend_for: Duration) -> Self {
        Self {
            cookies_path,
            suspend_for,
            suspended_until: Mutex::new(None),
        }
    }

    /// No credentials configured at all
    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_remaining().is_some()
    }

    /// Time left on the current suspension
    pub fn suspension_remaining(&self) -> Option<Duration> {
        let until = (*self.suspended_until.lock())?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    pub fn suspend(&self) {
        *self.suspended_until.lock() = Some(Instant::now() + self.suspend_for);
        warn!(
            suspend_secs = self.suspend_for.as_secs(),
            "Helper credentials rejected upstream; suspending their use"
        );
    }

    /// Cookie file to attach to the next call, if any
    pub fn active_cookies(&self) -> Option<PathBuf> {
        if self.is_suspended() {
            return None;
        }
        self.cookies_path
            .as_ref()
            .filter(|path| path.is_file())
            .cloned()
    }
}

/// Whether helper diagnostics say the attached cookies were refused
pub fn is_credential_invalid(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("cookies")
        && (stderr.contains("no longer valid")
            || stderr.contains("have been rotated")
            || stderr.contains("invalid"))
}

/// A helper paired with the shared credential state
#[derive(Clone)]
pub struct CredentialedHelper {
    helper: Arc<dyn MediaHelper>,
    credentials: Arc<CredentialState>,
}

impl CredentialedHelper {
    pub fn new(helper: Arc<dyn MediaHelper>, credentials: Arc<CredentialState>) -> Self {
        Self {
            helper,
            credentials,
        }
    }

    pub fn credentials(&self) -> &CredentialState {
        &self.credentials
    }

    /// Run the helper, retrying once without credentials when they were
    /// attached and either the output reports them invalid (which also
    /// suspends them) or `retry_on` rejects the output
    pub async fn run<F>(
        &self,
        args: Vec<String>,
        timeout: Duration,
        retry_on: F,
    ) -> Result<HelperOutput, HelperError>
    where
        F: Fn(&HelperOutput) -> bool + Send,
    {
        let mut invocation = HelperInvocation {
            args,
            cookies: self.credentials.active_cookies(),
            timeout,
        };

        let result = self.helper.run(&invocation).await;
        if invocation.cookies.is_none() {
            return result;
        }

        let output = result?;
        if is_credential_invalid(&output.stderr) {
            self.credentials.suspend();
        } else if !retry_on(&output) {
            return Ok(output);
        }

        info!("Retrying helper call without credentials");
        invocation.cookies = None;
        self.helper.run(&invocation).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedHelper;
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const REJECTED: &str =
        "ERROR: The provided YouTube account cookies are no longer valid. They have likely been rotated";

    fn cookie_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# Netscape HTTP Cookie File").unwrap();
        file
    }

    #[test]
    fn test_credential_invalid_detection() {
        assert!(is_credential_invalid(REJECTED));
        assert!(!is_credential_invalid("ERROR: Video unavailable"));
    }

    #[test]
    fn test_missing_cookie_file_is_never_attached() {
        let state = CredentialState::new(
            Some(PathBuf::from("/nonexistent/cookies.txt")),
            Duration::from_secs(60),
        );
        assert!(state.active_cookies().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_expires_naturally() {
        let file = cookie_file();
        let state = CredentialState::new(Some(file.path().to_path_buf()), Duration::from_secs(60));
        assert!(state.active_cookies().is_some());

        state.suspend();
        assert!(state.active_cookies().is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!state.is_suspended());
        assert!(state.active_cookies().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_credentials_suspend_and_retry_once() {
        let file = cookie_file();
        let scripted = Arc::new(ScriptedHelper::new());
        scripted.push_ok(1, "", REJECTED);
        scripted.push_ok(0, "{}", "");

        let credentials = Arc::new(CredentialState::new(
            Some(file.path().to_path_buf()),
            Duration::from_secs(600),
        ));
        let helper = CredentialedHelper::new(scripted.clone(), credentials.clone());

        let output = helper
            .run(vec!["x".to_string()], Duration::from_secs(5), |_| false)
            .await
            .unwrap();

        assert!(output.success());
        let calls = scripted.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].cookies.is_some());
        assert!(calls[1].cookies.is_none());
        assert!(credentials.is_suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_credentials_are_not_attached() {
        let file = cookie_file();
        let scripted = Arc::new(ScriptedHelper::new());
        let credentials = Arc::new(CredentialState::new(
            Some(file.path().to_path_buf()),
            Duration::from_secs(600),
        ));
        credentials.suspend();
        let helper = CredentialedHelper::new(scripted.clone(), credentials);

        helper
            .run(Vec::new(), Duration::from_secs(5), |_| true)
            .await
            .unwrap();

        let calls = scripted.calls.lock();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].cookies.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_predicate_without_suspension() {
        let file = cookie_file();
        let scripted = Arc::new(ScriptedHelper::new());
        scripted.push_ok(1, "", "ERROR: something transient");
        scripted.push_ok(0, "ok", "");
        let credentials = Arc::new(CredentialState::new(
            Some(file.path().to_path_buf()),
            Duration::from_secs(600),
        ));
        let helper = CredentialedHelper::new(scripted.clone(), credentials.clone());

        let output = helper
            .run(Vec::new(), Duration::from_secs(5), |out| !out.success())
            .await
            .unwrap();

        assert_eq!(output.stdout, "ok");
        assert_eq!(scripted.call_count(), 2);
        assert!(!credentials.is_suspended());
    }

    #[tokio::test]
    async fn test_no_credentials_means_single_attempt() {
        let scripted = Arc::new(ScriptedHelper::new());
        scripted.push_ok(1, "", REJECTED);
        let helper =
            CredentialedHelper::new(scripted.clone(), Arc::new(CredentialState::disabled()));

        let output = helper
            .run(Vec::new(), Duration::from_secs(5), |_| true)
            .await
            .unwrap();

        assert!(!output.success());
        assert_eq!(scripted.call_count(), 1);
    }
}
