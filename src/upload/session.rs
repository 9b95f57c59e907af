/*!
 * Shared authenticated session for one upload run
 *
 * Every transfer asks the handle for the current token together with its
 * generation. When a transfer sees the session expire it calls
 * [`SessionHandle::refresh`] with the generation it used; only the first
 * caller for a given generation re-authenticates, later callers get the
 * token that caller obtained. Rejected credentials are remembered for the
 * rest of the run, so later units fail without logging in again.
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::{RemoteError, RemoteRepository, SessionToken};

#[derive(Debug, Default)]
struct TokenState {
    token: Option<SessionToken>,
    generation: u64,
    /// Status and message of a rejected login
    rejected: Option<(u16, String)>,
}

pub struct SessionHandle {
    remote: Arc<dyn RemoteRepository>,
    state: Mutex<TokenState>,
    authentications: AtomicU32,
}

impl SessionHandle {
    pub fn new(remote: Arc<dyn RemoteRepository>) -> Self {
        Self {
            remote,
            state: Mutex::new(TokenState::default()),
            authentications: AtomicU32::new(0),
        }
    }

    /// Current token and its generation, authenticating on first use
    pub async fn current(&self) -> Result<(SessionToken, u64), RemoteError> {
        let mut state = self.state.lock().await;
        if let Some(token) = &state.token {
            return Ok((token.clone(), state.generation));
        }
        self.authenticate(&mut state).await
    }

    /// Replace the token of generation `stale` with a fresh one. If another
    /// caller already refreshed it, return theirs.
    pub async fn refresh(&self, stale: u64) -> Result<(SessionToken, u64), RemoteError> {
        let mut state = self.state.lock().await;
        if state.generation != stale {
            if let Some(token) = &state.token {
                debug!(generation = state.generation, "session already refreshed");
                return Ok((token.clone(), state.generation));
            }
        }
        state.token = None;
        self.authenticate(&mut state).await
    }

    /// Number of authentications performed so far
    pub fn authentications(&self) -> u32 {
        self.authentications.load(Ordering::SeqCst)
    }

    async fn authenticate(&self, state: &mut TokenState) -> Result<(SessionToken, u64), RemoteError> {
        if let Some((status, message)) = &state.rejected {
            return Err(RemoteError::Authentication {
                status: *status,
                message: message.clone(),
            });
        }

        let token = match self.remote.authenticate().await {
            Ok(token) => token,
            Err(RemoteError::Authentication { status, message }) => {
                warn!(status, error = %message, "credentials rejected");
                state.rejected = Some((status, message.clone()));
                return Err(RemoteError::Authentication { status, message });
            }
            Err(e) => return Err(e),
        };
        self.authentications.fetch_add(1, Ordering::SeqCst);
        state.generation += 1;
        state.token = Some(token.clone());
        info!(generation = state.generation, "remote session established");
        Ok((token, state.generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::client::{ProcessingStatus, UploadReceipt, UploadTarget};
    use crate::upload::package::PackagingMethod;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingRemote {
        calls: AtomicU32,
        reject: bool,
    }

    #[async_trait]
    impl RemoteRepository for CountingRemote {
        async fn authenticate(&self) -> Result<SessionToken, RemoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.reject {
                return Err(RemoteError::Authentication {
                    status: 403,
                    message: "bad password".to_string(),
                });
            }
            Ok(SessionToken::new(format!("token-{n}")))
        }

        async fn upload(
            &self,
            _token: &SessionToken,
            _target: &UploadTarget,
            _archive: &Path,
            _method: PackagingMethod,
        ) -> Result<UploadReceipt, RemoteError> {
            Ok(UploadReceipt { confirmed: true })
        }

        async fn processing_status(
            &self,
            _token: &SessionToken,
            _target: &UploadTarget,
        ) -> Result<ProcessingStatus, RemoteError> {
            Ok(ProcessingStatus::Complete)
        }
    }

    #[tokio::test]
    async fn test_lazy_authentication() {
        let handle = SessionHandle::new(Arc::new(CountingRemote::default()));
        assert_eq!(handle.authentications(), 0);
        let (first, gen) = handle.current().await.unwrap();
        let (second, _) = handle.current().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gen, 1);
        assert_eq!(handle.authentications(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_authenticates_once() {
        let handle = Arc::new(SessionHandle::new(Arc::new(CountingRemote::default())));
        let (_, gen) = handle.current().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = Arc::clone(&handle);
            tasks.push(tokio::spawn(async move { handle.refresh(gen).await }));
        }
        let mut tokens = Vec::new();
        for task in tasks {
            tokens.push(task.await.unwrap().unwrap());
        }

        assert_eq!(handle.authentications(), 2);
        assert!(tokens.iter().all(|(t, g)| t.value() == "token-2" && *g == 2));
    }

    #[tokio::test]
    async fn test_rejected_login_is_not_repeated() {
        let remote = Arc::new(CountingRemote {
            reject: true,
            ..Default::default()
        });
        let handle = SessionHandle::new(Arc::clone(&remote) as Arc<dyn RemoteRepository>);

        for _ in 0..3 {
            let err = handle.current().await.unwrap_err();
            assert!(err.is_auth_error());
        }
        assert!(handle.refresh(0).await.unwrap_err().is_auth_error());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.authentications(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_is_not_remembered() {
        struct FlakyRemote(AtomicU32);

        #[async_trait]
        impl RemoteRepository for FlakyRemote {
            async fn authenticate(&self) -> Result<SessionToken, RemoteError> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(RemoteError::Connection("refused".to_string()));
                }
                Ok(SessionToken::new("token"))
            }

            async fn upload(
                &self,
                _token: &SessionToken,
                _target: &UploadTarget,
                _archive: &Path,
                _method: PackagingMethod,
            ) -> Result<UploadReceipt, RemoteError> {
                Ok(UploadReceipt { confirmed: true })
            }

            async fn processing_status(
                &self,
                _token: &SessionToken,
                _target: &UploadTarget,
            ) -> Result<ProcessingStatus, RemoteError> {
                Ok(ProcessingStatus::Complete)
            }
        }

        let handle = SessionHandle::new(Arc::new(FlakyRemote(AtomicU32::new(0))));
        assert!(handle.current().await.is_err());
        assert!(handle.current().await.is_ok());
    }
}
