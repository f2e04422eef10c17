//! `chap-sha1` authentication state.

use iproto_protocol::auth::scramble;
use iproto_protocol::Request;
use parking_lot::Mutex;

/// Tracks which user the connection is authorized as.
#[derive(Default)]
pub(crate) struct Authenticator {
    user: Mutex<Option<String>>,
}

impl Authenticator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Builds the `IPROTO_AUTH` request, or `None` when the connection is
    /// already authorized as `user`.
    pub(crate) fn request(&self, salt: &[u8], user: &str, password: &str) -> Option<Request> {
        if self.user.lock().as_deref() == Some(user) {
            return None;
        }
        Some(Request::Auth {
            user: user.to_string(),
            scramble: scramble(salt, password),
        })
    }

    pub(crate) fn authorized(&self, user: &str) {
        *self.user.lock() = Some(user.to_string());
    }

    pub(crate) fn current(&self) -> Option<String> {
        self.user.lock().clone()
    }
}
