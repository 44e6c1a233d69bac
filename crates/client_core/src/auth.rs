use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use shared::{domain::Identity, error::ProviderError};

use crate::provider::IdentityProvider;

/// Authentication state as observed by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Loading,
    Authenticated(Identity),
    Error(String),
}

impl AuthState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }
}

/// What `register` does after reporting a password mismatch. Historically
/// both behaviors shipped, so the choice stays configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterPolicy {
    #[default]
    AbortOnMismatch,
    ContinueAfterMismatch,
}

const EMPTY_CREDENTIALS: &str = "Email or password can't be empty";
const PASSWORD_MISMATCH: &str = "Passwords don't match";
const GENERIC_FAILURE: &str = "Something went wrong";
const GOOGLE_FAILURE: &str = "Google sign in failed";

/// Drives the sign-in lifecycle against an [`IdentityProvider`] and exposes
/// it as a single observable [`AuthState`].
pub struct AuthController {
    provider: Arc<dyn IdentityProvider>,
    state: watch::Sender<AuthState>,
    register_policy: RegisterPolicy,
}

impl AuthController {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Arc<Self> {
        Self::with_register_policy(provider, RegisterPolicy::default())
    }

    pub fn with_register_policy(
        provider: Arc<dyn IdentityProvider>,
        register_policy: RegisterPolicy,
    ) -> Arc<Self> {
        let initial = match provider.current_session() {
            Some(identity) => AuthState::Authenticated(identity),
            None => AuthState::Unauthenticated,
        };
        let (state, _) = watch::channel(initial);
        Arc::new(Self {
            provider,
            state,
            register_policy,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Re-reads the backend session and maps it onto the observable.
    pub fn check_auth_status(&self) {
        let next = match self.provider.current_session() {
            Some(identity) => AuthState::Authenticated(identity),
            None => AuthState::Unauthenticated,
        };
        self.publish(next);
    }

    pub fn login(self: &Arc<Self>, email: &str, password: &str) {
        if email.is_empty() || password.is_empty() {
            self.publish(AuthState::Error(EMPTY_CREDENTIALS.to_owned()));
            return;
        }
        self.publish(AuthState::Loading);
        let controller = Arc::clone(self);
        let email = email.to_owned();
        let password = password.to_owned();
        tokio::spawn(async move {
            let outcome = controller.provider.sign_in(&email, &password).await;
            controller.finish(outcome, GENERIC_FAILURE);
        });
    }

    pub fn register(self: &Arc<Self>, email: &str, password: &str, confirm_password: &str) {
        if email.is_empty() || password.is_empty() {
            self.publish(AuthState::Error(EMPTY_CREDENTIALS.to_owned()));
            return;
        }
        if password != confirm_password {
            self.publish(AuthState::Error(PASSWORD_MISMATCH.to_owned()));
            if self.register_policy == RegisterPolicy::AbortOnMismatch {
                return;
            }
        }
        self.publish(AuthState::Loading);
        let controller = Arc::clone(self);
        let email = email.to_owned();
        let password = password.to_owned();
        tokio::spawn(async move {
            let outcome = controller.provider.create_account(&email, &password).await;
            controller.finish(outcome, GENERIC_FAILURE);
        });
    }

    /// Completes a Google sign-in from an id token obtained out of band.
    pub fn login_with_google(self: &Arc<Self>, id_token: &str) {
        self.publish(AuthState::Loading);
        let controller = Arc::clone(self);
        let id_token = id_token.to_owned();
        tokio::spawn(async move {
            let outcome = controller.provider.exchange_external_token(&id_token).await;
            controller.finish(outcome, GOOGLE_FAILURE);
        });
    }

    pub fn logout(&self) {
        if let Err(err) = self.provider.sign_out() {
            warn!("session invalidation failed, resetting local state anyway: {err}");
        }
        self.publish(AuthState::Unauthenticated);
    }

    fn finish(&self, outcome: Result<Identity, ProviderError>, fallback: &str) {
        match outcome {
            Ok(identity) => {
                info!(user_id = %identity.user_id, "authentication succeeded");
                self.publish(AuthState::Authenticated(identity));
            }
            Err(err) => {
                let mut message = err.to_string();
                if message.is_empty() {
                    message = fallback.to_owned();
                }
                warn!("authentication failed: {message}");
                self.publish(AuthState::Error(message));
            }
        }
    }

    fn publish(&self, next: AuthState) {
        self.state.send_replace(next);
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
