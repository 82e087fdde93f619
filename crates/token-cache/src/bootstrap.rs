//! First-run setup token support.
//!
//! Before any account exists, an operator needs one credential to create the
//! first one. [`BootstrapResolver`] wraps a real resolver and honors a
//! distinguished setup token until a [`ProvisioningProbe`] reports that the
//! system is provisioned. The transition is one-way and happens exactly once,
//! even when many first requests race on it.
//!
//! ```text
//! Uninitialized ──(probe says provisioned)──▶ Provisioned
//!      │                                          │
//!      └ setup token → bootstrap grant            └ every token → inner resolver
//! ```
//!
//! A grant issued while unprovisioned may stay cached for up to the positive
//! TTL after the transition; call [`TokenCache::invalidate`](crate::TokenCache::invalidate)
//! with the setup token to revoke it immediately.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use async_trait::async_trait;

use crate::{error::ResolveError, resolver::TokenResolver, types::ResolvedToken};

/// Reports whether first-run provisioning has completed.
#[async_trait]
pub trait ProvisioningProbe: Send + Sync {
    /// Returns `true` once the system no longer needs the setup token.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if provisioning state cannot be determined.
    async fn is_provisioned(&self) -> Result<bool, ResolveError>;
}

/// Provisioning state of a [`BootstrapResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// The setup token is honored.
    Uninitialized,
    /// The setup token is treated like any other token.
    Provisioned,
}

const UNINITIALIZED: u8 = 0;
const PROVISIONED: u8 = 1;

/// [`TokenResolver`] that honors a setup token until provisioning completes.
pub struct BootstrapResolver<R> {
    inner: R,
    probe: Arc<dyn ProvisioningProbe>,
    setup_token: String,
    grant: ResolvedToken,
    state: AtomicU8,
}

#[bon::bon]
impl<R: TokenResolver> BootstrapResolver<R> {
    /// Creates a resolver in the [`BootstrapState::Uninitialized`] state.
    ///
    /// # Arguments
    ///
    /// * `inner` - Resolver for every token other than an honored setup token.
    /// * `probe` - Decides when provisioning has completed.
    /// * `setup_token` - The distinguished first-run token.
    /// * `grant` - What the setup token resolves to. Its `expire` is forced to `0`.
    #[builder]
    pub fn new(
        inner: R,
        probe: Arc<dyn ProvisioningProbe>,
        #[builder(into)] setup_token: String,
        grant: ResolvedToken,
    ) -> Self {
        Self {
            inner,
            probe,
            setup_token,
            grant: ResolvedToken { expire: 0, ..grant },
            state: AtomicU8::new(UNINITIALIZED),
        }
    }

    /// Returns the current provisioning state.
    #[must_use]
    pub fn state(&self) -> BootstrapState {
        match self.state.load(Ordering::Acquire) {
            UNINITIALIZED => BootstrapState::Uninitialized,
            _ => BootstrapState::Provisioned,
        }
    }

    /// Moves to [`BootstrapState::Provisioned`].
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn mark_provisioned(&self) -> bool {
        let transitioned = self
            .state
            .compare_exchange(UNINITIALIZED, PROVISIONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if transitioned {
            tracing::info!("system provisioned; setup token no longer honored");
        }
        transitioned
    }

    /// Decides whether the setup token is still honored, transitioning if
    /// the probe says provisioning is done.
    async fn setup_token_honored(&self) -> Result<bool, ResolveError> {
        if self.state() == BootstrapState::Provisioned {
            return Ok(false);
        }
        if self.probe.is_provisioned().await? {
            self.mark_provisioned();
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl<R: TokenResolver> TokenResolver for BootstrapResolver<R> {
    async fn resolve(&self, token: &str) -> Result<Option<ResolvedToken>, ResolveError> {
        if token == self.setup_token && self.setup_token_honored().await? {
            tracing::debug!("setup token honored");
            return Ok(Some(self.grant.clone()));
        }
        self.inner.resolve(token).await
    }
}
