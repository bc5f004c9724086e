//! Per-operation context.
//!
//! Every public operation takes an [`OpCtx`] carrying the caller's
//! cancellation signal. Cancellation observed before commit rolls the
//! transaction back; commit itself is not interruptible.

use tokio_util::sync::CancellationToken;

use crate::error::{MemoryError, Result};

/// Context threaded through public operations.
#[derive(Debug, Clone, Default)]
pub struct OpCtx {
    cancel: CancellationToken,
}

impl OpCtx {
    /// A context that can only be cancelled via its token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token (e.g. one the service layer owns).
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out with `Cancelled` if the caller gave up.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(MemoryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ctx_is_live() {
        let ctx = OpCtx::new();
        assert!(!ctx.is_cancelled());
        ctx.check().unwrap();
    }

    #[test]
    fn test_cancelled_ctx_errors() {
        let token = CancellationToken::new();
        let ctx = OpCtx::with_token(token.clone());
        token.cancel();
        assert!(matches!(ctx.check(), Err(MemoryError::Cancelled)));
    }
}
