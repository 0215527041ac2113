use std::sync::{
    atomic::{self, AtomicUsize},
    Arc,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The most tokens a jar will ever hold, and so the highest accepted connection limit.
///
/// `2^31 - 1`, or less where the platform's semaphores cannot count that high.
pub const MAX_CONNS: usize = if Semaphore::MAX_PERMITS < 0x7fff_ffff {
    Semaphore::MAX_PERMITS
} else {
    0x7fff_ffff
};

/// A resizable pool of interchangeable admission tokens.
///
/// Resting tokens are the semaphore's available permits. Only the coordinator adds or removes
/// tokens; everything else takes them and gives them back via [Token].
#[derive(Debug, Clone)]
pub(crate) struct Jar {
    tokens: Arc<Semaphore>,
    /// Tokens currently held outside the jar.
    held: Arc<AtomicUsize>,
}

/// An admission token taken from a [Jar].
///
/// Goes back in the jar when dropped.
#[derive(Debug)]
pub(crate) struct Token {
    _permit: OwnedSemaphorePermit,
    held: Arc<AtomicUsize>,
}

impl Jar {
    pub(crate) fn new() -> Self {
        Self {
            tokens: Arc::new(Semaphore::new(0)),
            held: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a token, waiting for one to rest in the jar.
    ///
    /// Returns `None` once the jar is closed.
    pub(crate) async fn take(&self) -> Option<Token> {
        let permit = Arc::clone(&self.tokens).acquire_owned().await.ok()?;
        Some(Token::new(permit, Arc::clone(&self.held)))
    }

    /// Add a brand new token.
    pub(crate) fn add(&self) {
        debug_assert!(self.occupancy() < MAX_CONNS);
        self.tokens.add_permits(1);
    }

    /// Wait for a resting token and destroy it.
    ///
    /// Returns `false` if the jar is closed. Cancel safe: nothing is removed unless this
    /// completes.
    pub(crate) async fn remove(&self) -> bool {
        match self.tokens.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// The number of tokens resting in the jar.
    pub(crate) fn occupancy(&self) -> usize {
        self.tokens.available_permits()
    }

    /// The number of tokens currently taken.
    pub(crate) fn held(&self) -> usize {
        self.held.load(atomic::Ordering::Acquire)
    }

    /// Close the jar for good. Every pending and future [Jar::take] returns `None`.
    pub(crate) fn close(&self) {
        self.tokens.close();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.tokens.is_closed()
    }
}

impl Token {
    fn new(permit: OwnedSemaphorePermit, held: Arc<AtomicUsize>) -> Self {
        held.fetch_add(1, atomic::Ordering::SeqCst);
        Self {
            _permit: permit,
            held,
        }
    }
}

impl Drop for Token {
    /// Puts the token back in the jar.
    fn drop(&mut self) {
        self.held.fetch_sub(1, atomic::Ordering::SeqCst);
    }
}
