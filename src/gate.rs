use tokio::sync::{Semaphore, SemaphorePermit};

/// A single-permit lock which can be torn down for good.
///
/// Serializes listener closure against limit changes. Closing is one-way: once the permit has
/// been destroyed every [Gate::enter] fails immediately.
#[derive(Debug)]
pub(crate) struct Gate {
    permit: Semaphore,
}

/// Exclusive passage through an open [Gate]. Dropping it reopens the gate.
#[derive(Debug)]
pub(crate) struct Pass<'g> {
    permit: SemaphorePermit<'g>,
    gate: &'g Gate,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
        }
    }

    /// Wait for the permit. Returns `None` if the gate has been closed.
    pub(crate) async fn enter(&self) -> Option<Pass<'_>> {
        let permit = self.permit.acquire().await.ok()?;
        Some(Pass { permit, gate: self })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.permit.is_closed()
    }
}

impl Pass<'_> {
    /// Destroy the permit instead of releasing it.
    pub(crate) fn close_gate(self) {
        self.permit.forget();
        self.gate.permit.close();
    }
}
