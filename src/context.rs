//! Scoped execution context for network construction.
//!
//! Network construction draws its initial weights from the context that is
//! active on the current thread. [`ContextGuard::enter`] installs a context
//! and the guard puts the previous one back when dropped, on every exit path.

use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::SeedableRng;

/// State that network construction reads from its surroundings
#[derive(Debug)]
pub struct EngineContext {
    rng: StdRng,
}

impl EngineContext {
    pub fn seeded(seed: u64) -> Self {
        EngineContext { rng: StdRng::seed_from_u64(seed) }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

thread_local! {
    static CURRENT: RefCell<Option<EngineContext>> = RefCell::new(None);
}

/// Restores the previously active context when dropped
#[must_use = "the context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<EngineContext>,
}

impl ContextGuard {
    pub fn enter(context: EngineContext) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(context));
        ContextGuard { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

/// Runs `f` with the active context's generator, or with a freshly seeded
/// one from OS entropy when no context is active.
pub fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    CURRENT.with(|c| match c.borrow_mut().as_mut() {
        Some(context) => f(context.rng()),
        None => f(&mut StdRng::from_entropy()),
    })
}

pub fn is_active() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}
