use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifies one navigation generation. Transports poll it to abort early.
#[derive(Debug, Clone)]
pub struct CancelToken {
    generation: u64,
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Owner of the single current token.
#[derive(Debug)]
pub struct TokenSource {
    current: CancelToken,
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSource {
    pub fn new() -> Self {
        Self {
            current: CancelToken::new(1),
        }
    }

    pub fn current(&self) -> &CancelToken {
        &self.current
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current.generation == generation && !self.current.is_cancelled()
    }

    /// Cancels the current token and installs its successor.
    pub fn advance(&mut self) -> &CancelToken {
        self.current.cancel();
        self.current = CancelToken::new(self.current.generation + 1);
        &self.current
    }
}
