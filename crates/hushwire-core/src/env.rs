//! Environment abstraction for deterministic testing.
//!
//! Decouples orchestration logic from system resources (time, randomness).
//! Production uses [`SystemEnv`]; tests and the simulation binary use
//! [`MockEnv`] with a fixed seed so nonces and ids are reproducible.
//!
//! The pairwise primitive draws its own key material from the OS RNG. Only
//! randomness generated by this crate (group seeds, nonces, salts, device ids)
//! flows through the environment.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Abstract environment providing time and randomness.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current time (monotonic).
    fn now(&self) -> std::time::Instant;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Returns a fixed-size array of random bytes.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// Production environment using system time and the OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. A client without working randomness cannot
/// produce nonces or session seeds safely.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

/// Seeded environment. Same seed, same byte sequence.
///
/// Clones share one RNG stream, so every component of one simulated device
/// draws from the same sequence.
#[derive(Clone)]
pub struct MockEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl MockEnv {
    /// Create an environment seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }
}

impl Environment for MockEnv {
    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_env_is_deterministic() {
        let a = MockEnv::with_seed(7);
        let b = MockEnv::with_seed(7);

        assert_eq!(a.random_array::<32>(), b.random_array::<32>());
        assert_eq!(a.random_array::<16>(), b.random_array::<16>());
    }

    #[test]
    fn mock_env_clones_share_stream() {
        let a = MockEnv::with_seed(7);
        let b = a.clone();

        assert_ne!(a.random_array::<16>(), b.random_array::<16>());
    }

    #[test]
    fn different_seeds_differ() {
        assert_ne!(
            MockEnv::with_seed(1).random_array::<32>(),
            MockEnv::with_seed(2).random_array::<32>()
        );
    }

    #[test]
    fn system_env_random_bytes_are_random() {
        let env = SystemEnv::new();
        assert_ne!(env.random_array::<32>(), env.random_array::<32>());
    }

    #[tokio::test]
    async fn system_env_sleep_works() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(20)).await;

        assert!(env.now() - start >= Duration::from_millis(20));
    }
}
