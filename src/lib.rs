pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod media;
pub mod processor;
pub mod registry;
pub mod scheduler;
pub mod shop;
pub mod store;
pub mod web;
pub mod whatsapp;
pub mod workflows;

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn env_lock() -> MutexGuard<'static, ()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned")
    }
}
