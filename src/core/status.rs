use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide readiness flag consulted by the readiness check.
///
/// Set once the first configuration bundle is active, cleared again when the gateway
/// starts draining for a restart.
static READY: AtomicBool = AtomicBool::new(false);

/// Where the active configuration bundle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Yaml,
    Etcd,
    Admin,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Yaml => "yaml",
            ConfigSource::Etcd => "etcd",
            ConfigSource::Admin => "admin",
        }
    }
}

/// Mark the service as ready after a bundle has been applied.
pub fn mark_ready(source: ConfigSource) {
    if !READY.swap(true, Ordering::SeqCst) {
        log::info!(
            "Configuration loaded from {}, service is ready",
            source.as_str()
        );
    }
}

/// Take the service out of rotation, e.g. while draining.
pub fn mark_unready(reason: &str) {
    READY.store(false, Ordering::SeqCst);
    log::info!("Service marked not ready: {reason}");
}

pub fn is_ready() -> bool {
    READY.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Readiness is process-wide; serialize the tests that flip it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_mark_ready_then_unready() {
        let _guard = TEST_LOCK.lock().unwrap();
        mark_unready("test");
        assert!(!is_ready());
        mark_ready(ConfigSource::Yaml);
        assert!(is_ready());
        mark_unready("draining");
        assert!(!is_ready());
    }

    #[test]
    fn test_multiple_marks_stay_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        mark_unready("test");
        mark_ready(ConfigSource::Etcd);
        mark_ready(ConfigSource::Admin);
        assert!(is_ready());
    }
}
