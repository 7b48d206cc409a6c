use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Source of free-memory readings used by memory-aware admission.
pub trait MemoryProbe: Send + Sync + std::fmt::Debug {
    /// Bytes currently available to new processes, or `None` when unknown.
    fn available_bytes(&self) -> Option<u64>;
}

/// Reads `MemAvailable` from `/proc/meminfo` on Linux; reports unknown elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    fn available_bytes(&self) -> Option<u64> {
        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string("/proc/meminfo") {
                Ok(text) => parse_meminfo(&text),
                Err(e) => {
                    debug!("Failed to read /proc/meminfo: {}", e);
                    None
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }
}

/// Extract `MemAvailable` (falling back to `MemFree`) in bytes.
pub fn parse_meminfo(text: &str) -> Option<u64> {
    let field = |name: &str| {
        text.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let mut parts = rest.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let scale = match parts.next() {
                Some("kB") | Some("KB") => 1024,
                Some("mB") | Some("MB") => 1024 * 1024,
                _ => 1,
            };
            Some(value * scale)
        })
    };
    field("MemAvailable").or_else(|| field("MemFree"))
}

/// Fixed reading, adjustable at runtime. Useful for hosts that meter memory themselves.
#[derive(Debug)]
pub struct FixedMemory {
    bytes: AtomicU64,
}

impl FixedMemory {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemory {
    fn available_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::Relaxed))
    }
}
