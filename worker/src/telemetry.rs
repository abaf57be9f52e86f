use std::sync::Mutex;
use sysinfo::{CpuExt, System, SystemExt};

/// Lecturas de CPU y memoria del host, compartidas por los workers locales.
pub struct Telemetry {
    sys: Mutex<System>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new_all()),
        }
    }

    /// (cpu %, memoria usada en bytes)
    pub fn sample(&self) -> (f32, u64) {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu();
        sys.refresh_memory();
        (sys.global_cpu_info().cpu_usage(), sys.used_memory())
    }
}

/// Presupuesto por defecto del tier de memoria: la mitad de lo disponible.
pub fn memory_budget() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory() / 2
}

/// Nombre del host (sólo para mostrar).
pub fn hostname() -> String {
    hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}
