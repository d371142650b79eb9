use quarry_core::CapabilityReport;
use sysinfo::System;

const VRAM_ENV: &str = "QUARRY_VRAM_GB";

/// System RAM from sysinfo; accelerator memory from `--vram-gb` or
/// `QUARRY_VRAM_GB`, since there is no portable GPU query.
pub fn detect(vram_override: Option<f64>) -> CapabilityReport {
    let mut sys = System::new();
    sys.refresh_memory();
    let ram_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
    let vram_gb = vram_override.or_else(vram_from_env);
    let report = CapabilityReport::new(ram_gb, vram_gb);
    tracing::debug!(
        ram_gb = format!("{:.1}", report.ram_gb),
        vram_gb = report.vram_gb(),
        "hardware probed"
    );
    report
}

fn vram_from_env() -> Option<f64> {
    std::env::var(VRAM_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn override_wins_over_env() {
        std::env::set_var(VRAM_ENV, "6");
        assert_eq!(detect(Some(12.0)).vram_gb(), 12.0);
        assert_eq!(detect(None).vram_gb(), 6.0);
        std::env::set_var(VRAM_ENV, "nonsense");
        assert_eq!(detect(None).vram_gb(), 0.0);
        std::env::remove_var(VRAM_ENV);
    }

    #[test]
    #[serial_test::serial]
    fn ram_is_reported() {
        std::env::remove_var(VRAM_ENV);
        let report = detect(None);
        assert!(report.ram_gb > 0.0);
        assert!(report.accelerator.is_none());
    }
}
