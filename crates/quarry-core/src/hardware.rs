//! Read-only hardware capability report and quantization sizing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accelerator {
    pub name: String,
    pub memory_gb: f64,
}

/// Capability snapshot produced by an external probe.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub ram_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator: Option<Accelerator>,
}

impl CapabilityReport {
    pub fn new(ram_gb: f64, vram_gb: Option<f64>) -> Self {
        Self {
            ram_gb,
            accelerator: vram_gb.filter(|v| *v > 0.0).map(|memory_gb| Accelerator {
                name: "gpu".into(),
                memory_gb,
            }),
        }
    }

    pub fn vram_gb(&self) -> f64 {
        self.accelerator.as_ref().map(|a| a.memory_gb).unwrap_or(0.0)
    }

    /// Largest parameter count (billions) worth offering on this machine.
    pub fn max_params_b(&self) -> f64 {
        let vram = self.vram_gb();
        let ram = self.ram_gb;
        if vram >= 24.0 {
            70.0
        } else if vram >= 16.0 {
            32.0
        } else if vram >= 12.0 {
            14.0
        } else if vram >= 8.0 {
            8.0
        } else if vram >= 6.0 {
            7.0
        } else if vram >= 4.0 {
            3.0
        } else if vram > 0.0 {
            1.7
        } else if ram >= 32.0 {
            8.0
        } else if ram >= 16.0 {
            4.0
        } else if ram >= 8.0 {
            1.7
        } else {
            0.6
        }
    }
}

const DEFAULT_BITS: f64 = 4.5;
const PREFERRED_QUANTS: [&str; 4] = ["Q4_K_M", "Q4_0", "Q5_K_M", "Q8_0"];

pub fn bits_per_param(quantization: &str) -> f64 {
    match quantization.to_ascii_lowercase().as_str() {
        "f32" => 32.0,
        "f16" => 16.0,
        "q2_k" => 2.5,
        "q3_k_s" => 3.0,
        "q3_k_m" => 3.5,
        "q3_k_l" => 3.75,
        "q4_0" | "q4_k_s" => 4.5,
        "q4_1" | "q4_k_m" => 5.0,
        "q5_0" | "q5_k_s" => 5.5,
        "q5_1" | "q5_k_m" => 6.0,
        "q6_k" => 6.5,
        "q8_0" => 8.5,
        "q8_1" => 9.0,
        _ => DEFAULT_BITS,
    }
}

/// Artifact size estimate in GB, including ~5% container overhead.
pub fn estimate_size_gb(params_b: f64, quantization: &str) -> f64 {
    params_b * bits_per_param(quantization) / 8.0 * 1.05
}

/// Runtime memory estimate: weights plus KV cache and buffers.
pub fn estimate_vram_gb(params_b: f64, quantization: &str) -> f64 {
    estimate_size_gb(params_b, quantization) * 1.3
}

/// How an acquisition request names its quantization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "label")]
pub enum QuantizationChoice {
    Exact(String),
    BestAvailable,
}

impl QuantizationChoice {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => QuantizationChoice::BestAvailable,
            Some(s) if s.eq_ignore_ascii_case("best") || s.eq_ignore_ascii_case("auto") => {
                QuantizationChoice::BestAvailable
            }
            Some(s) => QuantizationChoice::Exact(s.to_string()),
        }
    }
}

/// First of the preferred labels the entry offers, else its first label.
pub fn default_quantization(available: &[String]) -> String {
    for pref in PREFERRED_QUANTS {
        if let Some(q) = available.iter().find(|q| q.eq_ignore_ascii_case(pref)) {
            return q.clone();
        }
    }
    available
        .first()
        .cloned()
        .unwrap_or_else(|| PREFERRED_QUANTS[0].to_string())
}

/// Highest-quality label whose memory estimate fits 90% of accelerator memory,
/// else the smallest one. Without an accelerator the preference order applies.
pub fn best_quantization(
    available: &[String],
    params_b: f64,
    report: Option<&CapabilityReport>,
) -> String {
    let Some(report) = report.filter(|r| r.vram_gb() > 0.0) else {
        return default_quantization(available);
    };
    let budget = report.vram_gb() * 0.9;
    let fitting = available
        .iter()
        .filter(|q| estimate_vram_gb(params_b, q) <= budget)
        .max_by(|a, b| bits_per_param(a).total_cmp(&bits_per_param(b)));
    if let Some(q) = fitting {
        return q.clone();
    }
    available
        .iter()
        .min_by(|a, b| bits_per_param(a).total_cmp(&bits_per_param(b)))
        .cloned()
        .unwrap_or_else(|| PREFERRED_QUANTS[0].to_string())
}

/// Resolve a choice against the labels an entry offers, normalized to the
/// entry's spelling. `None` when an exact label is not offered.
pub fn resolve_quantization(
    available: &[String],
    params_b: f64,
    choice: &QuantizationChoice,
    report: Option<&CapabilityReport>,
) -> Option<String> {
    match choice {
        QuantizationChoice::Exact(label) => available
            .iter()
            .find(|q| q.eq_ignore_ascii_case(label))
            .cloned(),
        QuantizationChoice::BestAvailable if available.is_empty() => None,
        QuantizationChoice::BestAvailable => Some(best_quantization(available, params_b, report)),
    }
}
