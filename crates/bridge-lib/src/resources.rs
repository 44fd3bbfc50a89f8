//! Pod resource aggregation
//!
//! Translates container requests into the single chunk requested from the
//! batch scheduler. CPU is summed in millicores and truncated to whole cores;
//! memory is summed in mebibytes.

use crate::models::Pod;
use thiserror::Error;
use tracing::debug;

/// Errors raised for malformed quantities
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("malformed cpu quantity {value:?} in container {container}")]
    Cpu { container: String, value: String },

    #[error("malformed memory quantity {value:?} in container {container}")]
    Memory { container: String, value: String },

    #[error("resource request overflow in container {0}")]
    Overflow(String),
}

/// Aggregate request for one pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    pub ncpus: u64,
    pub mem_mb: u64,
}

impl ResourceRequest {
    /// Compute the aggregate request; any malformed quantity aborts the whole computation
    pub fn from_pod(pod: &Pod) -> Result<Self, QuantityError> {
        let mut millicores: u64 = 0;
        let mut mem_mb: u64 = 0;

        for container in &pod.spec.containers {
            if let Some(cpu) = container.request("cpu") {
                let value = parse_cpu_millis(cpu).ok_or_else(|| QuantityError::Cpu {
                    container: container.name.clone(),
                    value: cpu.to_string(),
                })?;
                millicores = millicores
                    .checked_add(value)
                    .ok_or_else(|| QuantityError::Overflow(container.name.clone()))?;
            }

            if let Some(memory) = container.request("memory") {
                match parse_memory_mebibytes(memory) {
                    MemoryQuantity::Mebibytes(value) => {
                        mem_mb = mem_mb
                            .checked_add(value)
                            .ok_or_else(|| QuantityError::Overflow(container.name.clone()))?;
                    }
                    MemoryQuantity::Unrecognized => {
                        debug!(
                            pod = %pod.name(),
                            container = %container.name,
                            memory = %memory,
                            "Skipping memory request with unrecognized unit"
                        );
                    }
                    MemoryQuantity::Malformed => {
                        return Err(QuantityError::Memory {
                            container: container.name.clone(),
                            value: memory.to_string(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            ncpus: millicores / 1000,
            mem_mb,
        })
    }

    /// Chunk specification handed to the batch scheduler
    pub fn select_spec(&self) -> String {
        format!("select=1:ncpus={}:mem={}MB", self.ncpus, self.mem_mb)
    }
}

/// Parse a CPU quantity into millicores: `250m`, `2` or `0.5`
pub fn parse_cpu_millis(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix('m') {
        return parse_digits(millis);
    }

    match value.split_once('.') {
        None => parse_digits(value)?.checked_mul(1000),
        Some((whole, fraction)) => {
            if fraction.is_empty() || fraction.len() > 3 {
                return None;
            }
            let whole = if whole.is_empty() { 0 } else { parse_digits(whole)? };
            let fraction = parse_digits(fraction)? * 10u64.pow(3 - fraction.len() as u32);
            whole.checked_mul(1000)?.checked_add(fraction)
        }
    }
}

enum MemoryQuantity {
    Mebibytes(u64),
    Unrecognized,
    Malformed,
}

fn parse_memory_mebibytes(value: &str) -> MemoryQuantity {
    let value = value.trim();
    let (digits, factor) = if let Some(d) = value.strip_suffix("Mi") {
        (d, 1)
    } else if let Some(d) = value.strip_suffix("Gi") {
        (d, 1024)
    } else {
        return MemoryQuantity::Unrecognized;
    };

    match parse_digits(digits).and_then(|v| v.checked_mul(factor)) {
        Some(v) => MemoryQuantity::Mebibytes(v),
        None => MemoryQuantity::Malformed,
    }
}

fn parse_digits(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Container, ResourceRequirements};

    fn pod_with(requests: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = "test-pod".to_string();
        for (i, (cpu, memory)) in requests.iter().enumerate() {
            let mut resources = ResourceRequirements::default();
            if !cpu.is_empty() {
                resources.requests.insert("cpu".into(), cpu.to_string());
            }
            if !memory.is_empty() {
                resources.requests.insert("memory".into(), memory.to_string());
            }
            pod.spec.containers.push(Container {
                name: format!("c{}", i),
                resources,
            });
        }
        pod
    }

    #[test]
    fn test_sub_core_requests_truncate_to_zero() {
        let pod = pod_with(&[("250m", "512Mi"), ("250m", "512Mi")]);
        let request = ResourceRequest::from_pod(&pod).unwrap();
        assert_eq!(request, ResourceRequest { ncpus: 0, mem_mb: 1024 });
        assert_eq!(request.select_spec(), "select=1:ncpus=0:mem=1024MB");
    }

    #[test]
    fn test_whole_core_requests_sum() {
        let pod = pod_with(&[("1000m", ""), ("2000m", "")]);
        let request = ResourceRequest::from_pod(&pod).unwrap();
        assert_eq!(request.ncpus, 3);
        assert_eq!(request.mem_mb, 0);
    }

    #[test]
    fn test_millicores_are_summed_before_truncation() {
        let pod = pod_with(&[("600m", ""), ("600m", "")]);
        assert_eq!(ResourceRequest::from_pod(&pod).unwrap().ncpus, 1);
    }

    #[test]
    fn test_cpu_quantity_forms() {
        assert_eq!(parse_cpu_millis("250m"), Some(250));
        assert_eq!(parse_cpu_millis("2"), Some(2000));
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_cpu_millis(".25"), Some(250));
        assert_eq!(parse_cpu_millis("1.5"), Some(1500));
        assert_eq!(parse_cpu_millis("abc"), None);
        assert_eq!(parse_cpu_millis("m"), None);
        assert_eq!(parse_cpu_millis("-1"), None);
        assert_eq!(parse_cpu_millis("1.2345"), None);
        assert_eq!(parse_cpu_millis("1."), None);
    }

    #[test]
    fn test_memory_units() {
        let pod = pod_with(&[("", "1Gi"), ("", "256Mi"), ("", "1000000Ki"), ("", "64M")]);
        let request = ResourceRequest::from_pod(&pod).unwrap();
        assert_eq!(request.mem_mb, 1024 + 256);
    }

    #[test]
    fn test_malformed_cpu_aborts() {
        let pod = pod_with(&[("500m", "128Mi"), ("lots", "128Mi")]);
        let err = ResourceRequest::from_pod(&pod).unwrap_err();
        assert_eq!(
            err,
            QuantityError::Cpu {
                container: "c1".into(),
                value: "lots".into()
            }
        );
    }

    #[test]
    fn test_malformed_memory_aborts() {
        let pod = pod_with(&[("500m", "12x4Mi")]);
        assert!(matches!(
            ResourceRequest::from_pod(&pod),
            Err(QuantityError::Memory { .. })
        ));
    }

    #[test]
    fn test_missing_requests_contribute_nothing() {
        let pod = pod_with(&[("", ""), ("", "")]);
        assert_eq!(
            ResourceRequest::from_pod(&pod).unwrap(),
            ResourceRequest::default()
        );
    }
}
