//! Node load scoring and capacity admission.

use crate::db::models::NodeMetrics;

const CPU_WEIGHT: f64 = 0.4;
const MEMORY_WEIGHT: f64 = 0.6;

/// Limits a node must stay under to accept another workspace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityThresholds {
    pub max_workspaces: u32,
    /// Rejects at or above this load average.
    pub cpu_threshold: f64,
    /// Rejects at or above this memory percentage.
    pub memory_threshold: f64,
}

impl Default for CapacityThresholds {
    fn default() -> Self {
        Self {
            max_workspaces: 10,
            cpu_threshold: 80.0,
            memory_threshold: 80.0,
        }
    }
}

/// Weighted load score; lower is less loaded. `None` without metrics.
///
/// Missing sub-fields count as zero. Scores above 100 are legitimate on
/// multi-core hosts.
pub fn score_node_load(metrics: Option<&NodeMetrics>) -> Option<f64> {
    let metrics = metrics?;
    let cpu = metrics.cpu_load_avg1.unwrap_or(0.0);
    let memory = metrics.memory_percent.unwrap_or(0.0);
    Some(CPU_WEIGHT * cpu + MEMORY_WEIGHT * memory)
}

/// Whether a node can take one more workspace.
///
/// Without metrics only the workspace count is checked.
pub fn node_has_capacity(
    metrics: Option<&NodeMetrics>,
    active_workspaces: u32,
    thresholds: &CapacityThresholds,
) -> bool {
    if active_workspaces >= thresholds.max_workspaces {
        return false;
    }
    let Some(metrics) = metrics else {
        return true;
    };
    if metrics.cpu_load_avg1.unwrap_or(0.0) >= thresholds.cpu_threshold {
        return false;
    }
    metrics.memory_percent.unwrap_or(0.0) < thresholds.memory_threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn metrics(cpu: f64, memory: f64) -> NodeMetrics {
        NodeMetrics {
            cpu_load_avg1: Some(cpu),
            memory_percent: Some(memory),
            disk_percent: None,
        }
    }

    #[test]
    fn test_score_weights() {
        assert_eq!(score_node_load(Some(&metrics(50.0, 80.0))), Some(68.0));
        assert_eq!(score_node_load(None), None);

        let memory_heavy = score_node_load(Some(&metrics(10.0, 90.0))).unwrap();
        let cpu_heavy = score_node_load(Some(&metrics(90.0, 10.0))).unwrap();
        assert!((memory_heavy - 58.0).abs() < 1e-9);
        assert!((cpu_heavy - 42.0).abs() < 1e-9);
        assert!(memory_heavy > cpu_heavy);
    }

    #[test]
    fn test_score_missing_fields_are_zero() {
        let partial = NodeMetrics {
            cpu_load_avg1: Some(100.0),
            ..Default::default()
        };
        assert_eq!(score_node_load(Some(&partial)), Some(40.0));
        assert_eq!(score_node_load(Some(&metrics(400.0, 0.0))), Some(160.0));
    }

    #[rstest]
    #[case(metrics(80.0, 10.0), false)]
    #[case(metrics(79.0, 10.0), true)]
    #[case(metrics(10.0, 80.0), false)]
    #[case(metrics(10.0, 79.0), true)]
    fn test_threshold_is_inclusive(#[case] m: NodeMetrics, #[case] expected: bool) {
        assert_eq!(
            node_has_capacity(Some(&m), 0, &CapacityThresholds::default()),
            expected
        );
    }

    #[test]
    fn test_workspace_count_limit() {
        let thresholds = CapacityThresholds::default();
        assert!(node_has_capacity(None, 9, &thresholds));
        assert!(!node_has_capacity(None, 10, &thresholds));
        assert!(!node_has_capacity(Some(&metrics(0.0, 0.0)), 10, &thresholds));
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = CapacityThresholds {
            max_workspaces: 2,
            cpu_threshold: 200.0,
            memory_threshold: 50.0,
        };
        assert!(node_has_capacity(Some(&metrics(150.0, 40.0)), 1, &thresholds));
        assert!(!node_has_capacity(Some(&metrics(150.0, 50.0)), 1, &thresholds));
        assert!(!node_has_capacity(None, 2, &thresholds));
    }
}
