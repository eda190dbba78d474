use crate::runtime::PoolKind;

/// Timing of one stage within one pipeline run.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub kind: &'static str,
    pub affinity: PoolKind,
    pub duration_ms: u128,
}

/// Timing of one pipeline run, source resolution included.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub source_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    /// Duration of the first stage of the given kind.
    pub fn stage_duration_ms(&self, kind: &str) -> Option<u128> {
        self.stages
            .iter()
            .find(|stage| stage.kind == kind)
            .map(|stage| stage.duration_ms)
    }

    /// Pools the run's stages executed on, in order.
    pub fn affinities(&self) -> Vec<PoolKind> {
        self.stages.iter().map(|stage| stage.affinity).collect()
    }
}
