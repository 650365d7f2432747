//! Per-run accumulation of phase results.

/// Output of one executed phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResult {
    pub text: String,
    pub steps_used: u32,
}

/// Phase results in execution order, for the lifetime of one run.
#[derive(Debug, Default)]
pub struct PipelineContext {
    results: Vec<PhaseResult>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: PhaseResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[PhaseResult] {
        &self.results
    }

    /// Text the next phase builds on; empty before any phase has run.
    pub fn previous_text(&self) -> &str {
        self.results.last().map(|r| r.text.as_str()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Total model turns across all phases.
    pub fn total_steps(&self) -> u32 {
        self.results.iter().map(|r| r.steps_used).sum()
    }

    /// The last phase's result, consuming the context.
    pub fn into_final(self) -> Option<PhaseResult> {
        self.results.into_iter().last()
    }
}
