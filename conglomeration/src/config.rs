use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::segment::SegmentKind;

/// Default number of segment proofs in flight per pool.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Resolved sizes and tunables for one pipeline run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of modules, i.e. the length of every per-module count vector.
    pub num_modules: usize,
    pub num_gl_segments: usize,
    pub num_lpp_segments: usize,
    /// Maximum number of GL segments proved at the same time.
    #[serde(default = "default_concurrency")]
    pub gl_concurrency: usize,
    /// Maximum number of LPP segments proved at the same time.
    #[serde(default = "default_concurrency")]
    pub lpp_concurrency: usize,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl PipelineConfig {
    pub fn standard(num_modules: usize, num_gl_segments: usize, num_lpp_segments: usize) -> Self {
        Self {
            num_modules,
            num_gl_segments,
            num_lpp_segments,
            gl_concurrency: DEFAULT_CONCURRENCY,
            lpp_concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn total_segments(&self) -> usize {
        self.num_gl_segments + self.num_lpp_segments
    }

    pub fn num_segments(&self, kind: SegmentKind) -> usize {
        match kind {
            SegmentKind::Gl => self.num_gl_segments,
            SegmentKind::Lpp => self.num_lpp_segments,
            SegmentKind::Conglomeration => 0,
        }
    }

    pub fn concurrency(&self, kind: SegmentKind) -> usize {
        match kind {
            SegmentKind::Gl => self.gl_concurrency,
            SegmentKind::Lpp => self.lpp_concurrency,
            SegmentKind::Conglomeration => 1,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.num_modules == 0 {
            return Err(PipelineError::Config("at least one module is required".into()));
        }
        if self.total_segments() == 0 {
            return Err(PipelineError::Config("no segments to prove".into()));
        }
        if self.gl_concurrency == 0 || self.lpp_concurrency == 0 {
            return Err(PipelineError::Config(
                "pool concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults_concurrency() -> anyhow::Result<()> {
        let config = PipelineConfig::from_json(
            r#"{"num_modules": 2, "num_gl_segments": 3, "num_lpp_segments": 2}"#,
        )?;
        assert_eq!(config, PipelineConfig::standard(2, 3, 2));
        assert_eq!(config.total_segments(), 5);
        Ok(())
    }

    #[test]
    fn rejects_degenerate_configs() {
        let mut config = PipelineConfig::standard(2, 3, 2);
        config.lpp_concurrency = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        assert!(PipelineConfig::standard(2, 0, 0).validate().is_err());
        assert!(PipelineConfig::standard(0, 1, 1).validate().is_err());
        assert!(PipelineConfig::from_json(
            r#"{
                "num_modules": 1,
                "num_gl_segments": 1,
                "num_lpp_segments": 1,
                "gl_concurrency": 0
            }"#
        )
        .is_err());
    }
}
