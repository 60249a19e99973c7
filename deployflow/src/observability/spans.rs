//! Span attributes and timing for pipeline runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

/// Attributes describing one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpanAttributes {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Run ID.
    pub run_id: Uuid,
    /// What started the run.
    pub trigger: Option<String>,
    /// Region the pipeline is homed in.
    pub home_region: Option<String>,
    /// Number of stages.
    pub stage_count: Option<usize>,
}

impl RunSpanAttributes {
    /// Creates attributes for run `run_id` of `pipeline_name`.
    #[must_use]
    pub fn new(pipeline_name: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            run_id,
            trigger: None,
            home_region: None,
            stage_count: None,
        }
    }

    /// Sets the trigger label.
    #[must_use]
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    /// Sets the home region.
    #[must_use]
    pub fn with_home_region(mut self, region: impl Into<String>) -> Self {
        self.home_region = Some(region.into());
        self
    }

    /// Sets the stage count.
    #[must_use]
    pub fn with_stage_count(mut self, count: usize) -> Self {
        self.stage_count = Some(count);
        self
    }

    /// Flattens to dotted attribute names.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();

        attrs.insert("pipeline.name".to_string(), self.pipeline_name.clone());
        attrs.insert("pipeline.run_id".to_string(), self.run_id.to_string());
        if let Some(ref v) = self.trigger {
            attrs.insert("pipeline.trigger".to_string(), v.clone());
        }
        if let Some(ref v) = self.home_region {
            attrs.insert("pipeline.home_region".to_string(), v.clone());
        }
        if let Some(v) = self.stage_count {
            attrs.insert("pipeline.stage_count".to_string(), v.to_string());
        }

        attrs
    }

    /// Opens an info-level span carrying these attributes.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "pipeline_run",
            pipeline = %self.pipeline_name,
            run_id = %self.run_id,
            trigger = self.trigger.as_deref().unwrap_or("unknown"),
        )
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}
