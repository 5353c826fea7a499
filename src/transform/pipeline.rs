use std::sync::Arc;

use super::{SchemaSpec, TableData, Transform, TransformExt};
use crate::error::TabularError;
use crate::registry::TypeRegistry;

/// Transforms run one after another, each fed the previous one's output.
///
/// Adjacent stages must agree on schemas: stage `i`'s output schema equals
/// stage `i + 1`'s input schema. This is checked when the pipeline is built.
pub struct Pipeline {
    stages: Vec<Arc<dyn Transform>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Transform>>) -> Result<Self, TabularError> {
        if stages.is_empty() {
            return Err(TabularError::EmptyPipeline);
        }
        for (i, pair) in stages.windows(2).enumerate() {
            let output = pair[0].output_schema();
            let input = pair[1].input_schema();
            if output != input {
                return Err(TabularError::PipelineSchemaIncompatible {
                    upstream: i,
                    downstream: i + 1,
                    output_schema: output.to_string(),
                    input_schema: input.to_string(),
                });
            }
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Arc<dyn Transform>] {
        &self.stages
    }

    fn first(&self) -> &Arc<dyn Transform> {
        &self.stages[0]
    }

    fn last(&self) -> &Arc<dyn Transform> {
        &self.stages[self.stages.len() - 1]
    }
}

impl Transform for Pipeline {
    fn input_schema(&self) -> SchemaSpec {
        self.first().input_schema()
    }

    fn output_schema(&self) -> SchemaSpec {
        self.last().output_schema()
    }

    fn load_unchecked(&self) -> Result<TableData, TabularError> {
        self.first().load()
    }

    fn apply_unchecked(&self, data: TableData) -> Result<TableData, TabularError> {
        let mut data = data;
        for (i, stage) in self.stages.iter().enumerate() {
            log::debug!("Pipeline stage {} ({}) on {} rows", i, stage.name(), data.num_rows());
            data = stage.apply(data).map_err(|e| e.in_stage(i, &stage.name()))?;
        }
        Ok(data)
    }

    fn name(&self) -> String {
        let names: Vec<String> = self.stages.iter().map(|s| s.name()).collect();
        format!("Pipeline[{}]", names.join(" -> "))
    }

    fn registry(&self) -> Arc<TypeRegistry> {
        self.first().registry()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pipeline").field(&self.name()).finish()
    }
}
