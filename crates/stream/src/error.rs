use cosmos_common::CellCoord;

use crate::payload::ChildId;

/// Failure of a single generation task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),
    #[error("generator panicked: {0}")]
    Panicked(String),
    #[error("generation task was cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors surfaced by blocking stream manager operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("cell {coord} failed to generate")]
    Generation {
        coord: CellCoord,
        #[source]
        source: GenerationError,
    },
    #[error("child {id} failed to generate")]
    ChildGeneration {
        id: ChildId,
        #[source]
        source: GenerationError,
    },
    #[error("cell payload has no element for child {0}")]
    NoSuchElement(ChildId),
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosmos_octree::ElementId;

    #[test]
    fn messages_name_the_address() {
        let err = StreamError::Generation {
            coord: CellCoord::new(1, 2, 3),
            source: GenerationError::failed("boom"),
        };
        assert_eq!(err.to_string(), "cell #L0:(1, 2, 3) failed to generate");

        let id = ChildId::new(CellCoord::new(0, 0, 0), ElementId(4));
        assert!(StreamError::NoSuchElement(id).to_string().contains("#L0:(0, 0, 0)/4"));
    }

    #[test]
    fn source_is_preserved() {
        use std::error::Error;
        let err = StreamError::Generation {
            coord: CellCoord::default(),
            source: GenerationError::Panicked("oops".into()),
        };
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("generator panicked: oops"));
    }
}
