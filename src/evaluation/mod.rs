//! Evaluation: metrics, reports and checkpoint evaluation

pub mod evaluator;
pub mod metrics;

pub use evaluator::{evaluate_split, EvaluationArtifacts, EvaluationReport, Evaluator, SplitEvaluation};
pub use metrics::{
    argmax, top_k_correct, AccuracyTracker, ClassMetrics, ClassificationReport, ConfusionMatrix,
    RunningAverage,
};
