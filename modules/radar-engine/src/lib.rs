pub mod activity;
pub mod cancel;
pub mod clusterer;
pub mod embedder;
pub mod embedding_store;
pub mod interchange;
pub mod momentum;
pub mod normalizer;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod similarity;
pub mod tier;
pub mod union_find;

pub use activity::ActivityMatrix;
pub use cancel::CancelFlag;
pub use clusterer::{ClusterDraft, ClusterStats, Clusterer, ClusteringOutcome};
pub use embedder::{build_embedder, HashingEmbedder, OpenAiEmbedder};
pub use embedding_store::{Embedding, EmbeddingStats, EmbeddingStore};
pub use interchange::{read_csv, record_schema, write_csv, ClusterRecord};
pub use momentum::{MomentumTracker, Trajectory};
pub use normalizer::{normalize, DropReason, DroppedRow, NormalizedBatch};
pub use pipeline::{AnalysisRun, AnalysisStats, Analyzer};
pub use report::ReportSynthesizer;
pub use session::{AnalysisSession, ClusterRegistry, SessionSnapshot};
pub use tier::{classify, TierClassifier};
