pub mod chunk;
pub mod detect;
pub mod embed;
pub mod index;
pub mod normalize;
pub mod retrieval;
pub mod store;
pub mod text;
pub mod workbook;

pub use chunk::{Chunk, ChunkKind, ChunkMeta, ChunkerOptions, chunk_id, chunk_workbook};
pub use detect::{CellKey, DetectOptions, DetectedRegion, detect_regions, is_formula, is_non_empty};
pub use embed::{Embedder, HashEmbedder, cosine, tokenize};
pub use index::{IndexOptions, IndexPhase, IndexProgress, IndexSummary, index_workbook};
pub use normalize::{NormalizedCell, SheetReader, normalize_raw, parse_sparse_key};
pub use retrieval::{SearchOptions, search_workbook_rag};
pub use store::{
    BinaryStorage, HashEntry, InMemoryVectorStore, ListFilter, MemoryBlob, PersistedVectorStore,
    QueryHit, RecordMetadata, VectorRecord, VectorStore,
};
pub use text::{TextOptions, chunk_to_text, format_cell_value};
pub use workbook::{CellSource, RawCell, RegionRef, Sheet, SheetCells, Workbook};

// Re-export for convenience
pub use sheetflow_common::{CancelToken, FlowError, FlowErrorKind, Rect, Value};
