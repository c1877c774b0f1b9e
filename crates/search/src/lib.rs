pub mod embedding;
pub mod error;
pub mod store;

pub use embedding::{
    embed_with_retry, truncate_for_embedding, EmbeddingBackend, EmbeddingClient, EmbeddingSink,
    HashEmbedder, HashEmbedderConfig, OpenAiEmbeddingClient, MAX_EMBED_CHARS,
};
pub use error::{Result, SearchError};
pub use store::{build_entries, FrameIndexEntry, IndexStore, MemoryIndex, SearchResult};
