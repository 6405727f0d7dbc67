use crate::access::gate::OwnedByChatbot;
use crate::access::{ChunkAccessGate, Principal};
use crate::db::{DBConnection, DBError};
use crate::ingest::embedding::{deserialize_f32_le, Embedder, EmbeddingError};
use crate::models::chatbots::Chatbot;
use crate::models::document_chunks::DocumentChunk;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const CACHE_MAX_CHATBOTS: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub const MAX_TOP_K: usize = 50;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Database error: {0}")]
    Database(#[from] DBError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSearchResult {
    pub chunk_id: Uuid,
    pub chatbot_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub score: f32,
    pub token_count: i32,
}

#[derive(Debug, Clone)]
pub struct CachedChunk {
    pub uuid: Uuid,
    pub chatbot_id: i64,
    pub chunk_index: i32,
    pub content: Arc<str>,
    pub vector: Vec<f32>,
    pub token_count: i32,
}

impl OwnedByChatbot for CachedChunk {
    fn chatbot_id(&self) -> i64 {
        self.chatbot_id
    }
}

impl CachedChunk {
    fn from_row(chunk: DocumentChunk) -> Option<Self> {
        let Some(vector) = deserialize_f32_le(&chunk.embedding) else {
            warn!("Chunk {} has a malformed embedding; skipping", chunk.uuid);
            return None;
        };
        Some(CachedChunk {
            uuid: chunk.uuid,
            chatbot_id: chunk.chatbot_id,
            chunk_index: chunk.chunk_index,
            content: Arc::from(chunk.content),
            vector,
            token_count: chunk.token_count,
        })
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    loaded_at: Instant,
    chunks: Arc<Vec<CachedChunk>>,
}

/// LRU + TTL cache of decoded chunks per chatbot.
///
/// Holds data only; it never answers an access question. Callers run the
/// [`ChunkAccessGate`] on every request before and after using it.
#[derive(Debug)]
pub struct ChunkCache {
    max_chatbots: usize,
    ttl: Duration,
    entries: HashMap<i64, CacheEntry>,
    lru: VecDeque<i64>,
}

pub type SharedChunkCache = Arc<Mutex<ChunkCache>>;

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(CACHE_MAX_CHATBOTS, CACHE_TTL)
    }
}

impl ChunkCache {
    pub fn new(max_chatbots: usize, ttl: Duration) -> Self {
        Self {
            max_chatbots,
            ttl,
            entries: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    pub fn evict_chatbot(&mut self, chatbot_id: i64) {
        self.entries.remove(&chatbot_id);
        self.lru.retain(|c| *c != chatbot_id);
    }

    pub fn get(&mut self, chatbot_id: i64) -> Option<Arc<Vec<CachedChunk>>> {
        self.evict_expired();

        let (loaded_at, chunks) = {
            let entry = self.entries.get(&chatbot_id)?;
            (entry.loaded_at, entry.chunks.clone())
        };

        if loaded_at.elapsed() > self.ttl {
            self.evict_chatbot(chatbot_id);
            return None;
        }

        self.touch(chatbot_id);
        Some(chunks)
    }

    pub fn put(&mut self, chatbot_id: i64, chunks: Arc<Vec<CachedChunk>>) {
        self.entries.insert(
            chatbot_id,
            CacheEntry {
                loaded_at: Instant::now(),
                chunks,
            },
        );
        self.touch(chatbot_id);

        while self.entries.len() > self.max_chatbots {
            if let Some(lru_chatbot) = self.lru.pop_back() {
                self.entries.remove(&lru_chatbot);
            } else {
                break;
            }
        }
    }

    fn touch(&mut self, chatbot_id: i64) {
        self.lru.retain(|c| *c != chatbot_id);
        self.lru.push_front(chatbot_id);
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        let expired: Vec<i64> = self
            .entries
            .iter()
            .filter_map(|(chatbot_id, entry)| {
                if entry.loaded_at.elapsed() > ttl {
                    Some(*chatbot_id)
                } else {
                    None
                }
            })
            .collect();

        for chatbot_id in expired {
            self.evict_chatbot(chatbot_id);
        }
    }
}

/// Returns `None` on a dimension mismatch.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

#[derive(Debug, Clone)]
struct HeapItem<'a> {
    score: f32,
    chunk: &'a CachedChunk,
}

impl Eq for HeapItem<'_> {}

impl PartialEq for HeapItem<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for HeapItem<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.chunk.token_count.cmp(&self.chunk.token_count))
    }
}

impl PartialOrd for HeapItem<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn top_k_candidates<'a>(
    query: &[f32],
    chunks: impl IntoIterator<Item = &'a CachedChunk>,
    top_k: usize,
) -> Vec<HeapItem<'a>> {
    let mut heap: BinaryHeap<std::cmp::Reverse<HeapItem<'a>>> = BinaryHeap::new();

    for chunk in chunks {
        let Some(score) = cosine_similarity(query, &chunk.vector) else {
            continue;
        };
        let item = HeapItem { score, chunk };

        if heap.len() < top_k {
            heap.push(std::cmp::Reverse(item));
            continue;
        }

        if let Some(std::cmp::Reverse(min)) = heap.peek() {
            if item.cmp(min) == Ordering::Greater {
                heap.pop();
                heap.push(std::cmp::Reverse(item));
            }
        }
    }

    let mut out: Vec<HeapItem<'a>> = heap.into_iter().map(|r| r.0).collect();
    out.sort_by(|a, b| b.cmp(a));
    out
}

fn apply_token_budget(results: Vec<ChunkSearchResult>, budget: i32) -> Vec<ChunkSearchResult> {
    let mut total: i32 = 0;
    let mut limited: Vec<ChunkSearchResult> = Vec::new();
    for r in results {
        if total + r.token_count > budget {
            break;
        }
        total += r.token_count;
        limited.push(r);
    }
    limited
}

async fn load_chunks<D>(
    db: &D,
    cache: &SharedChunkCache,
    principal: &Principal,
    chatbot_id: i64,
) -> Result<Arc<Vec<CachedChunk>>, DBError>
where
    D: DBConnection + ?Sized,
{
    if let Some(hit) = cache.lock().await.get(chatbot_id) {
        return Ok(hit);
    }

    let rows = db.list_readable_chunks_for_chatbots(principal, &[chatbot_id])?;
    let loaded: Arc<Vec<CachedChunk>> =
        Arc::new(rows.into_iter().filter_map(CachedChunk::from_row).collect());
    debug!("Loaded {} chunks for chatbot {}", loaded.len(), chatbot_id);

    // An empty set may come from a visibility change racing this read.
    if !loaded.is_empty() {
        cache.lock().await.put(chatbot_id, loaded.clone());
    }
    Ok(loaded)
}

/// Ranks the readable chunks of `chatbots` against `query`.
///
/// Every candidate passes through a request-scoped [`ChunkAccessGate`], so cached
/// chunks are only returned to principals who may read their chatbot right now.
#[allow(clippy::too_many_arguments)]
pub async fn search_chunks<D>(
    db: &D,
    embedder: &dyn Embedder,
    cache: &SharedChunkCache,
    principal: Principal,
    chatbots: &[Chatbot],
    query: &str,
    top_k: usize,
    max_tokens: Option<i32>,
) -> Result<Vec<ChunkSearchResult>, RagError>
where
    D: DBConnection + ?Sized,
{
    let top_k = top_k.clamp(1, MAX_TOP_K);
    let mut gate = ChunkAccessGate::new(db, principal);

    let mut seen = HashSet::new();
    let mut readable: HashMap<i64, Uuid> = HashMap::new();
    for chatbot in chatbots.iter().filter(|c| seen.insert(c.id)) {
        if gate.can_read_chatbot(chatbot)? {
            readable.insert(chatbot.id, chatbot.uuid);
        }
    }
    if readable.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = embedder.embed(query).await?;

    let mut pool: Vec<CachedChunk> = Vec::new();
    for chatbot_id in readable.keys() {
        let chunks = load_chunks(db, cache, &principal, *chatbot_id).await?;
        pool.extend(chunks.iter().cloned());
    }
    let pool = gate.retain_readable(pool)?;

    let mut results: Vec<ChunkSearchResult> = top_k_candidates(&query_vec, &pool, top_k)
        .into_iter()
        .filter_map(|c| {
            let chatbot_uuid = readable.get(&c.chunk.chatbot_id)?;
            Some(ChunkSearchResult {
                chunk_id: c.chunk.uuid,
                chatbot_id: *chatbot_uuid,
                chunk_index: c.chunk.chunk_index,
                content: c.chunk.content.to_string(),
                score: c.score,
                token_count: c.chunk.token_count,
            })
        })
        .collect();

    if let Some(budget) = max_tokens {
        results = apply_token_budget(results, budget);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use crate::ingest::embedding::fake::FakeEmbedder;
    use crate::ingest::embedding::serialize_f32_le;
    use crate::models::chatbots::{NewChatbot, Visibility};
    use crate::models::document_chunks::NewDocumentChunk;
    use crate::models::documents::NewDocument;

    #[test]
    fn chunk_cache_evicts_lru_and_on_demand() {
        let mut cache = ChunkCache::new(2, Duration::from_secs(60));
        cache.put(1, Arc::new(vec![]));
        cache.put(2, Arc::new(vec![]));
        cache.get(1);
        cache.put(3, Arc::new(vec![]));

        assert!(cache.entries.contains_key(&1));
        assert!(!cache.entries.contains_key(&2));
        assert!(cache.entries.contains_key(&3));

        cache.evict_chatbot(1);
        assert!(cache.get(1).is_none());
        assert!(!cache.lru.contains(&1));
    }

    fn seed_chatbot(
        db: &MemoryDb,
        embedder: &FakeEmbedder,
        owner: Uuid,
        visibility: Visibility,
        texts: &[&str],
    ) -> Chatbot {
        let chatbot = db
            .create_chatbot(NewChatbot::new(owner, "bot", None, visibility))
            .unwrap();
        let doc = db
            .create_document(NewDocument::new(
                chatbot.id,
                owner,
                "doc.txt",
                "text/plain",
                texts.join("\n\n").into_bytes(),
            ))
            .unwrap();
        let chunks: Vec<NewDocumentChunk> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| NewDocumentChunk {
                uuid: Uuid::new_v4(),
                chatbot_id: chatbot.id,
                document_id: doc.id,
                chunk_index: i as i32,
                content: t.to_string(),
                embedding: serialize_f32_le(&embedder.vector_for(t)),
                embedding_model: "fake-embed".to_string(),
                vector_dim: 16,
                token_count: 3,
                source_hash: "fp".to_string(),
            })
            .collect();
        db.replace_document_chunks(doc.id, chatbot.id, "fp", &chunks)
            .unwrap();
        chatbot
    }

    #[tokio::test]
    async fn search_returns_only_chunks_of_readable_chatbots() {
        let db = MemoryDb::new();
        let embedder = FakeEmbedder::new(16);
        let cache: SharedChunkCache = Arc::new(Mutex::new(ChunkCache::default()));
        let owner = Uuid::new_v4();
        let reader = Principal::new(Uuid::new_v4());

        let public = seed_chatbot(
            &db,
            &embedder,
            owner,
            Visibility::Public,
            &["rust borrow checker"],
        );
        let private = seed_chatbot(
            &db,
            &embedder,
            owner,
            Visibility::Private,
            &["rust borrow secrets"],
        );

        let results = search_chunks(
            &db,
            &embedder,
            &cache,
            reader,
            &[public.clone(), private.clone()],
            "borrow checker",
            5,
            None,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chatbot_id, public.uuid);
        assert_eq!(results[0].content, "rust borrow checker");
    }

    #[tokio::test]
    async fn cached_chunks_still_pass_the_gate() {
        let db = MemoryDb::new();
        let embedder = FakeEmbedder::new(16);
        let cache: SharedChunkCache = Arc::new(Mutex::new(ChunkCache::default()));
        let owner = Principal::new(Uuid::new_v4());
        let stranger = Principal::new(Uuid::new_v4());

        let chatbot = seed_chatbot(
            &db,
            &embedder,
            owner.user_id,
            Visibility::Private,
            &["alpha beta"],
        );

        // Owner warms the cache.
        let bots = [chatbot.clone()];
        let owned = search_chunks(&db, &embedder, &cache, owner, &bots, "alpha", 5, None)
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert!(cache.lock().await.get(chatbot.id).is_some());

        let denied = search_chunks(&db, &embedder, &cache, stranger, &[chatbot], "alpha", 5, None)
            .await
            .unwrap();
        assert!(denied.is_empty());
    }

    #[tokio::test]
    async fn search_ranks_across_readable_chatbots_within_budget() {
        let db = MemoryDb::new();
        let embedder = FakeEmbedder::new(16);
        let cache: SharedChunkCache = Arc::new(Mutex::new(ChunkCache::default()));
        let owner = Uuid::new_v4();
        let reader = Principal::new(Uuid::new_v4());

        let shared = seed_chatbot(&db, &embedder, owner, Visibility::Shared, &["borrow checker"]);
        db.grant_permission(shared.id, reader.user_id, owner).unwrap();
        let public = seed_chatbot(
            &db,
            &embedder,
            owner,
            Visibility::Public,
            &["borrow checker lifetimes"],
        );
        let hidden = seed_chatbot(&db, &embedder, owner, Visibility::Shared, &["borrow checker"]);
        let bots = [public.clone(), hidden, shared.clone()];

        let ranked = search_chunks(&db, &embedder, &cache, reader, &bots, "borrow checker", 5, None)
            .await
            .unwrap();
        let sources: Vec<Uuid> = ranked.iter().map(|r| r.chatbot_id).collect();
        assert_eq!(sources, vec![shared.uuid, public.uuid]);
        assert!(ranked[0].score > ranked[1].score);

        // Each seeded chunk counts three tokens.
        let budgeted = search_chunks(
            &db,
            &embedder,
            &cache,
            reader,
            &bots,
            "borrow checker",
            5,
            Some(5),
        )
        .await
        .unwrap();
        assert_eq!(budgeted.len(), 1);
        assert_eq!(budgeted[0].chatbot_id, shared.uuid);
    }

    #[tokio::test]
    async fn revoked_grant_denies_cached_chunks() {
        let db = MemoryDb::new();
        let embedder = FakeEmbedder::new(16);
        let cache: SharedChunkCache = Arc::new(Mutex::new(ChunkCache::default()));
        let owner = Uuid::new_v4();
        let reader = Principal::new(Uuid::new_v4());

        let chatbot = seed_chatbot(&db, &embedder, owner, Visibility::Shared, &["alpha beta"]);
        db.grant_permission(chatbot.id, reader.user_id, owner).unwrap();
        let bots = [chatbot.clone()];

        let granted = search_chunks(&db, &embedder, &cache, reader, &bots, "alpha", 5, None)
            .await
            .unwrap();
        assert_eq!(granted.len(), 1);

        db.revoke_permission(chatbot.id, reader.user_id).unwrap();
        assert!(cache.lock().await.get(chatbot.id).is_some());
        let revoked = search_chunks(&db, &embedder, &cache, reader, &bots, "alpha", 5, None)
            .await
            .unwrap();
        assert!(revoked.is_empty());
    }
}
