//! Splitting a diagram selection into detection jobs.
//!
//! Chunks are plain order-preserving slices of the selection; their
//! boundaries carry no meaning. Each chunk gets a submission key (SHA-256 of
//! the sorted file ids, the entities and the match options) so that a chunk
//! whose job is still running is resumed instead of submitted twice.

use sha2::{Digest, Sha256};

use crate::api::DiagramApi;
use crate::error::PipelineError;
use crate::models::{DetectRequest, FileId, JobItem, ParsingJob};

pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// Options forwarded verbatim to every detection job of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectOptions {
    pub search_field: String,
    pub min_tokens: u32,
    pub partial_match: bool,
}

pub struct JobBatcher {
    chunk_size: usize,
}

impl JobBatcher {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Order-preserving chunks of at most `chunk_size` ids. Empty input yields
    /// no chunks.
    pub fn plan(&self, diagram_ids: &[FileId]) -> Vec<Vec<FileId>> {
        diagram_ids
            .chunks(self.chunk_size)
            .map(<[FileId]>::to_vec)
            .collect()
    }

    pub fn request_for(
        &self,
        chunk: &[FileId],
        entities: &[serde_json::Value],
        options: &DetectOptions,
    ) -> DetectRequest {
        DetectRequest {
            items: chunk.iter().map(|&file_id| JobItem { file_id }).collect(),
            entities: entities.to_vec(),
            search_field: options.search_field.clone(),
            min_tokens: options.min_tokens,
            partial_match: options.partial_match,
        }
    }
}

/// Fingerprint of a detection request; insensitive to item and entity order.
pub fn submission_key(request: &DetectRequest) -> String {
    let mut ids: Vec<FileId> = request.items.iter().map(|i| i.file_id).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut entities: Vec<String> = request.entities.iter().map(|e| e.to_string()).collect();
    entities.sort_unstable();

    let mut hasher = Sha256::new();
    for id in &ids {
        hasher.update(id.to_le_bytes());
    }
    hasher.update([0u8]);
    for e in &entities {
        hasher.update(e.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(request.search_field.as_bytes());
    hasher.update(request.min_tokens.to_le_bytes());
    hasher.update([request.partial_match as u8]);
    hex::encode(hasher.finalize())
}

/// A non-terminal job that already covers exactly this submission.
pub fn find_resumable<'a>(jobs: &'a [ParsingJob], key: &str) -> Option<&'a ParsingJob> {
    jobs.iter()
        .find(|j| !j.is_terminal() && j.submission_key == key)
}

#[derive(Debug)]
pub enum Submission {
    Created(ParsingJob),
    Resumed(u64),
}

impl Submission {
    pub fn job_id(&self) -> u64 {
        match self {
            Submission::Created(job) => job.job_id,
            Submission::Resumed(id) => *id,
        }
    }
}

/// Submit one chunk unless a live job already covers it.
pub async fn submit_chunk(
    api: &dyn DiagramApi,
    existing: &[ParsingJob],
    chunk: usize,
    request: &DetectRequest,
) -> Result<Submission, PipelineError> {
    let key = submission_key(request);
    if let Some(job) = find_resumable(existing, &key) {
        tracing::info!(chunk, job_id = job.job_id, "resuming running detection job");
        return Ok(Submission::Resumed(job.job_id));
    }

    let created = api
        .submit_detection(request)
        .await
        .map_err(|source| PipelineError::Submission { chunk, source })?;
    let file_ids: Vec<FileId> = request.items.iter().map(|i| i.file_id).collect();
    tracing::info!(chunk, job_id = created.job_id, files = file_ids.len(), "detection job submitted");
    Ok(Submission::Created(ParsingJob::new(
        created.job_id,
        created.status,
        &file_ids,
        key,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryApi;
    use crate::models::JobPhase;

    fn options() -> DetectOptions {
        DetectOptions {
            search_field: "name".into(),
            min_tokens: 2,
            partial_match: false,
        }
    }

    #[test]
    fn chunk_count_is_ceiling_and_order_is_kept() {
        let batcher = JobBatcher::new(DEFAULT_CHUNK_SIZE);
        for n in [0usize, 1, 49, 50, 51, 100, 120, 237] {
            let ids: Vec<FileId> = (0..n as u64).map(|i| 1000 + i * 3).collect();
            let chunks = batcher.plan(&ids);
            assert_eq!(chunks.len(), n.div_ceil(DEFAULT_CHUNK_SIZE));
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= DEFAULT_CHUNK_SIZE));
            let flat: Vec<FileId> = chunks.concat();
            assert_eq!(flat, ids);
        }
    }

    #[test]
    fn hundred_twenty_gives_fifty_fifty_twenty() {
        let ids: Vec<FileId> = (1..=120).collect();
        let sizes: Vec<usize> = JobBatcher::new(50).plan(&ids).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[test]
    fn key_ignores_order_but_not_content() {
        let b = JobBatcher::new(50);
        let ents = vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 2})];
        let rev: Vec<_> = ents.iter().rev().cloned().collect();
        let a = submission_key(&b.request_for(&[1, 2, 3], &ents, &options()));
        let same = submission_key(&b.request_for(&[3, 1, 2], &rev, &options()));
        let other = submission_key(&b.request_for(&[1, 2, 4], &ents, &options()));
        let mut opts = options();
        opts.partial_match = true;
        let other_opts = submission_key(&b.request_for(&[1, 2, 3], &ents, &opts));
        assert_eq!(a, same);
        assert_ne!(a, other);
        assert_ne!(a, other_opts);
    }

    #[tokio::test]
    async fn running_job_is_resumed_not_resubmitted() {
        let api = InMemoryApi::new();
        let b = JobBatcher::new(50);
        let req = b.request_for(&[1, 2], &[], &options());

        let first = submit_chunk(&api, &[], 0, &req).await.unwrap();
        let Submission::Created(job) = first else {
            panic!("expected a new job")
        };
        let jobs = vec![job];
        let second = submit_chunk(&api, &jobs, 0, &req).await.unwrap();
        assert!(matches!(second, Submission::Resumed(id) if id == jobs[0].job_id));
        assert_eq!(api.submission_count(), 1);
    }

    #[tokio::test]
    async fn terminal_job_allows_a_fresh_submission() {
        let api = InMemoryApi::new();
        let b = JobBatcher::new(50);
        let req = b.request_for(&[1, 2], &[], &options());
        let Submission::Created(mut job) = submit_chunk(&api, &[], 0, &req).await.unwrap() else {
            panic!("expected a new job")
        };
        job.phase = JobPhase::Completed;
        let again = submit_chunk(&api, &[job], 0, &req).await.unwrap();
        assert!(matches!(again, Submission::Created(_)));
        assert_eq!(api.submission_count(), 2);
    }

    #[tokio::test]
    async fn refused_submission_names_the_chunk() {
        let api = InMemoryApi::new();
        api.fail_submissions(1);
        let req = JobBatcher::new(50).request_for(&[9], &[], &options());
        let err = submit_chunk(&api, &[], 4, &req).await.unwrap_err();
        assert!(matches!(err, PipelineError::Submission { chunk: 4, .. }));
    }
}
