//! On-disk deliberation transcripts.
//!
//! Each request gets its own directory under the transcript root, named
//! `{timestamp}-{short id}` with a numeric suffix on collision. The five
//! files are written in creation order (`request`, `stage1`, `stage2`,
//! `stage3`, `result`) as pretty-printed JSON with sorted keys, each via
//! write-to-temp, fsync, and atomic rename so a crash never leaves a
//! half-written file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::aggregate::AggregateEntry;
use crate::config::CouncilConfig;
use crate::error::TranscriptError;
use crate::labels::LabelMap;
use crate::parse::Ranking;
use crate::query::{ModelId, Query};
use crate::runner::StageResult;
use crate::stages::normalize::NormalizedResponse;
use crate::stages::synthesize::Synthesis;

pub const REQUEST_FILE: &str = "request.json";
pub const STAGE1_FILE: &str = "stage1.json";
pub const STAGE2_FILE: &str = "stage2.json";
pub const STAGE3_FILE: &str = "stage3.json";
pub const RESULT_FILE: &str = "result.json";

/// `request.json`: the accepted query, resolved config, and label map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub query: Query,
    pub config: CouncilConfig,
    pub label_map: LabelMap,
    pub started_at: DateTime<Utc>,
}

/// `stage1.json`: raw responses plus the normalization pass, if it ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage1Record {
    pub results: Vec<StageResult<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<Vec<NormalizedResponse>>,
}

/// `stage2.json`: per-reviewer rankings and the aggregate table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2Record {
    pub results: Vec<StageResult<Ranking>>,
    pub aggregate: Vec<AggregateEntry>,
    /// Reviewers that needed the terse parse retry.
    pub retried: Vec<ModelId>,
}

/// `stage3.json`: the chairman call and the parsed synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage3Record {
    pub result: StageResult<String>,
    pub synthesis: Synthesis,
}

/// Writer bound to one request's transcript directory.
pub struct TranscriptWriter {
    dir: PathBuf,
}

impl TranscriptWriter {
    /// Create a unique transcript directory under `root`.
    pub async fn create(
        root: &Path,
        started_at: DateTime<Utc>,
        short_id: &str,
    ) -> Result<Self, TranscriptError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| TranscriptError::Io {
                path: root.to_path_buf(),
                source,
            })?;

        let base = format!("{}-{}", started_at.format("%Y-%m-%dT%H-%M-%S"), short_id);
        let mut dir = root.join(&base);
        let mut counter = 0u32;
        loop {
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter += 1;
                    dir = root.join(format!("{}-{}", base, counter));
                }
                Err(source) => return Err(TranscriptError::Io { path: dir, source }),
            }
        }

        debug!(dir = %dir.display(), "transcript directory created");
        Ok(Self { dir })
    }

    /// The directory this writer owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write_request(&self, record: &RequestRecord) -> Result<(), TranscriptError> {
        self.write_json(REQUEST_FILE, record).await
    }

    pub async fn write_stage1(&self, record: &Stage1Record) -> Result<(), TranscriptError> {
        self.write_json(STAGE1_FILE, record).await
    }

    pub async fn write_stage2(&self, record: &Stage2Record) -> Result<(), TranscriptError> {
        self.write_json(STAGE2_FILE, record).await
    }

    pub async fn write_stage3(&self, record: &Stage3Record) -> Result<(), TranscriptError> {
        self.write_json(STAGE3_FILE, record).await
    }

    pub async fn write_result<T: Serialize>(&self, envelope: &T) -> Result<(), TranscriptError> {
        self.write_json(RESULT_FILE, envelope).await
    }

    /// Serialize with sorted keys, write to a temp file, fsync, rename.
    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), TranscriptError> {
        // Round-tripping through Value sorts object keys.
        let value = serde_json::to_value(value)?;
        let mut body = serde_json::to_string_pretty(&value)?;
        body.push('\n');

        let tmp_path = self.dir.join(format!("{}.tmp", name));
        let final_path = self.dir.join(name);

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| TranscriptError::Io { path, source }
        };

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(io_err(&tmp_path))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(io_err(&tmp_path))?;
        file.sync_all().await.map_err(io_err(&tmp_path))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(io_err(&final_path))?;

        debug!(file = name, "transcript file written");
        Ok(())
    }
}
