use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Error};
use serde::Deserialize;

/// A bulk transfer request from `jobs.json`.
///
/// `deadline_hour` is a 0-based, inclusive offset into the forecast horizon:
/// a job with deadline 0 may only run in the first forecast hour.
#[derive(Clone, Debug, Deserialize)]
pub struct Job {
    pub id: u64,
    #[serde(rename = "bytes")]
    pub size_bytes: u64,
    pub files_count: u32,
    #[serde(rename = "deadline")]
    pub deadline_hour: u32,
    #[serde(rename = "type", default)]
    pub type_tag: Option<String>,
}

pub fn load_jobs(path: &Path) -> Result<Vec<Job>, Error> {
    let file = File::open(path)
        .with_context(|| format!("failed to open jobs file {}", path.display()))?;
    let jobs: Vec<Job> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse jobs file {}", path.display()))?;
    for job in &jobs {
        if job.size_bytes == 0 {
            return Err(anyhow!("job {} has zero size", job.id));
        }
    }
    tracing::info!(jobs = jobs.len(), "loaded jobs");
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn jobs_json_shape() {
        let raw = r#"[
            {"id": 1, "bytes": 1000000000, "files_count": 12, "deadline": 5, "type": "large_urgent"},
            {"id": 2, "bytes": 5000, "files_count": 1, "deadline": 0}
        ]"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();

        let jobs = load_jobs(file.path()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].type_tag.as_deref(), Some("large_urgent"));
        assert_eq!(jobs[1].type_tag, None);
        assert_eq!(jobs[1].deadline_hour, 0);
    }

    #[test]
    fn zero_size_rejected() {
        let raw = r#"[{"id": 7, "bytes": 0, "files_count": 1, "deadline": 2}]"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();
        assert!(load_jobs(file.path()).is_err());
    }
}
