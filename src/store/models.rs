use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub prompt: String,
    pub code: String,
    pub explanation: Option<String>,
    /// Render succeeded but the primary video could not be stored.
    pub artifact_pending: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub project_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub is_output: bool,
    pub blob_key: String,
    pub blob_bucket: String,
    pub created_at: String,
}

/// Project plus its video metadata, as returned by `GET /project/{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub videos: Vec<Video>,
}

/// Input for a project insert.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: String,
    pub owner_id: String,
    pub prompt: String,
    pub code: String,
    pub explanation: Option<String>,
}

/// Input for a video upsert. Written only after the blob upload succeeded.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub project_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub is_output: bool,
    pub blob_key: String,
    pub blob_bucket: String,
}

/// Result of a video upsert.
#[derive(Debug, Clone)]
pub struct VideoUpsert {
    pub video: Video,
    /// `(bucket, key)` of the blob the row pointed at before, when it differs
    /// from the new one.
    pub replaced: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

impl Pagination {
    pub fn new(total: i64, page: i64, limit: i64) -> Self {
        let pages = if limit > 0 { (total + limit - 1) / limit } else { 0 };
        Self { total, page, limit, pages }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).max(0) * self.limit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPage {
    pub data: Vec<Project>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_pages_round_up() {
        assert_eq!(Pagination::new(0, 1, 10).pages, 0);
        assert_eq!(Pagination::new(10, 1, 10).pages, 1);
        assert_eq!(Pagination::new(11, 2, 10).pages, 2);
        assert_eq!(Pagination::new(11, 2, 10).offset(), 10);
    }

    #[test]
    fn test_project_detail_flattens_with_camel_case() {
        let detail = ProjectDetail {
            project: Project {
                id: "p".into(),
                owner_id: "u".into(),
                prompt: "x".into(),
                code: "y".into(),
                explanation: None,
                artifact_pending: false,
                created_at: "t".into(),
                updated_at: "t".into(),
            },
            videos: vec![],
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["ownerId"], "u");
        assert_eq!(json["artifactPending"], false);
        assert!(json["videos"].is_array());
    }
}
