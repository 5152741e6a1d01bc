//! Upload header contract: content integrity, auth, and the structured
//! asset-metadata dictionary.
//!
//! The metadata header is an RFC 8941-style dictionary (unique keys, order
//! not significant): strings quoted with `\` escaping, integers bare,
//! booleans as `?1`/`?0`. Absent optional fields are omitted entirely.

use base64::Engine as _;

use crate::job_db::JobRecord;

/// Content-integrity header carrying the staged bytes' digest.
pub const REPR_DIGEST: &str = "Repr-Digest";
/// Per-job auth token header.
pub const USER_TOKEN: &str = "X-Arq-User-Token";
/// Structured dictionary of the job's descriptive metadata.
pub const ASSET_DATA: &str = "X-Arq-Asset-Data";

/// The three headers attached to every upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHeaders {
    pub repr_digest: String,
    pub user_token: String,
    pub asset_data: String,
}

impl UploadHeaders {
    /// Build the header set for one job from its immutable metadata and the
    /// staged content's SHA-256.
    pub fn for_job(job: &JobRecord, sha256: &[u8; 32]) -> Self {
        let digest = base64::engine::general_purpose::STANDARD.encode(sha256);
        Self {
            repr_digest: format!("sha-256=:{digest}:"),
            user_token: job.access_token.clone(),
            asset_data: asset_data_dictionary(job),
        }
    }

    /// (name, value) pairs in wire form.
    pub fn as_pairs(&self) -> [(&'static str, &str); 3] {
        [
            (REPR_DIGEST, &self.repr_digest),
            (USER_TOKEN, &self.user_token),
            (ASSET_DATA, &self.asset_data),
        ]
    }
}

fn asset_data_dictionary(job: &JobRecord) -> String {
    let mut members: Vec<String> = vec![
        format!("source-id={}", sf_string(&job.source_id)),
        format!("origin-id={}", sf_string(&job.device_id)),
        format!("file-name={}", sf_string(&job.file_name)),
        format!("created-at={}", job.file_created_at),
        format!("modified-at={}", job.file_modified_at),
        format!("favorite=?{}", if job.favorite { 1 } else { 0 }),
    ];
    if let Some(remote) = &job.remote_ref {
        members.push(format!("remote-ref={}", sf_string(remote)));
    }
    if let Some(companion) = &job.companion_ref {
        members.push(format!("companion-ref={}", sf_string(companion)));
    }
    members.join(", ")
}

/// Quote a value as an sf-string: `"` and `\` are escaped, everything else
/// outside printable ASCII is replaced (header values must stay ASCII).
fn sf_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (' '..='~').contains(&c) => out.push(c),
            _ => out.push('_'),
        }
    }
    out.push('"');
    out
}
