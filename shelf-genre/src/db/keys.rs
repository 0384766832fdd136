//! Blob key layout
//!
//! - `manifests/{job_id}`: canonical identity list, written once
//! - `results/{job_id}/{item_key}`: one enriched book, overwritten on redelivery
//! - `reports/{job_id}`: final report, written once

use crate::models::ItemKey;
use uuid::Uuid;

pub fn manifest_key(job_id: Uuid) -> String {
    format!("manifests/{}", job_id)
}

pub fn report_key(job_id: Uuid) -> String {
    format!("reports/{}", job_id)
}

/// Prefix covering every per-item result of a job
pub fn results_prefix(job_id: Uuid) -> String {
    format!("results/{}/", job_id)
}

pub fn result_key(job_id: Uuid, item_key: &ItemKey) -> String {
    format!("{}{}", results_prefix(job_id), item_key)
}
