//! The prompt sent to the surface for one job.

use crate::job::JobId;

/// Version of the JSON shape the prompt asks for.
const SCHEMA_VERSION: u32 = 1;

/// Build the request text for `topic`.
///
/// The job id and prompt version are tagged on their own lines so a reply
/// can be traced back to the job that asked for it. The topic is embedded as
/// a JSON string, so quotes and newlines in it cannot break the schema.
pub fn build_prompt(topic: &str, job_id: JobId, prompt_version: i32) -> String {
    let concept = serde_json::Value::String(topic.to_string());

    [
        "You are generating structured output for a learning tool.".to_string(),
        String::new(),
        format!("SIDECAR_JOB_ID={job_id}"),
        format!("PROMPT_VERSION={prompt_version}"),
        String::new(),
        "Return ONLY valid JSON matching this schema:".to_string(),
        "{".to_string(),
        format!("  \"v\": {SCHEMA_VERSION},"),
        format!("  \"concept\": {concept},"),
        "  \"simple\": \"High-level explanation using analogy\",".to_string(),
        "  \"technical\": \"Detailed technical explanation with math/code\"".to_string(),
        "}".to_string(),
    ]
    .join("\n")
}
