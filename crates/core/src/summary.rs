//! On-disk JSON artifacts: batch error summaries and the verifier's
//! `quality` annotation of per-nonce output files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// File name of the batch error summary inside the output directory.
pub const RESULT_FILE: &str = "result.json";

/// File name of the verifier error summary inside the output directory.
pub const VERIFIER_ERRORS_FILE: &str = "verifier_errors.json";

#[derive(Debug, Serialize)]
struct FatalSummary<'a> {
    error: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorMapSummary {
    errors: BTreeMap<String, String>,
}

/// Path of the output artifact for one nonce.
pub fn output_file(output_dir: &Path, nonce: u64) -> PathBuf {
    output_dir.join(format!("{nonce}.json"))
}

/// Write `result.json` for a fail-fast abort: a single error message.
pub fn write_fatal_summary(output_dir: &Path, message: &str) -> anyhow::Result<()> {
    let body = serde_json::to_string(&FatalSummary { error: message })?;
    std::fs::write(output_dir.join(RESULT_FILE), body)?;
    Ok(())
}

/// Write a best-effort error summary: a map of nonce to message.
pub fn write_error_summary(
    output_dir: &Path,
    file_name: &str,
    errors: &BTreeMap<u64, String>,
) -> anyhow::Result<()> {
    let errors = errors
        .iter()
        .map(|(nonce, msg)| (nonce.to_string(), msg.clone()))
        .collect();
    let body = serde_json::to_string(&ErrorMapSummary { errors })?;
    std::fs::write(output_dir.join(file_name), body)?;
    Ok(())
}

/// Extract the verifier's quality score from its stdout.
///
/// The contract is that the last line of stdout is `quality: <integer>`.
pub fn parse_quality(stdout: &str) -> Option<i64> {
    let last = stdout.trim_end().lines().next_back()?;
    last.strip_prefix("quality: ")?.trim().parse().ok()
}

/// Merge `{"quality": <quality>}` into an existing per-nonce output file.
///
/// Re-applying the same quality rewrites the file with identical bytes.
pub fn merge_quality(output_file: &Path, quality: i64) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(output_file)?;
    let mut doc: serde_json::Value = serde_json::from_str(&raw)?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("{} is not a JSON object", output_file.display()))?;
    obj.insert("quality".to_string(), serde_json::Value::from(quality));
    std::fs::write(output_file, serde_json::to_string(&doc)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quality_from_last_line() {
        assert_eq!(parse_quality("quality: 42\n"), Some(42));
        assert_eq!(parse_quality("log line\nmore logs\nquality: -3"), Some(-3));
        assert_eq!(parse_quality("quality: 7\ntrailing noise"), None);
        assert_eq!(parse_quality("quality:7"), None);
        assert_eq!(parse_quality(""), None);
    }

    #[test]
    fn quality_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = output_file(dir.path(), 5);
        std::fs::write(&path, r#"{"solution":[1,2]}"#).unwrap();

        merge_quality(&path, 9).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(doc["quality"], 9);
        assert_eq!(doc["solution"][0], 1);

        merge_quality(&path, 9).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn summaries_have_the_expected_shapes() {
        let dir = tempfile::tempdir().unwrap();
        write_fatal_summary(dir.path(), "nonce 3: exit 2: boom").unwrap();
        let raw = std::fs::read_to_string(dir.path().join(RESULT_FILE)).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["error"], "nonce 3: exit 2: boom");

        let mut errors = BTreeMap::new();
        errors.insert(2u64, "exit 1: bad".to_string());
        write_error_summary(dir.path(), VERIFIER_ERRORS_FILE, &errors).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(VERIFIER_ERRORS_FILE)).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["errors"]["2"], "exit 1: bad");
    }
}
