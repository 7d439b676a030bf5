//! Content hashes handed to the signing layer.
//!
//! `job_hash` identifies what was asked for; `result_digest` binds it to
//! what came out. Both are lowercase hex SHA-256 and stable across calls.

use crate::config::job::JobConfig;
use crate::config::types::ExecutionResult;
use sha2::{Digest, Sha256};

/// Hash of entrypoint, interpreter, env, args and input file contents.
pub fn job_hash(config: &JobConfig) -> String {
    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };
    field(config.entrypoint.as_bytes());
    field(config.interpreter.tag().as_bytes());
    // BTreeMap iteration is already sorted by key.
    for (key, value) in &config.env {
        field(key.as_bytes());
        field(value.as_bytes());
    }
    for arg in &config.args {
        field(arg.as_bytes());
    }
    let mut inputs: Vec<(&str, String)> = config
        .inputs
        .iter()
        .map(|f| (f.path.as_str(), hex::encode(Sha256::digest(&f.contents))))
        .collect();
    inputs.sort();
    for (path, sha) in inputs {
        field(path.as_bytes());
        field(sha.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// The canonical line that `result_digest` hashes.
pub fn digest_input(job_hash: &str, result: &ExecutionResult) -> String {
    let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    let mut parts = vec![
        job_hash.to_string(),
        opt(result.exit_code.map(|c| c.to_string())),
        format!("{:.6}", result.cpu_seconds),
        result.memory_peak.to_string(),
        opt(result.gpu_memory_peak.map(|g| g.to_string())),
    ];
    let mut files: Vec<_> = result.output_files.iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    parts.extend(files.iter().map(|f| format!("{}:{}", f.path, f.sha256)));
    parts.join("|")
}

pub fn result_digest(job_hash: &str, result: &ExecutionResult) -> String {
    hex::encode(Sha256::digest(digest_input(job_hash, result).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::presets::Interpreter;
    use crate::config::types::{FileKind, OutputFile};

    fn config() -> JobConfig {
        let mut c = JobConfig::new(Interpreter::Python3, "main.py").with_input("main.py", "print(1)");
        c.env.insert("B".into(), "2".into());
        c.env.insert("A".into(), "1".into());
        c.args = vec!["--n".into(), "3".into()];
        c
    }

    fn output(path: &str, sha: &str) -> OutputFile {
        OutputFile {
            path: path.into(),
            size_bytes: 1,
            sha256: sha.into(),
            kind: FileKind::Text,
        }
    }

    #[test]
    fn job_hash_is_stable_and_input_sensitive() {
        let a = job_hash(&config());
        assert_eq!(a, job_hash(&config()));
        assert_eq!(a.len(), 64);

        let mut changed = config();
        changed.inputs[0].contents = b"print(2)".to_vec();
        assert_ne!(a, job_hash(&changed));

        let mut reordered = config();
        reordered.args.reverse();
        assert_ne!(a, job_hash(&reordered));
    }

    #[test]
    fn field_boundaries_matter() {
        let mut x = config();
        x.args = vec!["ab".into(), "c".into()];
        let mut y = config();
        y.args = vec!["a".into(), "bc".into()];
        assert_ne!(job_hash(&x), job_hash(&y));
    }

    #[test]
    fn digest_line_orders_outputs_by_path() {
        let result = ExecutionResult {
            exit_code: Some(0),
            cpu_seconds: 1.5,
            memory_peak: 2048,
            output_files: vec![output("z.txt", "22"), output("a.txt", "11")],
            ..Default::default()
        };
        assert_eq!(
            digest_input("h", &result),
            "h|0|1.500000|2048|-|a.txt:11|z.txt:22"
        );
        assert_eq!(result_digest("h", &result), result_digest("h", &result));
    }

    #[test]
    fn signal_death_has_no_exit_code() {
        let result = ExecutionResult {
            signal: Some(9),
            gpu_memory_peak: Some(10),
            ..Default::default()
        };
        assert_eq!(digest_input("h", &result), "h|-|0.000000|0|10");
    }
}
