//! JSON-lines protocol spoken with the Python worker.
//!
//! One request object per line on the worker's stdin, one response object
//! per line on its stdout.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request<'a> {
    Load {
        path: &'a Path,
        device: String,
        factory: &'a str,
    },
    Seed {
        value: u64,
    },
    Sample {
        handle: u64,
        n: usize,
    },
    Release {
        handle: u64,
    },
    Reclaim {
        device: String,
    },
    RegisterReference {
        fingerprint: &'a str,
        test: &'a [String],
        test_scaffolds: &'a [String],
        train: &'a [String],
        test_stats_b64: String,
        test_scaffold_stats_b64: String,
    },
    Score {
        fingerprint: &'a str,
        generated: &'a [String],
        device_index: Option<u32>,
        n_jobs: usize,
    },
    Shutdown,
}

impl Request<'_> {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Load { .. } => "load",
            Request::Seed { .. } => "seed",
            Request::Sample { .. } => "sample",
            Request::Release { .. } => "release",
            Request::Reclaim { .. } => "reclaim",
            Request::RegisterReference { .. } => "register_reference",
            Request::Score { .. } => "score",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "worker reported failure without a message".to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoadResult {
    pub handle: u64,
}

#[derive(Debug, Deserialize)]
pub struct SampleResult {
    pub samples: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let req = Request::Sample { handle: 3, n: 100 };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"op": "sample", "handle": 3, "n": 100})
        );

        let generated = vec!["CCO".to_string()];
        let req = Request::Score {
            fingerprint: "abc",
            generated: &generated,
            device_index: None,
            n_jobs: 4,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "op": "score",
                "fingerprint": "abc",
                "generated": ["CCO"],
                "device_index": null,
                "n_jobs": 4
            })
        );
        assert_eq!(
            serde_json::to_value(Request::Shutdown).unwrap(),
            json!({"op": "shutdown"})
        );
    }

    #[test]
    fn test_load_request_carries_path_and_device() {
        let req = Request::Load {
            path: Path::new("/ckpt/m1/checkpoint_10.pt"),
            device: "cuda:0".to_string(),
            factory: "models:load_model",
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["path"], json!("/ckpt/m1/checkpoint_10.pt"));
        assert_eq!(value["device"], json!("cuda:0"));
        assert_eq!(req.op(), "load");
    }

    #[test]
    fn test_response_ok_and_error() {
        let ok: Response = serde_json::from_str(r#"{"ok": true, "result": {"handle": 7}}"#).unwrap();
        let loaded: LoadResult = serde_json::from_value(ok.into_result().unwrap()).unwrap();
        assert_eq!(loaded.handle, 7);

        let err: Response =
            serde_json::from_str(r#"{"ok": false, "error": "KeyError: 9"}"#).unwrap();
        assert_eq!(err.into_result().unwrap_err(), "KeyError: 9");

        let bare: Response = serde_json::from_str(r#"{"ok": true}"#).unwrap();
        assert!(bare.into_result().unwrap().is_null());
    }
}
