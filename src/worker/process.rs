//! Face engine that runs every call in a fresh child process.
//!
//! The child receives one MessagePack request on stdin and answers with one
//! JSON object on stdout. A child that outlives the process timeout is
//! killed, so a runaway computation never holds a worker thread forever.

use super::{Comparison, DetectionParams, EngineError, FaceEngine};
use crate::config::WorkerConfig;
use crate::queue::FaceRect;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum EngineRequest<'a> {
    Detect {
        #[serde(with = "serde_bytes")]
        image: &'a [u8],
        for_identification: bool,
        threshold: f64,
    },
    Compare {
        #[serde(with = "serde_bytes")]
        first_image: &'a [u8],
        first_face: FaceRect,
        #[serde(with = "serde_bytes")]
        second_image: &'a [u8],
        second_face: FaceRect,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum EngineReply {
    /// Face locations as `[x1, y1, x2, y2]`.
    Faces { faces: Vec<[i32; 4]> },
    Comparison {
        is_match: bool,
        similarity_confidence: f64,
    },
    MultipleFaces { quantity: usize },
    FeaturesExtractionFailed { index: usize },
    InvalidImage { message: String },
    Error { message: String },
}

impl EngineReply {
    fn into_error(self) -> EngineError {
        match self {
            EngineReply::MultipleFaces { quantity } => EngineError::MultipleFaces { quantity },
            EngineReply::FeaturesExtractionFailed { index } => {
                EngineError::FeaturesExtraction { index }
            }
            EngineReply::InvalidImage { message } => EngineError::ImageDecode(message),
            EngineReply::Error { message } => EngineError::Process(message),
            EngineReply::Faces { .. } | EngineReply::Comparison { .. } => {
                EngineError::Protocol("unexpected reply for request".to_string())
            }
        }
    }
}

/// [`FaceEngine`] backed by an external program.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    command: Vec<String>,
    timeout: Duration,
}

impl ProcessEngine {
    /// `command` is the program followed by its arguments.
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.command.clone(), config.process_timeout())
    }

    fn call(&self, request: &EngineRequest<'_>) -> Result<EngineReply, EngineError> {
        let (program, args) = self.command.split_first().ok_or(EngineError::Unavailable)?;
        let body =
            rmp_serde::to_vec_named(request).map_err(|e| EngineError::Protocol(e.to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EngineError::Process(format!("failed to spawn `{program}`: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Process("child stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Process("child stdout unavailable".to_string()))?;

        // Pipes are serviced on their own threads so a child that stops
        // reading its input cannot stall the timeout below.
        let writer = thread::spawn(move || stdin.write_all(&body));
        let reader = thread::spawn(move || {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).map(|_| output)
        });

        let status = self.wait(&mut child)?;

        if let Ok(Err(e)) = writer.join() {
            tracing::debug!(error = %e, "engine_stdin_write_failed");
        }
        let output = reader
            .join()
            .map_err(|_| EngineError::Process("stdout reader panicked".to_string()))?
            .map_err(|e| EngineError::Process(format!("failed to read engine output: {e}")))?;

        if !status.success() {
            return Err(EngineError::Process(format!("engine exited with {status}")));
        }

        serde_json::from_slice(&output).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, EngineError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => return Err(EngineError::Process(e.to_string())),
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(
                    pid = child.id(),
                    timeout_ms = self.timeout.as_millis(),
                    "engine_process_killed"
                );
                return Err(EngineError::Process(format!(
                    "engine did not finish within {:?}",
                    self.timeout
                )));
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

impl FaceEngine for ProcessEngine {
    fn detect(&self, image: &[u8], params: DetectionParams) -> Result<Vec<FaceRect>, EngineError> {
        let request = EngineRequest::Detect {
            image,
            for_identification: params.for_identification,
            threshold: params.threshold,
        };
        match self.call(&request)? {
            EngineReply::Faces { faces } => {
                Ok(faces.into_iter().map(FaceRect::from_location).collect())
            }
            other => Err(other.into_error()),
        }
    }

    fn compare(
        &self,
        first: (&[u8], &FaceRect),
        second: (&[u8], &FaceRect),
    ) -> Result<Comparison, EngineError> {
        let request = EngineRequest::Compare {
            first_image: first.0,
            first_face: *first.1,
            second_image: second.0,
            second_face: *second.1,
        };
        match self.call(&request)? {
            EngineReply::Comparison {
                is_match,
                similarity_confidence,
            } => Ok(Comparison {
                is_match,
                similarity_confidence,
            }),
            other => Err(other.into_error()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_bytes::ByteBuf;

    fn sh(script: &str) -> ProcessEngine {
        ProcessEngine::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    fn params() -> DetectionParams {
        DetectionParams {
            for_identification: false,
            threshold: 0.65,
        }
    }

    #[test]
    fn test_detect_parses_faces() {
        let engine = sh(r#"cat >/dev/null; echo '{"status":"faces","faces":[[1,2,3,4],[5,6,7,8]]}'"#);
        let faces = engine.detect(b"jpeg", params()).unwrap();
        assert_eq!(
            faces,
            vec![
                FaceRect::from_location([1, 2, 3, 4]),
                FaceRect::from_location([5, 6, 7, 8]),
            ]
        );
    }

    #[test]
    fn test_detect_request_is_msgpack_on_stdin() {
        #[derive(Deserialize)]
        struct Seen {
            op: String,
            image: ByteBuf,
            for_identification: bool,
            threshold: f64,
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.bin");
        let engine = ProcessEngine::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > "$0"; echo '{"status":"faces","faces":[]}'"#.to_string(),
                path.display().to_string(),
            ],
            Duration::from_secs(5),
        );
        let faces = engine
            .detect(
                b"\x00\x01binary",
                DetectionParams {
                    for_identification: true,
                    threshold: 0.7,
                },
            )
            .unwrap();
        assert!(faces.is_empty());

        let seen: Seen = rmp_serde::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(seen.op, "detect");
        assert_eq!(seen.image.as_ref(), b"\x00\x01binary");
        assert!(seen.for_identification);
        assert!((seen.threshold - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_compare_parses_comparison() {
        let engine = sh(
            r#"cat >/dev/null; echo '{"status":"comparison","is_match":true,"similarity_confidence":0.91}'"#,
        );
        let face = FaceRect::from_location([0, 0, 1, 1]);
        let comparison = engine.compare((b"a", &face), (b"b", &face)).unwrap();
        assert!(comparison.is_match);
        assert!((comparison.similarity_confidence - 0.91).abs() < f64::EPSILON);
    }

    #[test]
    fn test_domain_replies_become_engine_errors() {
        let engine = sh(r#"cat >/dev/null; echo '{"status":"multiple_faces","quantity":3}'"#);
        assert!(matches!(
            engine.detect(b"x", params()),
            Err(EngineError::MultipleFaces { quantity: 3 })
        ));

        let engine = sh(r#"cat >/dev/null; echo '{"status":"features_extraction_failed","index":1}'"#);
        let face = FaceRect::from_location([0, 0, 1, 1]);
        assert!(matches!(
            engine.compare((b"a", &face), (b"b", &face)),
            Err(EngineError::FeaturesExtraction { index: 1 })
        ));

        let engine = sh(r#"cat >/dev/null; echo '{"status":"invalid_image","message":"bad jpeg"}'"#);
        assert!(matches!(
            engine.detect(b"x", params()),
            Err(EngineError::ImageDecode(m)) if m == "bad jpeg"
        ));
    }

    #[test]
    fn test_mismatched_reply_is_protocol_error() {
        let engine = sh(r#"cat >/dev/null; echo '{"status":"faces","faces":[]}'"#);
        let face = FaceRect::from_location([0, 0, 1, 1]);
        assert!(matches!(
            engine.compare((b"a", &face), (b"b", &face)),
            Err(EngineError::Protocol(_))
        ));
    }

    #[test]
    fn test_garbage_output_is_protocol_error() {
        let engine = sh("cat >/dev/null; echo not-json");
        assert!(matches!(
            engine.detect(b"x", params()),
            Err(EngineError::Protocol(_))
        ));
    }

    #[test]
    fn test_nonzero_exit_is_process_error() {
        let engine = sh("cat >/dev/null; exit 3");
        assert!(matches!(
            engine.detect(b"x", params()),
            Err(EngineError::Process(_))
        ));
    }

    #[test]
    fn test_child_ignoring_stdin_still_answers() {
        let engine = sh(r#"echo '{"status":"faces","faces":[]}'"#);
        assert!(engine.detect(&[0u8; 256 * 1024], params()).is_ok());
    }

    #[test]
    fn test_slow_child_is_killed() {
        let engine = ProcessEngine::new(
            vec!["sh".to_string(), "-c".to_string(), "exec sleep 10".to_string()],
            Duration::from_millis(100),
        );
        let start = Instant::now();
        let result = engine.detect(b"x", params());
        assert!(matches!(result, Err(EngineError::Process(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program_is_process_error() {
        let engine = ProcessEngine::new(
            vec!["/nonexistent/facegate-engine".to_string()],
            Duration::from_secs(1),
        );
        assert!(matches!(
            engine.detect(b"x", params()),
            Err(EngineError::Process(_))
        ));
    }

    #[test]
    fn test_empty_command_is_unavailable() {
        let engine = ProcessEngine::new(Vec::new(), Duration::from_secs(1));
        assert!(matches!(
            engine.detect(b"x", params()),
            Err(EngineError::Unavailable)
        ));
    }
}
