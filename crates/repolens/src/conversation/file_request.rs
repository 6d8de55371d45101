//! The file-request sub-protocol.
//!
//! The model may answer with nothing but
//! `{"action": "request_file", "file_path": "<path>"}` to ask for a file it
//! has only seen in the tree. The round driver then fetches the file,
//! injects it, and asks again, up to a hop limit.
//!
//! The cycle is an explicit state machine:
//!
//! ```text
//! Idle ──Begin──▶ AwaitingResponse ──Response──▶ Parse
//! Parse ──Advance──▶ Fetch            (request, hops left)
//!       ──Advance──▶ Done             (plain answer, or hop limit reached)
//! Fetch ──Fetched(Ok)──▶ Inject ──Advance──▶ AwaitingResponse
//!       ──Fetched(Err)─▶ Done
//! ```
//!
//! [`FileRequestMachine::transition`] is pure apart from the hop counter:
//! every side effect is an [`Action`] the driver performs before feeding
//! the next [`FsmInput`].

use crate::repository::{FetchError, normalize_request_path};
use crate::{Error, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// The only action the protocol defines.
pub const REQUEST_FILE_ACTION: &str = "request_file";

/// Default number of automatic fetches per question.
pub const DEFAULT_MAX_HOPS: u32 = 1;

/// A recognized request, exactly as the model wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub file_path: String,
}

/// The exact wire shape of a request. Unknown and repeated keys are errors.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequest {
    action: String,
    file_path: String,
}

/// Recognize a file request.
///
/// The whole text must be one JSON object with exactly the keys `action`
/// (equal to `"request_file"`) and `file_path` (a non-empty string), each
/// appearing once. Whitespace inside the object is fine; any character
/// outside it, including a trailing newline, makes the text a plain answer.
pub fn parse(text: &str) -> Option<FileRequest> {
    if !(text.starts_with('{') && text.ends_with('}')) {
        return None;
    }
    let raw: RawRequest = serde_json::from_str(text).ok()?;
    if raw.action != REQUEST_FILE_ACTION || raw.file_path.trim().is_empty() {
        return None;
    }
    Some(FileRequest {
        file_path: raw.file_path,
    })
}

/// A request accepted for fetching. Lives for one fetch-and-inject cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFileRequest {
    /// Normalized repository-relative path.
    pub path: String,
    /// The path as the model wrote it.
    pub requested_path: String,
    /// Why the fetch is happening, for logs and notices.
    pub reason: String,
}

/// Where a round's file-request cycle stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRequestState {
    Idle,
    AwaitingResponse,
    /// A model reply waiting to be inspected.
    Parse(String),
    Fetch(PendingFileRequest),
    Inject(PendingFileRequest),
    Done,
}

/// What happened, fed into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmInput {
    /// A round starts.
    Begin,
    /// The model replied.
    Response(String),
    /// The previous action completed without producing data.
    Advance,
    /// The repository answered a fetch.
    Fetched(std::result::Result<String, FetchError>),
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The model's final answer.
    Answer(String),
    /// The requested file could not be fetched.
    FetchFailed {
        request: PendingFileRequest,
        error: FetchError,
    },
    /// The model asked for another file after the hop limit was reached.
    HopLimit { request: PendingFileRequest },
    /// The fetched file was left out of the next prompt for lack of room.
    /// Decided by the driver after assembly, not by the machine.
    ExceedsBudget {
        request: PendingFileRequest,
        tokens: usize,
    },
}

/// Work the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Assemble a prompt, call the model, feed [`FsmInput::Response`].
    CallModel,
    /// Feed [`FsmInput::Advance`] to have the reply inspected.
    Parse,
    /// Fetch the file and feed [`FsmInput::Fetched`].
    Fetch(PendingFileRequest),
    /// Add the content to the round's context, then feed
    /// [`FsmInput::Advance`].
    Inject {
        request: PendingFileRequest,
        content: String,
    },
    /// The round is over.
    Finish(RoundOutcome),
}

/// Hop accounting for one round.
#[derive(Debug, Clone)]
pub struct FileRequestMachine {
    hops_used: u32,
    max_hops: u32,
    repo_name: String,
}

impl FileRequestMachine {
    pub fn new(max_hops: u32, repo_name: impl Into<String>) -> Self {
        Self {
            hops_used: 0,
            max_hops,
            repo_name: repo_name.into(),
        }
    }

    pub fn hops_used(&self) -> u32 {
        self.hops_used
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Advance the machine. Illegal `(state, input)` pairs are
    /// [`Error::InvalidInput`].
    pub fn transition(
        &mut self,
        state: FileRequestState,
        input: FsmInput,
    ) -> Result<(FileRequestState, Action)> {
        use FileRequestState as S;
        use FsmInput as I;

        let next = match (state, input) {
            (S::Idle, I::Begin) => (S::AwaitingResponse, Action::CallModel),
            (S::AwaitingResponse, I::Response(text)) => (S::Parse(text), Action::Parse),
            (S::Parse(text), I::Advance) => match parse(&text) {
                None => (S::Done, Action::Finish(RoundOutcome::Answer(text))),
                Some(req) => {
                    let request = self.pending(req);
                    if self.hops_used >= self.max_hops {
                        info!(
                            "Model requested '{}' after {} automatic fetch(es); not fetching",
                            request.path, self.hops_used
                        );
                        (S::Done, Action::Finish(RoundOutcome::HopLimit { request }))
                    } else {
                        info!("Model requested file '{}'", request.path);
                        (S::Fetch(request.clone()), Action::Fetch(request))
                    }
                }
            },
            (S::Fetch(request), I::Fetched(Ok(content))) => {
                self.hops_used += 1;
                debug!(
                    "Fetched '{}' ({} bytes), hop {}/{}",
                    request.path,
                    content.len(),
                    self.hops_used,
                    self.max_hops
                );
                (
                    S::Inject(request.clone()),
                    Action::Inject { request, content },
                )
            }
            (S::Fetch(request), I::Fetched(Err(error))) => (
                S::Done,
                Action::Finish(RoundOutcome::FetchFailed { request, error }),
            ),
            (S::Inject(_), I::Advance) => (S::AwaitingResponse, Action::CallModel),
            (state, input) => {
                return Err(Error::InvalidInput(format!(
                    "file request machine: no transition from {state:?} on {input:?}"
                )));
            }
        };
        Ok(next)
    }

    fn pending(&self, req: FileRequest) -> PendingFileRequest {
        let path = normalize_request_path(&req.file_path, &self.repo_name);
        PendingFileRequest {
            reason: format!("model requested '{}'", req.file_path),
            requested_path: req.file_path,
            path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = r#"{"action": "request_file", "file_path": "src/a.py"}"#;

    #[test]
    fn recognizes_exact_request() {
        assert_eq!(
            parse(REQUEST),
            Some(FileRequest {
                file_path: "src/a.py".into()
            })
        );
    }

    #[test]
    fn accepts_inner_whitespace() {
        let text = "{\n  \"file_path\" : \"src/a.py\",\n  \"action\":\"request_file\"\n}";
        assert!(parse(text).is_some());
    }

    #[test]
    fn any_surrounding_character_makes_a_plain_answer() {
        assert!(parse(&format!("{REQUEST}\n")).is_none());
        assert!(parse(&format!("{REQUEST}.")).is_none());
        assert!(parse(&format!(" {REQUEST}")).is_none());
        assert!(parse(&format!("Here you go: {REQUEST}")).is_none());
        assert!(parse(&format!("```json\n{REQUEST}\n```")).is_none());
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(parse(r#"{"action": "request_file"}"#).is_none());
        assert!(parse(r#"{"action": "delete_file", "file_path": "a"}"#).is_none());
        assert!(parse(r#"{"action": "request_file", "file_path": ""}"#).is_none());
        assert!(parse(r#"{"action": "request_file", "file_path": 3}"#).is_none());
        assert!(
            parse(r#"{"action": "request_file", "file_path": "a", "why": "x"}"#).is_none()
        );
        assert!(parse("{not json}").is_none());
    }

    #[test]
    fn repeated_keys_are_not_a_request() {
        assert!(
            parse(r#"{"action": "request_file", "action": "request_file", "file_path": "a"}"#)
                .is_none()
        );
        assert!(
            parse(r#"{"action": "request_file", "file_path": "a", "file_path": "b"}"#).is_none()
        );
        // Two keys, but one of them twice.
        assert!(parse(r#"{"file_path": "a", "file_path": "b"}"#).is_none());
    }

    fn run_to_fetch(machine: &mut FileRequestMachine) -> FileRequestState {
        let (s, a) = machine
            .transition(FileRequestState::Idle, FsmInput::Begin)
            .unwrap();
        assert_eq!(a, Action::CallModel);
        let (s, a) = machine
            .transition(s, FsmInput::Response(REQUEST.into()))
            .unwrap();
        assert_eq!(a, Action::Parse);
        let (s, a) = machine.transition(s, FsmInput::Advance).unwrap();
        assert!(matches!(a, Action::Fetch(ref r) if r.path == "src/a.py"));
        s
    }

    #[test]
    fn plain_answer_finishes_immediately() {
        let mut m = FileRequestMachine::new(1, "demo");
        let (s, _) = m.transition(FileRequestState::Idle, FsmInput::Begin).unwrap();
        let (s, _) = m.transition(s, FsmInput::Response("42".into())).unwrap();
        let (s, a) = m.transition(s, FsmInput::Advance).unwrap();
        assert_eq!(s, FileRequestState::Done);
        assert_eq!(a, Action::Finish(RoundOutcome::Answer("42".into())));
    }

    #[test]
    fn successful_fetch_injects_then_calls_model_again() {
        let mut m = FileRequestMachine::new(1, "demo");
        let s = run_to_fetch(&mut m);
        let (s, a) = m.transition(s, FsmInput::Fetched(Ok("code".into()))).unwrap();
        assert!(matches!(a, Action::Inject { ref content, .. } if content == "code"));
        assert_eq!(m.hops_used(), 1);
        let (s, a) = m.transition(s, FsmInput::Advance).unwrap();
        assert_eq!(s, FileRequestState::AwaitingResponse);
        assert_eq!(a, Action::CallModel);
    }

    #[test]
    fn hop_limit_stops_second_request() {
        let mut m = FileRequestMachine::new(1, "demo");
        let s = run_to_fetch(&mut m);
        let (s, _) = m.transition(s, FsmInput::Fetched(Ok("code".into()))).unwrap();
        let (s, _) = m.transition(s, FsmInput::Advance).unwrap();
        let (s, _) = m.transition(s, FsmInput::Response(REQUEST.into())).unwrap();
        let (s, a) = m.transition(s, FsmInput::Advance).unwrap();
        assert_eq!(s, FileRequestState::Done);
        assert!(matches!(a, Action::Finish(RoundOutcome::HopLimit { .. })));
        assert_eq!(m.hops_used(), 1);
    }

    #[test]
    fn zero_hops_never_fetches() {
        let mut m = FileRequestMachine::new(0, "demo");
        let (s, _) = m.transition(FileRequestState::Idle, FsmInput::Begin).unwrap();
        let (s, _) = m.transition(s, FsmInput::Response(REQUEST.into())).unwrap();
        let (_, a) = m.transition(s, FsmInput::Advance).unwrap();
        assert!(matches!(a, Action::Finish(RoundOutcome::HopLimit { .. })));
    }

    #[test]
    fn failed_fetch_finishes_with_the_error() {
        let mut m = FileRequestMachine::new(1, "demo");
        let s = run_to_fetch(&mut m);
        let (s, a) = m
            .transition(s, FsmInput::Fetched(Err(FetchError::NotFound)))
            .unwrap();
        assert_eq!(s, FileRequestState::Done);
        assert!(matches!(
            a,
            Action::Finish(RoundOutcome::FetchFailed {
                error: FetchError::NotFound,
                ..
            })
        ));
        assert_eq!(m.hops_used(), 0);
    }

    #[test]
    fn request_paths_are_normalized() {
        let mut m = FileRequestMachine::new(1, "demo");
        let (s, _) = m.transition(FileRequestState::Idle, FsmInput::Begin).unwrap();
        let (s, _) = m
            .transition(
                s,
                FsmInput::Response(
                    r#"{"action":"request_file","file_path":"demo/src/a.py"}"#.into(),
                ),
            )
            .unwrap();
        let (_, a) = m.transition(s, FsmInput::Advance).unwrap();
        match a {
            Action::Fetch(r) => {
                assert_eq!(r.path, "src/a.py");
                assert_eq!(r.requested_path, "demo/src/a.py");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let mut m = FileRequestMachine::new(1, "demo");
        assert!(matches!(
            m.transition(FileRequestState::Done, FsmInput::Begin),
            Err(Error::InvalidInput(_))
        ));
    }
}
