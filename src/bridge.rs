//! JSON-lines host
//!
//! Exposes the runtime to another process over a pair of byte streams
//! (stdin/stdout for the `offline-llm` binary). Every input line is one
//! request:
//!
//! ```text
//! {"id": 1, "method": "loadModel", "params": {"path": "tiny.gguf"}}
//! ```
//!
//! and is answered by `{"id": 1, "ok": ...}` or
//! `{"id": 1, "error": {"code": ..., "message": ...}}`. A generation answers
//! with `generationProgress` events followed by exactly one
//! `generationComplete` event (or an error line).
//!
//! Cheap requests are handled in input order. Loading, downloading and
//! unloading run in the background so `status` and `stop` stay responsive.
//!
//! Output is bounded. A generation whose lines cannot be written within the
//! stream delivery timeout loses its stream, which stops it and marks its
//! stats incomplete.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::inference::{StreamEvent, TokenStream};
use crate::runtime::args::parse;
use crate::runtime::{ErrorPayload, RuntimeError, RuntimeFacade};
use crate::storage::download::{DownloadProgress, ProgressCallback};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Lines queued for the writer before senders have to wait
const OUTBOX_DEPTH: usize = 64;

type Outbox = mpsc::Sender<Value>;

fn ok(id: &Value, result: impl Serialize) -> Value {
    match serde_json::to_value(result) {
        Ok(result) => json!({ "id": id, "ok": result }),
        Err(e) => error_line(id, "InternalError", e.to_string()),
    }
}

fn error_line(id: &Value, code: &str, message: String) -> Value {
    json!({ "id": id, "error": ErrorPayload { code: code.to_string(), message } })
}

fn failure(id: &Value, error: &RuntimeError) -> Value {
    json!({ "id": id, "error": error.payload() })
}

/// `{"id", "event", ...body}`
fn event(id: &Value, name: &str, body: impl Serialize) -> Value {
    let mut line = match serde_json::to_value(body) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    line.insert("id".into(), id.clone());
    line.insert("event".into(), Value::String(name.into()));
    Value::Object(line)
}

async fn reply(outbox: &Outbox, line: Value) {
    if outbox.send(line).await.is_err() {
        debug!("Output closed, dropping reply");
    }
}

/// Serves requests from `input` until it ends.
///
/// On end of input the running generation is stopped, pending work is
/// awaited and the model is unloaded.
pub async fn serve<R, W>(
    facade: &'static RuntimeFacade,
    input: R,
    output: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, mut outbox_rx) = mpsc::channel::<Value>(OUTBOX_DEPTH);
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = outbox_rx.recv().await {
            let mut text = line.to_string();
            text.push('\n');
            output.write_all(text.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        while tasks.try_join_next().is_some() {}

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(line) {
            Ok(request) => dispatch(facade, request, &outbox, &mut tasks).await,
            Err(e) => {
                warn!("Unreadable request: {}", e);
                reply(&outbox, error_line(&Value::Null, "InvalidRequest", e.to_string())).await;
            }
        }
    }

    info!("Input closed, shutting down");
    facade.stop();
    while tasks.join_next().await.is_some() {}
    facade.unload().await;
    drop(outbox);

    match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn dispatch(
    facade: &'static RuntimeFacade,
    request: Request,
    outbox: &Outbox,
    tasks: &mut JoinSet<()>,
) {
    let Request { id, method, params } = request;
    debug!("Request {}: {}", id, method);

    match method.as_str() {
        "status" => reply(outbox, ok(&id, facade.status())).await,
        "getModelInfo" => reply(outbox, ok(&id, facade.model_info())).await,
        "stop" | "stopInference" => {
            facade.stop();
            reply(outbox, ok(&id, true)).await;
        }
        "listDownloadedModels" => {
            let line = match facade.list_downloaded_models() {
                Ok(list) => ok(&id, list),
                Err(e) => failure(&id, &e),
            };
            reply(outbox, line).await;
        }
        "deleteModel" => {
            let line = match parse(params).and_then(|args| facade.delete_model(args)) {
                Ok(()) => ok(&id, true),
                Err(e) => failure(&id, &e),
            };
            reply(outbox, line).await;
        }
        "generate" => match parse(params).and_then(|args| facade.generate(args)) {
            Ok(stream) => {
                let timeout = facade.settings().stream_config().delivery_timeout;
                tasks.spawn(forward_stream(id, stream, outbox.clone(), timeout));
            }
            Err(e) => reply(outbox, failure(&id, &e)).await,
        },
        "loadModel" => {
            let outbox = outbox.clone();
            tasks.spawn(async move {
                let result = match parse(params) {
                    Ok(args) => facade.load_model(args).await,
                    Err(e) => Err(e),
                };
                let line = match result {
                    Ok(()) => ok(&id, true),
                    Err(e) => failure(&id, &e),
                };
                reply(&outbox, line).await;
            });
        }
        "ensureModel" => {
            let outbox = outbox.clone();
            tasks.spawn(async move {
                let progress_id = id.clone();
                let progress_outbox = outbox.clone();
                let on_progress: ProgressCallback = std::sync::Arc::new(move |p: DownloadProgress| {
                    // Progress is advisory; a busy writer just misses some.
                    let line = event(&progress_id, "modelDownload", p);
                    if let Err(TrySendError::Full(_)) = progress_outbox.try_send(line) {
                        debug!("Output busy, skipping download progress");
                    }
                });
                let result = match parse(params) {
                    Ok(args) => facade.ensure_model_with_progress(args, Some(on_progress)).await,
                    Err(e) => Err(e),
                };
                let line = match result {
                    Ok(ensured) => ok(&id, ensured),
                    Err(e) => failure(&id, &e),
                };
                reply(&outbox, line).await;
            });
        }
        "unload" | "unloadModel" => {
            let outbox = outbox.clone();
            tasks.spawn(async move {
                facade.unload().await;
                reply(&outbox, ok(&id, true)).await;
            });
        }
        "clearContext" => {
            let outbox = outbox.clone();
            tasks.spawn(async move {
                let line = match facade.clear_context().await {
                    Ok(()) => ok(&id, true),
                    Err(e) => failure(&id, &e),
                };
                reply(&outbox, line).await;
            });
        }
        other => {
            warn!("Unknown method: {}", other);
            reply(
                outbox,
                error_line(&id, "UnknownMethod", format!("unknown method {other:?}")),
            )
            .await;
        }
    }
}

/// Turns stream events into output lines until the terminal event.
///
/// Returning early drops the stream, which the producer sees as a consumer
/// gone away: it stops and reports the generation incomplete.
async fn forward_stream(id: Value, mut stream: TokenStream, outbox: Outbox, timeout: Duration) {
    while let Some(stream_event) = stream.next_event().await {
        let line = match stream_event {
            StreamEvent::Token(token) => event(&id, "generationProgress", token),
            StreamEvent::Complete(stats) => event(&id, "generationComplete", stats),
            StreamEvent::Error(e) => failure(&id, &RuntimeError::from(e)),
        };
        match outbox.send_timeout(line, timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    "Output stalled for {:?}, dropping generation {}",
                    timeout,
                    stream.session_id()
                );
                return;
            }
            Err(SendTimeoutError::Closed(_)) => {
                warn!("Output closed during generation {}", stream.session_id());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::handle::scripted::Script;
    use crate::inference::EngineState;
    use crate::runtime::testing::{scripted_facade, scripted_facade_with};
    use crate::storage::settings::RuntimeSettings;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, Lines};
    use tokio::task::JoinHandle;

    struct Client {
        input: Option<DuplexStream>,
        output: Lines<BufReader<DuplexStream>>,
        server: JoinHandle<std::io::Result<()>>,
        _dir: TempDir,
    }

    impl Client {
        fn start(script: &Arc<Script>) -> Self {
            let dir = TempDir::new().unwrap();
            let facade: &'static RuntimeFacade =
                Box::leak(Box::new(scripted_facade(script, dir.path())));
            let (input, server_input) = tokio::io::duplex(64 * 1024);
            let (server_output, output) = tokio::io::duplex(64 * 1024);
            let server = tokio::spawn(serve(facade, server_input, server_output));
            Self {
                input: Some(input),
                output: BufReader::new(output).lines(),
                server,
                _dir: dir,
            }
        }

        async fn send(&mut self, line: &str) {
            let input = self.input.as_mut().unwrap();
            input.write_all(line.as_bytes()).await.unwrap();
            input.write_all(b"\n").await.unwrap();
        }

        async fn call(&mut self, id: u64, method: &str, params: Value) {
            let line = json!({ "id": id, "method": method, "params": params }).to_string();
            self.send(&line).await;
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
                .await
                .expect("no reply within 5s")
                .unwrap()
                .expect("output closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn shutdown(mut self) {
            drop(self.input.take());
            while self.output.next_line().await.unwrap().is_some() {}
            self.server.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_status_and_unknown_method() {
        let mut client = Client::start(&Script::with_pieces(&["a"]));

        client.call(1, "status", Value::Null).await;
        assert_eq!(client.recv().await, json!({ "id": 1, "ok": { "state": "unloaded" } }));

        client.call(2, "fly", Value::Null).await;
        assert_eq!(client.recv().await["error"]["code"], "UnknownMethod");

        client.send("not json").await;
        let line = client.recv().await;
        assert_eq!(line["id"], Value::Null);
        assert_eq!(line["error"]["code"], "InvalidRequest");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_and_generate_stream() {
        let mut client = Client::start(&Script::with_pieces(&["Hi", " there", "!"]));

        client.call(1, "loadModel", json!({ "path": "m.bin" })).await;
        assert_eq!(client.recv().await, json!({ "id": 1, "ok": true }));

        client.call(2, "generate", json!({ "prompt": "hello", "maxTokens": 5 })).await;
        let mut tokens = Vec::new();
        let complete = loop {
            let line = client.recv().await;
            assert_eq!(line["id"], 2);
            match line["event"].as_str() {
                Some("generationProgress") => {
                    assert_eq!(line["index"], tokens.len());
                    tokens.push(line["token"].as_str().unwrap().to_string());
                }
                Some("generationComplete") => break line,
                _ => panic!("unexpected line {line}"),
            }
        };
        assert_eq!(tokens.concat(), "Hi there!");
        assert_eq!(complete["tokenCount"], 3);
        assert_eq!(complete["cancelled"], false);

        client.call(3, "getModelInfo", Value::Null).await;
        let info = client.recv().await;
        assert_eq!(info["ok"]["loaded"], true);
        assert_eq!(info["ok"]["nCtx"], 2048);

        client.call(4, "unloadModel", Value::Null).await;
        assert_eq!(client.recv().await, json!({ "id": 4, "ok": true }));
        client.call(5, "status", Value::Null).await;
        assert_eq!(client.recv().await["ok"]["state"], "unloaded");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_ends_generation_with_cancelled_stats() {
        let mut client = Client::start(&Script::endless(Duration::from_millis(5)));

        client.call(1, "loadModel", json!({ "path": "m.bin" })).await;
        client.recv().await;
        client.call(2, "generate", json!({ "prompt": "go", "maxTokens": 100000 })).await;
        assert_eq!(client.recv().await["event"], "generationProgress");

        client.call(3, "generate", json!({ "prompt": "again" })).await;
        client.call(4, "stopInference", Value::Null).await;

        let mut saw_rejection = false;
        let mut saw_stop_ack = false;
        let complete = loop {
            let line = client.recv().await;
            if line["id"] == 3 {
                assert_eq!(line["error"]["code"], "InvalidState");
                saw_rejection = true;
            } else if line["id"] == 4 {
                assert_eq!(line["ok"], true);
                saw_stop_ack = true;
            } else if line["event"] == "generationComplete" {
                break line;
            }
        };
        assert!(saw_rejection && saw_stop_ack);
        assert_eq!(complete["cancelled"], true);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_argument_errors_are_coded() {
        let mut client = Client::start(&Script::with_pieces(&["a"]));

        client.call(1, "loadModel", json!({})).await;
        assert_eq!(client.recv().await["error"]["code"], "MissingArgument");

        client.call(2, "loadModel", json!({ "path": "m.bin" })).await;
        client.recv().await;
        client.call(3, "generate", json!({ "prompt": "x", "temperature": -1 })).await;
        assert_eq!(client.recv().await["error"]["code"], "InvalidArgument");

        client.call(4, "deleteModel", json!({ "filename": "absent.gguf" })).await;
        assert_eq!(client.recv().await["error"]["code"], "ModelNotFound");

        client.shutdown().await;
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_stalled_output_abandons_generation() {
        let dir = TempDir::new().unwrap();
        let script = Script::endless(Duration::from_millis(1));
        let settings = RuntimeSettings {
            models_directory: dir.path().to_path_buf(),
            stream_queue_depth: 64,
            delivery_timeout_ms: 50,
            ..RuntimeSettings::default()
        };
        let facade: &'static RuntimeFacade =
            Box::leak(Box::new(scripted_facade_with(&script, settings)));

        let (mut input, server_input) = tokio::io::duplex(64 * 1024);
        // Room for a few lines only, and nobody reads it.
        let (server_output, _unread) = tokio::io::duplex(256);
        let server = tokio::spawn(serve(facade, server_input, server_output));

        input
            .write_all(b"{\"id\":1,\"method\":\"loadModel\",\"params\":{\"path\":\"m.bin\"}}\n")
            .await
            .unwrap();
        wait_for("load", || facade.status().state == EngineState::Loaded).await;

        input
            .write_all(b"{\"id\":2,\"method\":\"generate\",\"params\":{\"prompt\":\"go\",\"maxTokens\":1000000}}\n")
            .await
            .unwrap();
        wait_for("generation start", || script.generate_calls.load(Ordering::SeqCst) == 1).await;
        wait_for("generation abandoned", || {
            facade.status().state == EngineState::Loaded
        })
        .await;

        let produced = script.computed.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(script.computed.load(Ordering::SeqCst), produced);
        assert!(produced < 10_000, "produced {produced} tokens into a stalled pipe");

        server.abort();
    }

    #[tokio::test]
    async fn test_ensure_model_reports_progress() {
        let mut client = Client::start(&Script::with_pieces(&["a"]));

        client
            .call(
                1,
                "ensureModel",
                json!({ "url": "https://h/tiny.gguf", "filename": "tiny.gguf" }),
            )
            .await;
        let mut progress = Vec::new();
        let done = loop {
            let line = client.recv().await;
            if line["event"] == "modelDownload" {
                progress.push(line["progress"].as_u64().unwrap());
            } else {
                break line;
            }
        };
        assert_eq!(progress.last(), Some(&100));
        assert!(done["ok"]["path"].as_str().unwrap().ends_with("tiny.gguf"));

        client.call(2, "listDownloadedModels", Value::Null).await;
        let listed = client.recv().await;
        assert_eq!(listed["ok"]["models"][0]["filename"], "tiny.gguf");

        client.shutdown().await;
    }
}
