//! LLM Worker - the out-of-process model server.
//!
//! Runs as its own process (`deskpilot-worker`) so model crashes never
//! take the agent down. Per connection: verify the pre-shared key frame,
//! read one request, call the model with bounded tokens and low
//! temperature, extract the JSON answer, reply, close.

use serde::{Deserialize, Serialize};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::ipc::{read_frame, write_frame, WorkerRequest, WorkerResponse};
use crate::prompts::build_prompt;

pub const MAX_TOKENS: u32 = 250;
pub const TEMPERATURE: f32 = 0.1;

/// The model behind the worker. The server only needs completions.
pub trait LanguageModel: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Local model endpoint speaking the Ollama generate API.
pub struct OllamaModel {
    endpoint: String,
    model: String,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaModel {
    pub fn new(endpoint: &str, model: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            client,
        })
    }
}

impl LanguageModel for OllamaModel {
    fn complete(&self, prompt: &str) -> Result<String> {
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: TEMPERATURE,
                num_predict: MAX_TOKENS,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&request)
            .send()
            .map_err(|e| AgentError::IpcUnavailable(format!("model endpoint: {}", e)))?;

        let body: OllamaResponse = response
            .json()
            .map_err(|e| AgentError::Parse(format!("model reply: {}", e)))?;
        Ok(body.response)
    }
}

/// Extract the first balanced JSON object or array from model text -
/// whichever opener appears first wins.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }

    None
}

/// The worker's request handler plus its accept loop.
pub struct WorkerServer<M: LanguageModel> {
    model: M,
    auth_key: Vec<u8>,
    app_context_limit: usize,
}

impl<M: LanguageModel> WorkerServer<M> {
    pub fn new(model: M, auth_key: &[u8]) -> Self {
        Self {
            model,
            auth_key: auth_key.to_vec(),
            app_context_limit: 2000,
        }
    }

    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        eprintln!(
            "[Worker] listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.handle_connection(stream) {
                        eprintln!("[Worker] connection error: {}", e);
                    }
                }
                Err(e) => eprintln!("[Worker] accept error: {}", e),
            }
        }
        Ok(())
    }

    pub fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .and_then(|_| stream.set_write_timeout(Some(Duration::from_secs(10))))
            .map_err(|e| AgentError::Internal(e.to_string()))?;

        let presented_key = read_frame(&mut stream)?;
        if presented_key != self.auth_key {
            // No reply for a bad key; just drop the connection.
            return Err(AgentError::Policy("worker auth key mismatch".to_string()));
        }

        let request_bytes = read_frame(&mut stream)?;
        let request: WorkerRequest = serde_json::from_slice(&request_bytes)?;

        let response = self.handle_request(&request);
        let payload = serde_json::to_vec(&response)?;
        write_frame(&mut stream, &payload)?;
        Ok(())
    }

    pub fn handle_request(&self, request: &WorkerRequest) -> WorkerResponse {
        let mut app_context = request.app_context.clone();
        if app_context.len() > self.app_context_limit {
            let mut cut = self.app_context_limit;
            while !app_context.is_char_boundary(cut) {
                cut -= 1;
            }
            app_context.truncate(cut);
        }

        let prompt = build_prompt(&request.prompt, &app_context);

        let text = match self.model.complete(&prompt) {
            Ok(text) => text.trim().to_string(),
            Err(e) => return WorkerResponse::failure(e.to_string(), None),
        };

        match extract_json(&text) {
            Some(parsed) => WorkerResponse::ok(parsed, text),
            None => WorkerResponse::failure("No valid JSON in response".to_string(), Some(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedModel(String);

    impl LanguageModel for CannedModel {
        fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_extract_object() {
        let value = extract_json("Sure: {\"intent\": \"open\", \"target\": \"chrome\"} done").unwrap();
        assert_eq!(value["intent"], "open");
    }

    #[test]
    fn test_extract_array() {
        let value = extract_json("[{\"intent\": \"create_folder\"}, {\"intent\": \"create_file\"}]")
            .unwrap();
        assert!(value.is_array());
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_first_opener_wins() {
        // The array opens first even though an object follows
        let value = extract_json("noise [1, 2] and then {\"a\": 1}").unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let value = extract_json("{\"param\": \"curly } inside\", \"intent\": \"macro\"}").unwrap();
        assert_eq!(value["param"], "curly } inside");
    }

    #[test]
    fn test_no_json_is_none() {
        assert!(extract_json("I cannot help with that.").is_none());
        assert!(extract_json("{broken json").is_none());
    }

    #[test]
    fn test_handle_request_success() {
        let server = WorkerServer::new(
            CannedModel("{\"intent\": \"open\", \"target\": \"chrome\"}".to_string()),
            b"key",
        );
        let response = server.handle_request(&WorkerRequest {
            prompt: "افتح كروم".to_string(),
            app_context: "chrome".to_string(),
        });

        assert!(response.success);
        assert_eq!(response.response.unwrap()["target"], "chrome");
    }

    #[test]
    fn test_handle_request_parse_failure_keeps_raw_text() {
        let server = WorkerServer::new(CannedModel("sorry, no JSON today".to_string()), b"key");
        let response = server.handle_request(&WorkerRequest {
            prompt: "x".to_string(),
            app_context: String::new(),
        });

        assert!(!response.success);
        assert_eq!(response.raw_text.as_deref(), Some("sorry, no JSON today"));
    }
}
