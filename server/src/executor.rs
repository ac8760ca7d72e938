use async_trait::async_trait;
use frontdoor_common::{CommandRequest, CommandResult};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::json;

use crate::failure::RestException;

/// Stream of rows produced by a streamed command.
pub type RowStream = BoxStream<'static, anyhow::Result<serde_json::Value>>;

/// The command execution engine behind the front door.
///
/// Failures are raised as `anyhow::Error`. Wrap a [`RestException`] or a
/// [`StatusError`](crate::failure::StatusError) to control the response;
/// anything else is reported as a generic server error.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// Execute a command and return its result.
    async fn execute(&self, request: &CommandRequest) -> anyhow::Result<CommandResult>;

    /// Execute a command whose results are delivered over a socket session.
    async fn stream(&self, request: &CommandRequest) -> anyhow::Result<RowStream> {
        let result = self.execute(request).await?;
        Ok(stream::once(async move { Ok::<_, anyhow::Error>(result.payload) }).boxed())
    }
}

/// Small executor used when the server runs standalone.
///
/// Supports `status`, `version`, `echo <text>`, `show topics;` and
/// `print <topic>` (streamed).
#[derive(Debug, Clone, Default)]
pub struct BuiltinExecutor {
    topics: Vec<String>,
}

impl BuiltinExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    fn print_topic(&self, request: &CommandRequest, topic: &str) -> anyhow::Result<RowStream> {
        if !self.topics.iter().any(|t| t.eq_ignore_ascii_case(topic)) {
            return Err(RestException::bad_statement(
                format!("Could not find topic '{topic}'"),
                &request.command,
            )
            .into());
        }
        let topic = topic.to_string();
        let rows = (0..3).map(move |offset| Ok::<_, anyhow::Error>(json!({ "topic": topic, "offset": offset })));
        Ok(stream::iter(rows).boxed())
    }
}

/// Command text without its trailing semicolon, split on whitespace.
fn tokens(command: &str) -> Vec<&str> {
    command.trim().trim_end_matches(';').split_whitespace().collect()
}

#[async_trait]
impl CommandExecutor for BuiltinExecutor {
    async fn execute(&self, request: &CommandRequest) -> anyhow::Result<CommandResult> {
        let parts = tokens(&request.command);
        let Some(head) = parts.first() else {
            return Err(RestException::bad_statement("Empty command", &request.command).into());
        };

        let payload = match head.to_ascii_lowercase().as_str() {
            "status" => json!("OK"),
            "version" => json!(env!("CARGO_PKG_VERSION")),
            "echo" => json!(parts[1..].join(" ")),
            "show" if parts.len() == 2 && parts[1].eq_ignore_ascii_case("topics") => {
                json!({ "topics": self.topics })
            }
            "print" => return Err(RestException::query_endpoint(&request.command).into()),
            cmd => {
                return Err(RestException::bad_statement(
                    format!("Unknown command: {cmd}"),
                    &request.command,
                )
                .into())
            }
        };

        Ok(CommandResult::new(&request.command, payload))
    }

    async fn stream(&self, request: &CommandRequest) -> anyhow::Result<RowStream> {
        let parts = tokens(&request.command);
        match parts.as_slice() {
            [head, topic, ..] if head.eq_ignore_ascii_case("print") => {
                self.print_topic(request, topic)
            }
            _ => {
                let result = self.execute(request).await?;
                Ok(stream::once(async move { Ok::<_, anyhow::Error>(result.payload) }).boxed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use frontdoor_common::errors::{ERROR_CODE_BAD_STATEMENT, ERROR_CODE_QUERY_ENDPOINT};
    use futures_util::TryStreamExt;

    use super::*;

    fn rest_failure(err: anyhow::Error) -> RestException {
        err.downcast::<RestException>().expect("domain failure")
    }

    #[tokio::test]
    async fn builtin_commands_return_payloads() {
        let executor = BuiltinExecutor::new().with_topics(["orders"]);

        let status = executor.execute(&CommandRequest::new("status")).await.unwrap();
        assert_eq!(status.payload, json!("OK"));

        let echo = executor.execute(&CommandRequest::new("echo hello there")).await.unwrap();
        assert_eq!(echo.payload, json!("hello there"));

        let topics = executor.execute(&CommandRequest::new("show topics;")).await.unwrap();
        assert_eq!(topics.payload, json!({ "topics": ["orders"] }));
        assert_eq!(topics.statement_text, "show topics;");
    }

    #[tokio::test]
    async fn unknown_command_is_a_bad_statement() {
        let err = BuiltinExecutor::new()
            .execute(&CommandRequest::new("drop everything;"))
            .await
            .unwrap_err();
        let failure = rest_failure(err);
        assert_eq!(failure.response().body.error_code, ERROR_CODE_BAD_STATEMENT);
        assert_eq!(
            failure.response().body.statement_text.as_deref(),
            Some("drop everything;")
        );
    }

    #[tokio::test]
    async fn print_must_be_streamed() {
        let executor = BuiltinExecutor::new().with_topics(["orders"]);
        let err = executor
            .execute(&CommandRequest::new("print orders;"))
            .await
            .unwrap_err();
        assert_eq!(rest_failure(err).response().body.error_code, ERROR_CODE_QUERY_ENDPOINT);

        let rows: Vec<_> = executor
            .stream(&CommandRequest::new("PRINT orders FROM BEGINNING;").streamed())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["topic"], "orders");
    }

    #[tokio::test]
    async fn printing_unknown_topic_fails_before_streaming() {
        let result = BuiltinExecutor::new()
            .stream(&CommandRequest::new("print missing;"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_print_commands_stream_a_single_row() {
        let rows: Vec<_> = BuiltinExecutor::new()
            .stream(&CommandRequest::new("version"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows, vec![json!(env!("CARGO_PKG_VERSION"))]);
    }
}
